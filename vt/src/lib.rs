//! Linux virtual-terminal session handling for the device broker.
//!
//! The broker process owns one VT for the lifetime of the session. The kernel
//! hands the VT over (acquire) and asks for it back (release) via the signals
//! configured with `VT_SETMODE`; the signal handlers here do nothing but write
//! a single caller-chosen tag byte to a notification pipe, so every real
//! decision happens in the broker's main loop.

use std::ffi::CStr;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use thiserror::Error;
use tracing::debug;
use tracing::warn;

// <linux/vt.h> and <linux/kd.h>; libc does not expose these.
const VT_OPENQRY: libc::c_ulong = 0x5600;
const VT_GETMODE: libc::c_ulong = 0x5601;
const VT_SETMODE: libc::c_ulong = 0x5602;
const VT_GETSTATE: libc::c_ulong = 0x5603;
const VT_RELDISP: libc::c_ulong = 0x5605;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;
const VT_ACKACQ: libc::c_long = 0x02;
const VT_PROCESS: libc::c_char = 0x01;

const KDSETMODE: libc::c_ulong = 0x4b3a;
const KD_TEXT: libc::c_long = 0x00;
const KD_GRAPHICS: libc::c_long = 0x01;

#[repr(C)]
struct VtMode {
    mode: libc::c_char,
    waitv: libc::c_char,
    relsig: libc::c_short,
    acqsig: libc::c_short,
    frsig: libc::c_short,
}

#[repr(C)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

#[derive(Debug, Error)]
pub enum VtError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("{op} ioctl failed: {source}")]
    Ioctl {
        op: &'static str,
        source: io::Error,
    },
    #[error("failed to install vt switch signal handlers: {0}")]
    Signal(#[source] io::Error),
}

/// Whether the session currently owns the foreground VT.
///
/// The kernel may deliver the same switch signal more than once; transitions
/// are monotonic per signal, so a repeated acquire while `Active` (or release
/// while `Inactive`) is a no-op and must not be relayed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Active,
}

impl SessionState {
    /// Returns true when the transition happened and an event should be
    /// relayed.
    pub fn on_acquire(&mut self) -> bool {
        match self {
            SessionState::Inactive => {
                *self = SessionState::Active;
                true
            }
            SessionState::Active => false,
        }
    }

    pub fn on_release(&mut self) -> bool {
        match self {
            SessionState::Active => {
                *self = SessionState::Inactive;
                true
            }
            SessionState::Inactive => false,
        }
    }
}

// Signal handler state. One VT session per process; set once by
// `install_switch_handlers` before the signals are unblocked.
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);
static ACQUIRE_TAG: AtomicU8 = AtomicU8::new(0);
static RELEASE_TAG: AtomicU8 = AtomicU8::new(0);

extern "C" fn on_acquire_signal(_sig: libc::c_int) {
    write_tag(ACQUIRE_TAG.load(Ordering::Relaxed));
}

extern "C" fn on_release_signal(_sig: libc::c_int) {
    write_tag(RELEASE_TAG.load(Ordering::Relaxed));
}

/// The only work allowed in signal context: one `write(2)` of one byte.
fn write_tag(tag: u8) {
    let fd = NOTIFY_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let buf = [tag];
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), 1);
    }
}

/// The VT this process will render on.
///
/// Opening VT 0 means "no concrete VT yet": query the console for a free VT
/// via `/dev/tty1` and remember which VT was foreground so it can be restored
/// at teardown. Opening a concrete VT leaves the restore target equal to the
/// session VT, which makes `restore` a no-op.
pub struct VtSession {
    fd: OwnedFd,
    num: u32,
    orig: u32,
}

impl VtSession {
    pub fn open(num: u32) -> Result<Self, VtError> {
        let (num, orig) = if num == 0 {
            let probe = open_vt_device(1, libc::O_RDWR | libc::O_NOCTTY)?;
            let free = vt_open_query(&probe)?;
            let orig = vt_active(&probe)?;
            debug!(free, orig, "allocated a fresh vt");
            (free, orig)
        } else {
            (num, num)
        };

        let fd = open_vt_device(num, libc::O_RDWR | libc::O_CLOEXEC)?;
        kd_set_mode(&fd, KD_GRAPHICS)?;
        Ok(Self { fd, num, orig })
    }

    pub fn number(&self) -> u32 {
        self.num
    }

    /// Puts the VT into process-controlled switch mode: the kernel sends
    /// `SIGUSR1` when it grants the VT and `SIGUSR2` when it wants it back,
    /// and the handlers write `acquire_tag`/`release_tag` to `notify_fd`.
    pub fn install_switch_handlers(
        &self,
        notify_fd: RawFd,
        acquire_tag: u8,
        release_tag: u8,
    ) -> Result<(), VtError> {
        NOTIFY_FD.store(notify_fd, Ordering::Relaxed);
        ACQUIRE_TAG.store(acquire_tag, Ordering::Relaxed);
        RELEASE_TAG.store(release_tag, Ordering::Relaxed);

        install_handler(libc::SIGUSR1, on_acquire_signal)?;
        install_handler(libc::SIGUSR2, on_release_signal)?;

        let mut mode: VtMode = unsafe { std::mem::zeroed() };
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), VT_GETMODE, &mut mode) } != 0 {
            return Err(ioctl_err("VT_GETMODE"));
        }
        mode.mode = VT_PROCESS;
        mode.acqsig = libc::SIGUSR1 as libc::c_short;
        mode.relsig = libc::SIGUSR2 as libc::c_short;
        mode.frsig = 0;
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), VT_SETMODE, &mode) } != 0 {
            return Err(ioctl_err("VT_SETMODE"));
        }
        Ok(())
    }

    /// Switches the console to the session VT and waits for the switch to
    /// complete.
    pub fn activate(&self) -> Result<(), VtError> {
        debug!(vt = self.num, "activating session vt");
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), VT_ACTIVATE, self.num as libc::c_long) } != 0 {
            return Err(ioctl_err("VT_ACTIVATE"));
        }
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), VT_WAITACTIVE, self.num as libc::c_long) } != 0
        {
            return Err(ioctl_err("VT_WAITACTIVE"));
        }
        Ok(())
    }

    /// Tells the kernel the release was honored so the console switch can
    /// complete. Must follow every acted-upon release signal.
    pub fn ack_release(&self) -> Result<(), VtError> {
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), VT_RELDISP, VT_ACKACQ) } != 0 {
            return Err(ioctl_err("VT_RELDISP"));
        }
        Ok(())
    }

    /// Leaves graphics mode and, when we allocated a fresh VT and still hold
    /// the foreground, switches back to the VT that was active before us.
    pub fn restore(&self) -> Result<(), VtError> {
        kd_set_mode(&self.fd, KD_TEXT)?;

        let current = vt_active(&self.fd)?;
        if current != self.num || current == self.orig {
            return Ok(());
        }
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), VT_ACTIVATE, self.orig as libc::c_long) } != 0
        {
            return Err(ioctl_err("VT_ACTIVATE"));
        }
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), VT_WAITACTIVE, self.orig as libc::c_long) }
            != 0
        {
            return Err(ioctl_err("VT_WAITACTIVE"));
        }
        Ok(())
    }
}

/// The VT attached to this process's controlling terminal, if any.
///
/// `Some(0)` means stdin is the console multiplexer (`/dev/tty` or
/// `/dev/tty0`) and a concrete VT still has to be allocated; `None` means
/// stdin is not a VT at all (a pty, a serial port, a pipe), in which case VT
/// handling stays off entirely.
pub fn controlling_vt() -> Option<u32> {
    if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
        return None;
    }
    let mut buf = [0 as libc::c_char; 128];
    if unsafe { libc::ttyname_r(libc::STDIN_FILENO, buf.as_mut_ptr(), buf.len()) } != 0 {
        warn!("ttyname_r failed on stdin");
        return None;
    }
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_str().ok()?;
    vt_number(name)
}

fn vt_number(name: &str) -> Option<u32> {
    let ordinal = name.strip_prefix("/dev/tty")?;
    if ordinal.is_empty() {
        return Some(0);
    }
    ordinal.parse().ok()
}

fn open_vt_device(num: u32, flags: libc::c_int) -> Result<OwnedFd, VtError> {
    let path = format!("/dev/tty{num}\0");
    let fd = unsafe { libc::open(path.as_ptr().cast(), flags) };
    if fd < 0 {
        return Err(VtError::Open {
            path: format!("/dev/tty{num}"),
            source: io::Error::last_os_error(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn vt_open_query(fd: &OwnedFd) -> Result<u32, VtError> {
    let mut num: libc::c_int = -1;
    if unsafe { libc::ioctl(fd.as_raw_fd(), VT_OPENQRY, &mut num) } != 0 || num <= 0 {
        return Err(ioctl_err("VT_OPENQRY"));
    }
    Ok(num as u32)
}

fn vt_active(fd: &OwnedFd) -> Result<u32, VtError> {
    let mut st: VtStat = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd.as_raw_fd(), VT_GETSTATE, &mut st) } != 0 {
        return Err(ioctl_err("VT_GETSTATE"));
    }
    Ok(st.v_active as u32)
}

fn kd_set_mode(fd: &OwnedFd, mode: libc::c_long) -> Result<(), VtError> {
    if unsafe { libc::ioctl(fd.as_raw_fd(), KDSETMODE, mode) } != 0 {
        return Err(ioctl_err("KDSETMODE"));
    }
    Ok(())
}

fn install_handler(sig: libc::c_int, handler: extern "C" fn(libc::c_int)) -> Result<(), VtError> {
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_RESTART;
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };
    if unsafe { libc::sigaction(sig, &sa, std::ptr::null_mut()) } != 0 {
        return Err(VtError::Signal(io::Error::last_os_error()));
    }
    Ok(())
}

fn ioctl_err(op: &'static str) -> VtError {
    VtError::Ioctl {
        op,
        source: io::Error::last_os_error(),
    }
}
