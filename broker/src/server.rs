//! The privileged side of the broker: a blocking command loop multiplexed
//! over the control channel and the VT notification pipe.
//!
//! All broker state lives on [`Broker`] so the loop can be exercised in
//! tests over an injected socketpair, without a fork and without privileges.

use std::ffi::CString;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use socket2::Socket;
use tracing::debug;
use tracing::warn;
use veldt_vt::SessionState;
use veldt_vt::VtSession;

use crate::error::BrokerError;
use crate::error::Result;
use crate::policy;
use crate::policy::DeviceClass;
use crate::protocol::Command;
use crate::protocol::RELAY_ACTIVATED;
use crate::protocol::RELAY_DEACTIVATED;
use crate::protocol::RESP_ERR;
use crate::protocol::RESP_OK;
use crate::protocol::RelayEvent;
use crate::socket;

/// Upper bound on DRM descriptors handed out at once; the 17th open of a
/// DRM node is refused until a release revokes the outstanding grants.
const MAX_DRM_GRANTS: usize = 16;

const DRM_IOCTL_DROP_MASTER: libc::c_ulong = 0x641f;

/// DRM descriptors the broker has handed to the caller, kept as dups so
/// mastership can be revoked when the session deactivates.
struct DrmGrants {
    fds: Vec<OwnedFd>,
}

impl DrmGrants {
    fn new() -> Self {
        Self { fds: Vec::new() }
    }

    fn outstanding(&self) -> usize {
        self.fds.len()
    }

    fn try_grant(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        if self.fds.len() >= MAX_DRM_GRANTS {
            return Err(BrokerError::DrmGrantsExhausted);
        }
        let dup = fd
            .try_clone_to_owned()
            .map_err(|source| BrokerError::Os { op: "dup", source })?;
        self.fds.push(dup);
        Ok(())
    }

    /// Drops DRM master on every grant and closes it. Revocation is best
    /// effort; the close alone already severs our copy.
    fn revoke_all(&mut self) {
        for fd in self.fds.drain(..) {
            if unsafe { libc::ioctl(fd.as_raw_fd(), DRM_IOCTL_DROP_MASTER) } != 0 {
                debug!(
                    "DRM_IOCTL_DROP_MASTER failed: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Readiness {
    channel: bool,
    channel_hup: bool,
    notifications: bool,
}

/// The privileged command loop. Runs in the forked child, which keeps the
/// original uid while the caller drops its own.
pub struct Broker {
    channel: Socket,
    notify_rd: OwnedFd,
    notify_wr: OwnedFd,
    grants: DrmGrants,
    state: SessionState,
    session: Option<VtSession>,
    tty_initialized: bool,
}

impl Broker {
    pub fn new(channel: Socket) -> Result<Self> {
        let (notify_rd, notify_wr) = notification_pipe()?;
        Ok(Self {
            channel,
            notify_rd,
            notify_wr,
            grants: DrmGrants::new(),
            state: SessionState::Inactive,
            session: None,
            tty_initialized: false,
        })
    }

    /// Services commands until the peer closes the channel, a kill arrives,
    /// or a fatal transport/protocol error. The console is restored on
    /// every exit path.
    pub fn run(&mut self) -> Result<()> {
        let result = self.serve();
        self.restore_console();
        result
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            let ready = self.wait_readable()?;
            if ready.notifications {
                self.drain_notifications()?;
            }
            if ready.channel {
                if let Flow::Stop = self.handle_command()? {
                    return Ok(());
                }
            } else if ready.channel_hup {
                debug!("peer closed the control channel");
                return Ok(());
            }
        }
    }

    fn wait_readable(&self) -> Result<Readiness> {
        let mut fds = [
            libc::pollfd {
                fd: self.channel.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.notify_rd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(BrokerError::Os {
                op: "poll",
                source: err,
            });
        }
        let bad = libc::POLLERR | libc::POLLNVAL;
        if (fds[0].revents | fds[1].revents) & bad != 0 {
            return Err(BrokerError::Transport(io::Error::other(
                "control descriptor failed",
            )));
        }
        if fds[1].revents & libc::POLLHUP != 0 {
            return Err(BrokerError::Transport(io::Error::other(
                "notification pipe hangup",
            )));
        }
        Ok(Readiness {
            channel: fds[0].revents & libc::POLLIN != 0,
            channel_hup: fds[0].revents & libc::POLLHUP != 0,
            notifications: fds[1].revents & libc::POLLIN != 0,
        })
    }

    /// Reads the tag bytes queued by the signal handlers and applies them.
    /// Several may have coalesced in the pipe.
    fn drain_notifications(&mut self) -> Result<()> {
        let mut buf = [0u8; 64];
        let n = unsafe {
            libc::read(
                self.notify_rd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n <= 0 {
            return Err(BrokerError::os("read"));
        }
        for &tag in &buf[..n as usize] {
            self.relay_switch(tag)?;
        }
        Ok(())
    }

    /// State-guards one switch notification and forwards the byte verbatim
    /// to the caller when a transition actually happened.
    fn relay_switch(&mut self, tag: u8) -> Result<()> {
        match RelayEvent::from_byte(tag) {
            Some(RelayEvent::Activated) => {
                if !self.state.on_acquire() {
                    return Ok(());
                }
                debug!("session activated");
            }
            Some(RelayEvent::Deactivated) => {
                if !self.state.on_release() {
                    return Ok(());
                }
                debug!(
                    grants = self.grants.outstanding(),
                    "session deactivated, revoking drm grants"
                );
                self.grants.revoke_all();
                if let Some(session) = &self.session {
                    if let Err(err) = session.ack_release() {
                        warn!("release ack failed: {err}");
                    }
                }
            }
            None => {
                return Err(BrokerError::Protocol(format!(
                    "unexpected notification byte {tag:#04x}"
                )));
            }
        }
        socket::send_message(&self.channel, &[tag], None).map_err(BrokerError::Transport)
    }

    fn handle_command(&mut self) -> Result<Flow> {
        let (message, fd) = socket::recv_message(&self.channel).map_err(BrokerError::Transport)?;
        // Commands never carry descriptors.
        drop(fd);
        if message.is_empty() {
            debug!("clean end of stream");
            return Ok(Flow::Stop);
        }
        let command = Command::parse(&message)?;
        debug!(?command, "processing command");
        match command {
            Command::Kill => {
                // Ack so the caller's bounded deinit wait can observe the
                // shutdown before it reaps us.
                if let Err(err) = socket::send_message(&self.channel, &[RESP_OK], None) {
                    warn!("kill ack failed: {err}");
                }
                Ok(Flow::Stop)
            }
            Command::TtyInit => {
                self.handle_tty_init()?;
                Ok(Flow::Continue)
            }
            Command::Open { flags, path } => {
                self.handle_open(flags, &path)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn handle_open(&mut self, flags: i32, path: &Path) -> Result<()> {
        match self.vet_and_open(flags, path) {
            Ok(fd) => {
                // The dup in the grant table is the only copy that may
                // outlive this scope; ours closes right after the send.
                socket::send_message(&self.channel, &[RESP_OK], Some(fd.as_fd()))
                    .map_err(BrokerError::Transport)
            }
            Err(err) => {
                warn!("open {} denied: {err}", path.display());
                socket::send_message(&self.channel, &[RESP_ERR], None)
                    .map_err(BrokerError::Transport)
            }
        }
    }

    fn vet_and_open(&mut self, flags: i32, path: &Path) -> Result<OwnedFd> {
        if flags & !crate::protocol::ALLOWED_OPEN_FLAGS != 0 {
            return Err(BrokerError::PolicyDenied);
        }
        // 0700, and only when creation was actually requested.
        let mode: libc::c_uint = if flags & libc::O_CREAT != 0 { 0o700 } else { 0 };
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| BrokerError::Protocol("path contains an interior NUL".to_string()))?;

        let fd = unsafe { libc::open(cpath.as_ptr(), flags, mode) };
        if fd < 0 {
            return Err(BrokerError::os("open"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
            return Err(BrokerError::os("fstat"));
        }
        match policy::classify_rdev(st.st_rdev) {
            DeviceClass::Input => Ok(fd),
            DeviceClass::Drm => {
                self.grants.try_grant(fd.as_fd())?;
                Ok(fd)
            }
            DeviceClass::Disallowed => Err(BrokerError::PolicyDenied),
        }
    }

    fn handle_tty_init(&mut self) -> Result<()> {
        if self.tty_initialized {
            debug!("ignoring repeated tty init");
            return Ok(());
        }
        self.tty_initialized = true;
        let Some(vt) = veldt_vt::controlling_vt() else {
            debug!("no controlling vt, session switching stays off");
            return Ok(());
        };
        let session = VtSession::open(vt)?;
        session.install_switch_handlers(
            self.notify_wr.as_raw_fd(),
            RELAY_ACTIVATED,
            RELAY_DEACTIVATED,
        )?;
        if vt != 0 {
            // The session is already foreground; route the initial
            // activation through the normal notification path.
            self.notify(RELAY_ACTIVATED)?;
        } else {
            // A freshly allocated VT is not foreground yet; switching to
            // it makes the kernel deliver the first acquire signal.
            session.activate()?;
        }
        self.session = Some(session);
        Ok(())
    }

    fn notify(&self, tag: u8) -> Result<()> {
        let buf = [tag];
        let n = unsafe { libc::write(self.notify_wr.as_raw_fd(), buf.as_ptr().cast(), 1) };
        if n != 1 {
            return Err(BrokerError::os("write"));
        }
        Ok(())
    }

    fn restore_console(&mut self) {
        if let Some(session) = &self.session {
            if let Err(err) = session.restore() {
                warn!("console restore failed: {err}");
            }
        }
    }
}

fn notification_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(BrokerError::os("pipe2"));
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fds[0]) }, unsafe {
        OwnedFd::from_raw_fd(fds[1])
    }))
}
