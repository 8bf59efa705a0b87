//! The unprivileged caller's view of the broker.
//!
//! A [`BrokerHandle`] owns the control channel for its whole lifetime and
//! closes it exactly once. The channel carries both synchronous open replies
//! and asynchronous relay bytes; the `&mut self` receivers plus
//! single-threaded relay dispatch are what keep the two from interleaving,
//! so never have an open in flight while the event loop may read the
//! channel.

use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::path::Path;

use socket2::Socket;
use tracing::debug;
use tracing::warn;

use crate::error::BrokerError;
use crate::error::Result;
use crate::protocol::CMD_KILL;
use crate::protocol::Command;
use crate::protocol::RESP_ERR;
use crate::protocol::RESP_OK;
use crate::protocol::RelayEvent;
use crate::socket;

/// How long deinit waits for the kill ack. Reaping the broker process is
/// what actually guarantees it is gone; this only bounds the handshake.
const KILL_ACK_TIMEOUT_MS: libc::c_int = 1000;

struct RelayCallbacks {
    on_activate: Box<dyn FnMut()>,
    on_deactivate: Box<dyn FnMut()>,
}

pub struct BrokerHandle {
    channel: Option<Socket>,
    broker_pid: Option<libc::pid_t>,
    callbacks: Option<RelayCallbacks>,
    tty_init_sent: bool,
}

impl BrokerHandle {
    pub(crate) fn new(channel: Socket, broker_pid: Option<libc::pid_t>) -> Self {
        Self {
            channel: Some(channel),
            broker_pid,
            callbacks: None,
            tty_init_sent: false,
        }
    }

    /// Wraps one end of a socketpair whose other end is served by an
    /// in-process [`Broker`](crate::Broker). There is no broker process to
    /// reap, so deinit stops after the kill handshake.
    pub fn from_channel(channel: Socket) -> Self {
        Self::new(channel, None)
    }

    /// Asks the broker to open `path` and transfer the descriptor.
    ///
    /// Blocks until the reply arrives; there is no timeout and at most one
    /// open may be in flight. A reply without a descriptor attached means
    /// the broker refused the request (policy, exhausted grants, or the
    /// `open(2)` itself failing); the channel dying under the call is a
    /// [`BrokerError::Transport`].
    pub fn open(&mut self, path: &Path, flags: i32) -> Result<OwnedFd> {
        let wire = Command::open(path, flags).encode()?;
        let channel = self.channel()?;
        channel
            .send(&wire)
            .map_err(BrokerError::Transport)?;
        let (reply, fd) = socket::recv_message(channel).map_err(BrokerError::Transport)?;
        if reply.is_empty() {
            return Err(BrokerError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "broker closed the control channel",
            )));
        }
        match (reply[0], fd) {
            (RESP_OK, Some(fd)) => Ok(fd),
            (RESP_ERR, None) => Err(BrokerError::PolicyDenied),
            (byte, _) => Err(BrokerError::Protocol(format!(
                "unexpected open reply {byte:#04x}"
            ))),
        }
    }

    /// Registers the session switch callbacks and starts VT relay.
    ///
    /// Idempotent: only the first call registers callbacks and sends the
    /// broker-side command. Register [`Self::channel_fd`] with the event
    /// loop and call [`Self::dispatch_relay`] whenever it reports the
    /// channel readable.
    pub fn tty_init(
        &mut self,
        on_activate: impl FnMut() + 'static,
        on_deactivate: impl FnMut() + 'static,
    ) -> Result<()> {
        if self.tty_init_sent {
            debug!("tty relay already initialized");
            return Ok(());
        }
        self.tty_init_sent = true;
        self.callbacks = Some(RelayCallbacks {
            on_activate: Box::new(on_activate),
            on_deactivate: Box::new(on_deactivate),
        });
        let wire = Command::TtyInit.encode()?;
        self.channel()?
            .send(&wire)
            .map_err(BrokerError::Transport)?;
        Ok(())
    }

    /// The descriptor to register (read interest) with the caller's event
    /// loop once relay is initialized.
    pub fn channel_fd(&self) -> Result<BorrowedFd<'_>> {
        Ok(self.channel()?.as_fd())
    }

    /// Reads one relay byte and invokes the matching callback. Call only
    /// when the channel is readable and no open is in flight.
    pub fn dispatch_relay(&mut self) -> Result<RelayEvent> {
        let channel = self.channel()?;
        let (message, _fd) = socket::recv_message(channel).map_err(BrokerError::Transport)?;
        if message.is_empty() {
            return Err(BrokerError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "broker closed the control channel",
            )));
        }
        let event = RelayEvent::from_byte(message[0]).ok_or_else(|| {
            BrokerError::Protocol(format!("unexpected relay byte {:#04x}", message[0]))
        })?;
        if let Some(callbacks) = &mut self.callbacks {
            match event {
                RelayEvent::Activated => (callbacks.on_activate)(),
                RelayEvent::Deactivated => (callbacks.on_deactivate)(),
            }
        }
        Ok(event)
    }

    /// Stops the broker: kill handshake with a bounded wait, close the
    /// channel, then signal and reap the broker process so no zombie
    /// remains. Safe to call more than once; also runs on drop.
    pub fn deinit(&mut self) {
        if let Some(channel) = self.channel.take() {
            let wire = [CMD_KILL, 0];
            match channel.send(&wire) {
                Ok(_) => {
                    if wait_readable(&channel, KILL_ACK_TIMEOUT_MS) {
                        let _ = socket::recv_message(&channel);
                    } else {
                        debug!("no kill ack within {KILL_ACK_TIMEOUT_MS}ms");
                    }
                }
                Err(err) => debug!("kill send failed: {err}"),
            }
        }
        if let Some(pid) = self.broker_pid.take() {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            reap(pid);
        }
    }

    fn channel(&self) -> Result<&Socket> {
        self.channel.as_ref().ok_or_else(|| {
            BrokerError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "control channel already closed",
            ))
        })
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.deinit();
    }
}

fn wait_readable(channel: &Socket, timeout_ms: libc::c_int) -> bool {
    let mut fds = [libc::pollfd {
        fd: channel.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if rc < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return rc > 0 && fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0;
    }
}

/// Blocks until the broker is gone; only the kill handshake before it is
/// bounded.
pub(crate) fn reap(pid: libc::pid_t) {
    loop {
        let rc = unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
        if rc == pid {
            debug!(pid, "broker reaped");
            return;
        }
        let err = io::Error::last_os_error();
        if rc == -1 && err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        warn!(pid, "waitpid failed: {err}");
        return;
    }
}
