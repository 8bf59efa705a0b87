//! Privilege-separated device broker.
//!
//! The display server cannot run as root, but DRM nodes, evdev input nodes
//! and virtual terminals are root-only to open. [`spawn`] forks before the
//! caller gives up its privileges: the child keeps them and serves a small
//! command protocol ([`Broker`]), the parent immediately drops to the real
//! uid/gid and talks to the child through a [`BrokerHandle`]. Besides
//! opening devices, the broker owns the VT and relays session activate /
//! deactivate notifications back over the same channel so rendering can be
//! paused while another console is foreground.

mod client;
mod error;
mod policy;
mod protocol;
mod server;
mod socket;

use tracing::error;

pub use crate::client::BrokerHandle;
pub use crate::error::BrokerError;
pub use crate::error::Result;
pub use crate::policy::DRM_MAJOR;
pub use crate::policy::DeviceClass;
pub use crate::policy::INPUT_MAJOR;
pub use crate::policy::classify_major;
pub use crate::protocol::ALLOWED_OPEN_FLAGS;
pub use crate::protocol::Command;
pub use crate::protocol::MAX_MESSAGE;
pub use crate::protocol::RelayEvent;
pub use crate::server::Broker;

/// Which side of the privilege boundary this process is after
/// [`split_roles`].
pub enum Role {
    /// The forked child: still privileged, must run the broker loop and
    /// exit without returning to caller code.
    Broker(Broker),
    /// The original process: privileges already dropped, talks to the
    /// broker through the handle.
    Caller(BrokerHandle),
}

/// Creates the control channel and forks. The parent drops privileges
/// before anything else runs in it; the child keeps them.
///
/// Prefer [`spawn`] unless you need to drive the broker role yourself (the
/// tests run [`Broker`] on a thread over a plain socketpair instead of
/// forking).
pub fn split_roles() -> Result<Role> {
    let (caller_end, broker_end) =
        socket::control_channel_pair().map_err(|source| BrokerError::Os {
            op: "socketpair",
            source,
        })?;
    match unsafe { libc::fork() } {
        -1 => Err(BrokerError::os("fork")),
        0 => {
            drop(caller_end);
            // The child must never escape into caller code, not even on a
            // setup failure.
            match Broker::new(broker_end) {
                Ok(broker) => Ok(Role::Broker(broker)),
                Err(err) => {
                    error!("broker setup failed: {err}");
                    std::process::exit(1);
                }
            }
        }
        pid => {
            drop(broker_end);
            if let Err(err) = drop_privileges() {
                // A caller that could not shed privileges must not keep a
                // privileged broker around, nor leave it as a zombie.
                terminate_broker(pid);
                return Err(err);
            }
            Ok(Role::Caller(BrokerHandle::new(caller_end, Some(pid))))
        }
    }
}

/// Forks off the broker and returns the caller's handle. The child never
/// returns: it serves commands until killed and then exits.
pub fn spawn() -> Result<BrokerHandle> {
    match split_roles()? {
        Role::Caller(handle) => Ok(handle),
        Role::Broker(mut broker) => {
            let code = match broker.run() {
                Ok(()) => 0,
                Err(err) => {
                    error!("broker terminated: {err}");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

/// Kills and reaps an already-forked broker that the caller cannot use.
fn terminate_broker(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    client::reap(pid);
}

/// Drops effective privileges to the real uid/gid. Group first: once the
/// uid is gone, setgid would no longer be permitted.
fn drop_privileges() -> Result<()> {
    if unsafe { libc::setgid(libc::getgid()) } != 0 {
        return Err(BrokerError::os("setgid"));
    }
    if unsafe { libc::setuid(libc::getuid()) } != 0 {
        return Err(BrokerError::os("setuid"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::drop_privileges;
    use super::terminate_broker;

    #[test]
    fn dropping_to_the_real_ids_always_succeeds() {
        // Unprivileged this is a no-op (setuid to our own uid); as root it
        // is the real drop. Either way it must not fail.
        drop_privileges().unwrap();
        drop_privileges().unwrap();
    }

    #[test]
    fn terminating_an_unusable_broker_leaves_no_zombie() {
        match unsafe { libc::fork() } {
            -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
            0 => loop {
                // Stand in for a broker the parent cannot talk to.
                unsafe { libc::pause() };
            },
            pid => {
                terminate_broker(pid);
                let rc =
                    unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
                let err = std::io::Error::last_os_error();
                assert_eq!(rc, -1);
                assert_eq!(err.raw_os_error(), Some(libc::ECHILD));
            }
        }
    }
}
