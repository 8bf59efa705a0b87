use std::io;

use thiserror::Error;

/// Errors raised by the device broker.
///
/// `Transport` and `Protocol` are fatal to the side that observes them: the
/// broker terminates its loop and the caller must treat the broker as gone.
/// `PolicyDenied` and `DrmGrantsExhausted` fail a single open request while
/// the broker keeps running. `Os` covers the process/signal/ioctl plumbing.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("control channel transport failure: {0}")]
    Transport(#[source] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("open request denied by device policy")]
    PolicyDenied,

    #[error("all drm descriptor grants are in use")]
    DrmGrantsExhausted,

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        source: io::Error,
    },

    #[error(transparent)]
    Vt(#[from] veldt_vt::VtError),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    pub(crate) fn os(op: &'static str) -> Self {
        BrokerError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}
