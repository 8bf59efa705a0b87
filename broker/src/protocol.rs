//! Wire protocol of the control channel.
//!
//! Commands travel caller -> broker as short NUL-terminated ASCII datagrams:
//! `o <flags> <path>\0`, `t\0`, `k\0`. Replies to `Open` are one payload byte
//! (`t` ok, `f` err) with the descriptor attached as ancillary data on
//! success. VT relay notifications are a single byte (`a`/`d`) pushed by the
//! broker on the same channel.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use crate::error::BrokerError;
use crate::error::Result;

pub const CMD_OPEN: u8 = b'o';
pub const CMD_TTY_INIT: u8 = b't';
pub const CMD_KILL: u8 = b'k';

pub const RESP_OK: u8 = b't';
pub const RESP_ERR: u8 = b'f';

pub const RELAY_ACTIVATED: u8 = b'a';
pub const RELAY_DEACTIVATED: u8 = b'd';

/// Commands and relay bytes both fit this bound; anything longer is a
/// protocol violation.
pub const MAX_MESSAGE: usize = 16 + libc::PATH_MAX as usize;

/// The open flags the broker will honor. Any other bit rejects the request
/// before the path is looked at.
pub const ALLOWED_OPEN_FLAGS: i32 =
    libc::O_ACCMODE | libc::O_NONBLOCK | libc::O_CREAT | libc::O_CLOEXEC;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open { flags: i32, path: PathBuf },
    TtyInit,
    Kill,
}

impl Command {
    pub fn open(path: &Path, flags: i32) -> Self {
        Command::Open {
            flags,
            path: path.to_path_buf(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = match self {
            Command::Open { flags, path } => {
                let path = path_bytes(path)?;
                let mut out = format!("{} {flags} ", CMD_OPEN as char).into_bytes();
                out.extend_from_slice(path);
                out
            }
            Command::TtyInit => vec![CMD_TTY_INIT],
            Command::Kill => vec![CMD_KILL],
        };
        out.push(0);
        if out.len() > MAX_MESSAGE {
            return Err(BrokerError::Protocol(format!(
                "command of {} bytes exceeds the {MAX_MESSAGE} byte limit",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Parses one received datagram. Any malformed input is a
    /// [`BrokerError::Protocol`], which the broker treats as fatal.
    pub fn parse(buf: &[u8]) -> Result<Command> {
        let Some((&0, body)) = buf.split_last() else {
            return Err(BrokerError::Protocol(
                "command datagram is not NUL-terminated".to_string(),
            ));
        };
        match body.first() {
            Some(&CMD_KILL) if body.len() == 1 => Ok(Command::Kill),
            Some(&CMD_TTY_INIT) if body.len() == 1 => Ok(Command::TtyInit),
            Some(&CMD_OPEN) => parse_open(&body[1..]),
            Some(&cmd) => Err(BrokerError::Protocol(format!(
                "unknown command byte {:?}",
                cmd as char
            ))),
            None => Err(BrokerError::Protocol("empty command".to_string())),
        }
    }
}

fn parse_open(args: &[u8]) -> Result<Command> {
    let malformed = || BrokerError::Protocol("malformed open command".to_string());
    let args = args.strip_prefix(b" ").ok_or_else(malformed)?;
    let space = args.iter().position(|&b| b == b' ').ok_or_else(malformed)?;
    let flags = std::str::from_utf8(&args[..space])
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
        .ok_or_else(malformed)?;
    let path = &args[space + 1..];
    if path.is_empty() {
        return Err(malformed());
    }
    Ok(Command::Open {
        flags,
        path: PathBuf::from(OsStr::from_bytes(path)),
    })
}

fn path_bytes(path: &Path) -> Result<&[u8]> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.contains(&0) {
        return Err(BrokerError::Protocol(format!(
            "path {} cannot travel on the control channel",
            path.display()
        )));
    }
    Ok(bytes)
}

/// Asynchronous session switch notification pushed by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    Activated,
    Deactivated,
}

impl RelayEvent {
    pub fn as_byte(self) -> u8 {
        match self {
            RelayEvent::Activated => RELAY_ACTIVATED,
            RelayEvent::Deactivated => RELAY_DEACTIVATED,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            RELAY_ACTIVATED => Some(RelayEvent::Activated),
            RELAY_DEACTIVATED => Some(RelayEvent::Deactivated),
            _ => None,
        }
    }
}
