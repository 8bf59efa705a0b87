//! Descriptor passing over the control channel.
//!
//! The channel is a connected `AF_UNIX` `SOCK_SEQPACKET` socketpair:
//! message boundaries are preserved, so a reply is always exactly one
//! record, and unlike `SOCK_DGRAM` a peer close is observable as `POLLHUP`
//! and a zero-length read. A successful open reply carries exactly one
//! descriptor in a `SCM_RIGHTS` control block.

use std::io;
use std::io::IoSlice;
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use libc::c_uint;
use socket2::Domain;
use socket2::MaybeUninitSlice;
use socket2::MsgHdr;
use socket2::MsgHdrMut;
use socket2::Socket;
use socket2::Type;

use crate::protocol::MAX_MESSAGE;

pub(crate) fn control_channel_pair() -> io::Result<(Socket, Socket)> {
    Socket::pair(Domain::UNIX, Type::SEQPACKET, None)
}

fn assume_init(buf: &[MaybeUninit<u8>]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast(), buf.len()) }
}

fn control_space_for_fd() -> usize {
    unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as _) as usize }
}

fn extract_fd(control: &mut [MaybeUninit<u8>], len: usize) -> Option<OwnedFd> {
    if len == 0 {
        return None;
    }
    let mut received = None;
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_control = control.as_mut_ptr().cast();
    hdr.msg_controllen = len as _;

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&hdr) };
    while !cmsg.is_null() {
        let level = unsafe { (*cmsg).cmsg_level };
        let ty = unsafe { (*cmsg).cmsg_type };
        if level == libc::SOL_SOCKET && ty == libc::SCM_RIGHTS {
            let data_ptr = unsafe { libc::CMSG_DATA(cmsg).cast::<RawFd>() };
            let fd_count: usize = {
                let cmsg_data_len =
                    unsafe { (*cmsg).cmsg_len as usize } - unsafe { libc::CMSG_LEN(0) as usize };
                cmsg_data_len / size_of::<RawFd>()
            };
            for i in 0..fd_count {
                let fd = unsafe { data_ptr.add(i).read() };
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                // The protocol sends at most one descriptor; drop any extras
                // rather than leak them.
                if received.is_none() {
                    received = Some(fd);
                }
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&hdr, cmsg) };
    }
    received
}

/// Receives one datagram plus at most one attached descriptor.
///
/// A zero-length return with no descriptor means the peer closed the
/// channel.
pub(crate) fn recv_message(socket: &Socket) -> io::Result<(Vec<u8>, Option<OwnedFd>)> {
    let mut data = [MaybeUninit::<u8>::uninit(); MAX_MESSAGE];
    let mut control = vec![MaybeUninit::<u8>::uninit(); control_space_for_fd()];
    let (received, control_len) = {
        let mut bufs = [MaybeUninitSlice::new(&mut data)];
        let mut msg = MsgHdrMut::new()
            .with_buffers(&mut bufs)
            .with_control(&mut control);
        let received = socket.recvmsg(&mut msg, 0)?;
        (received, msg.control_len())
    };

    let message = assume_init(&data[..received]).to_vec();
    let fd = extract_fd(&mut control, control_len);
    Ok((message, fd))
}

/// Sends one datagram, attaching `fd` via `SCM_RIGHTS` when present. The
/// caller still owns `fd` afterwards and is responsible for closing it.
pub(crate) fn send_message(
    socket: &Socket,
    data: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    let payload = [IoSlice::new(data)];
    let sent = match fd {
        Some(fd) => {
            let mut control = vec![0u8; control_space_for_fd()];
            unsafe {
                let cmsg = control.as_mut_ptr().cast::<libc::cmsghdr>();
                (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as c_uint) as _;
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                let data_ptr = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                data_ptr.write(fd.as_raw_fd());
            }
            let msg = MsgHdr::new().with_buffers(&payload).with_control(&control);
            socket.sendmsg(&msg, 0)?
        }
        None => {
            let msg = MsgHdr::new().with_buffers(&payload);
            socket.sendmsg(&msg, 0)?
        }
    };
    if sent < data.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "control channel send was truncated",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::io::Seek;
    use std::io::Write;
    use std::os::fd::AsFd;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn messages_round_trip_without_descriptor() {
        let (a, b) = control_channel_pair().unwrap();
        send_message(&a, b"o 2 /dev/dri/card0\0", None).unwrap();
        let (message, fd) = recv_message(&b).unwrap();
        assert_eq!(message, b"o 2 /dev/dri/card0\0");
        assert!(fd.is_none());
    }

    #[test]
    fn descriptor_survives_the_transfer() {
        let (a, b) = control_channel_pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"payload").unwrap();
        file.rewind().unwrap();

        send_message(&a, b"t", Some(OwnedFd::from(file).as_fd())).unwrap();
        let (message, fd) = recv_message(&b).unwrap();
        assert_eq!(message, b"t");

        let mut received = File::from(fd.expect("descriptor attached"));
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "payload");
    }

    #[test]
    fn peer_close_reads_as_end_of_stream() {
        let (a, b) = control_channel_pair().unwrap();
        drop(a);
        let (message, fd) = recv_message(&b).unwrap();
        assert!(message.is_empty());
        assert!(fd.is_none());
    }

    #[test]
    fn datagram_boundaries_are_preserved() {
        let (a, b) = control_channel_pair().unwrap();
        send_message(&a, b"t\0", None).unwrap();
        send_message(&a, b"k\0", None).unwrap();
        let (first, _) = recv_message(&b).unwrap();
        let (second, _) = recv_message(&b).unwrap();
        assert_eq!(first, b"t\0");
        assert_eq!(second, b"k\0");
    }
}
