//! Parent/child bootstrap channel
//!
//! A `socketpair(AF_UNIX, SOCK_STREAM)` carries, in order: the TUN file
//! descriptor as an ancillary SCM_RIGHTS message (child to parent), one
//! line-delimited JSON `{"mtu":N}` (child to parent) and one `{"ACK":true}`
//! (parent to child). Each reader consumes exactly one JSON line because
//! the socket stays open for the opposite direction afterwards.

use std::{
    io::{self, Error, ErrorKind, Read, Write},
    mem,
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixStream,
    },
    ptr, slice,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct MtuMessage {
    mtu: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct AckMessage {
    #[serde(rename = "ACK")]
    ack: bool,
}

/// One end of the bootstrap socket pair
pub struct BootstrapChannel {
    stream: UnixStream,
}

impl BootstrapChannel {
    pub fn new(stream: UnixStream) -> BootstrapChannel {
        BootstrapChannel { stream }
    }

    /// Creates the socket pair. The first channel stays in the parent, the
    /// second end is inherited by the child, so its close-on-exec flag is
    /// cleared.
    pub fn pair() -> io::Result<(BootstrapChannel, UnixStream)> {
        let (parent, child) = UnixStream::pair()?;
        clear_cloexec(child.as_raw_fd())?;
        Ok((BootstrapChannel::new(parent), child))
    }

    /// Parent: receives the TUN fd from the ancillary message
    pub fn recv_tun_fd(&mut self) -> io::Result<RawFd> {
        let mut carrier = [0u8; 1];
        let (_, fd) = recv_with_fd(self.stream.as_raw_fd(), &mut carrier)?;
        fd.ok_or_else(|| Error::new(ErrorKind::InvalidData, "no file descriptor in bootstrap message"))
    }

    /// Parent: receives the `{"mtu":N}` line
    pub fn recv_mtu(&mut self) -> io::Result<u32> {
        let msg: MtuMessage = self.read_json_line()?;
        Ok(msg.mtu)
    }

    /// Parent: acknowledges that the network stack is running
    pub fn send_ack(&mut self) -> io::Result<()> {
        self.write_json_line(&AckMessage { ack: true })
    }

    /// Child: ships the TUN fd
    pub fn send_tun_fd(&mut self, fd: RawFd) -> io::Result<()> {
        send_with_fd(self.stream.as_raw_fd(), &[0u8], fd)?;
        Ok(())
    }

    /// Child: ships the TUN MTU
    pub fn send_mtu(&mut self, mtu: u32) -> io::Result<()> {
        self.write_json_line(&MtuMessage { mtu })
    }

    /// Child: waits for the parent's acknowledgement
    pub fn recv_ack(&mut self) -> io::Result<()> {
        let msg: AckMessage = self.read_json_line()?;
        if !msg.ack {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "network stack initialization not acknowledged",
            ));
        }
        Ok(())
    }

    fn write_json_line<T: Serialize>(&mut self, msg: &T) -> io::Result<()> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        self.stream.write_all(&line)
    }

    fn read_json_line<T: for<'de> Deserialize<'de>>(&mut self) -> io::Result<T> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.stream.read(&mut byte)? == 0 {
                return Err(Error::new(ErrorKind::UnexpectedEof, "bootstrap channel closed"));
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        serde_json::from_slice(&line).map_err(Into::into)
    }
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// `sendmsg` carrying `buf` plus one file descriptor as SCM_RIGHTS
fn send_with_fd(socket: RawFd, buf: &[u8], fd: RawFd) -> io::Result<usize> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *const _ as *mut _,
            iov_len: buf.len(),
        };

        let cmsg_space = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;
        let mut cmsg_buffer = vec![0u8; cmsg_space];

        let mut msghdr: libc::msghdr = mem::zeroed();
        msghdr.msg_iov = &mut iov as *mut _;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = cmsg_buffer.as_mut_ptr() as *mut _;
        msghdr.msg_controllen = cmsg_space as _;

        let cmsg_header = libc::CMSG_FIRSTHDR(&msghdr as *const _);
        let mut cmsg: libc::cmsghdr = mem::zeroed();
        cmsg.cmsg_level = libc::SOL_SOCKET;
        cmsg.cmsg_type = libc::SCM_RIGHTS;
        cmsg.cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::write(cmsg_header, cmsg);
        ptr::write_unaligned(libc::CMSG_DATA(cmsg_header) as *mut RawFd, fd);

        let n = libc::sendmsg(socket, &msghdr as *const _, 0);
        if n < 0 {
            return Err(Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// `recvmsg` filling `buf` and extracting one SCM_RIGHTS descriptor if any
fn recv_with_fd(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<RawFd>)> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut _,
            iov_len: buf.len(),
        };

        let cmsg_space = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;
        let mut cmsg_buffer = vec![0u8; cmsg_space];

        let mut msghdr: libc::msghdr = mem::zeroed();
        msghdr.msg_iov = &mut iov as *mut _;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = cmsg_buffer.as_mut_ptr() as *mut _;
        msghdr.msg_controllen = cmsg_space as _;

        let n = libc::recvmsg(socket, &mut msghdr as *mut _, 0);
        if n < 0 {
            return Err(Error::last_os_error());
        }

        let mut received_fd = None;
        let mut cmsg_header = libc::CMSG_FIRSTHDR(&msghdr as *const _);
        while !cmsg_header.is_null() {
            if (*cmsg_header).cmsg_level == libc::SOL_SOCKET && (*cmsg_header).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg_header) as *const u8;
                let data_offset = data.offset_from(cmsg_header as *const u8);
                let data_bytes = (*cmsg_header).cmsg_len as usize - data_offset as usize;
                let fds = slice::from_raw_parts(data as *const RawFd, data_bytes / mem::size_of::<RawFd>());
                if let Some(&fd) = fds.first() {
                    received_fd = Some(fd);
                }
            }
            cmsg_header = libc::CMSG_NXTHDR(&msghdr as *const _, cmsg_header);
        }

        Ok((n as usize, received_fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{fs::File, io::Seek, os::unix::io::FromRawFd};

    #[test]
    fn mtu_and_ack_roundtrip() {
        let (mut parent, child) = BootstrapChannel::pair().unwrap();
        let mut child = BootstrapChannel::new(child);

        child.send_mtu(1500).unwrap();
        assert_eq!(parent.recv_mtu().unwrap(), 1500);

        parent.send_ack().unwrap();
        child.recv_ack().unwrap();
    }

    #[test]
    fn fd_transfer_duplicates_descriptor() {
        use std::io::{Read as _, Write as _};

        let (mut parent, child) = BootstrapChannel::pair().unwrap();
        let mut child = BootstrapChannel::new(child);

        let mut tmp = tempfile();
        tmp.write_all(b"sockspin").unwrap();
        tmp.rewind().unwrap();

        child.send_tun_fd(tmp.as_raw_fd()).unwrap();
        drop(tmp);

        let fd = parent.recv_tun_fd().unwrap();
        let mut received = unsafe { File::from_raw_fd(fd) };
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "sockspin");
    }

    fn tempfile() -> File {
        let path = std::env::temp_dir().join(format!("sockspin-ipc-test-{}", std::process::id()));
        let file = File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        file
    }

    #[test]
    fn json_line_framing_leaves_following_bytes() {
        let (mut parent, child) = BootstrapChannel::pair().unwrap();
        let mut child = BootstrapChannel::new(child);

        // two messages written back to back must be consumed one at a time
        child.send_mtu(1400).unwrap();
        child.stream.write_all(b"{\"mtu\":9000}\n").unwrap();

        assert_eq!(parent.recv_mtu().unwrap(), 1400);
        assert_eq!(parent.recv_mtu().unwrap(), 9000);
    }
}
