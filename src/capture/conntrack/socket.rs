//! Netfilter netlink socket (Linux only).

use std::io::{self, Read};
use std::mem;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

/// Read timeout, bounds how long a listener takes to notice a stop request
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// Kernel receive buffer requested to ride out event bursts
const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// An `AF_NETLINK` / `NETLINK_NETFILTER` socket.
pub struct ConntrackSocket {
    socket: Socket,
}

impl ConntrackSocket {
    /// Create the socket; it receives nothing until `subscribe`.
    pub fn new() -> io::Result<Self> {
        let socket = Socket::new(
            Domain::from(libc::AF_NETLINK),
            Type::from(libc::SOCK_RAW),
            Some(Protocol::from(libc::NETLINK_NETFILTER)),
        )?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            debug!("Could not enlarge netlink receive buffer: {}", e);
        }
        Ok(Self { socket })
    }

    /// Bind to the multicast groups in `group_mask`.
    pub fn subscribe(&self, group_mask: u32) -> io::Result<()> {
        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = group_mask;

        // SAFETY: addr outlives the call and the length matches its type.
        let result = unsafe {
            libc::bind(
                self.socket.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Receive one datagram; times out after `RECV_TIMEOUT`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }
}

/// Whether a receive error is just the read timeout expiring.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Whether the kernel dropped events because the receive buffer overflowed.
pub fn is_overrun(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOBUFS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_times_out_before_subscribe() {
        // Sandboxes may forbid netlink sockets entirely
        let Ok(socket) = ConntrackSocket::new() else {
            return;
        };
        assert_eq!(socket.socket.read_timeout().unwrap(), Some(RECV_TIMEOUT));

        let mut buf = [0u8; 64];
        let err = socket.recv(&mut buf).unwrap_err();
        assert!(is_timeout(&err), "unexpected error: {err}");
    }

    #[test]
    fn test_error_classification() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_overrun(&io::Error::from_raw_os_error(libc::ENOBUFS)));
        assert!(!is_overrun(&io::Error::from_raw_os_error(libc::EAGAIN)));
    }
}
