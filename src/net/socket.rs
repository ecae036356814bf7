//! Socket Control
//!
//! Low-latency socket setup and the pieces of the sockets API that std
//! does not surface: buffer sizing with kernel read-back, the outbound
//! queue depth query, and non-blocking send/recv with explicit flags.

use std::io;
use std::mem;
use std::net::TcpListener;
use std::os::unix::io::{FromRawFd, RawFd};

/// Send/receive buffer applied to data sockets on both sides.
pub const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Create a non-blocking listening socket with `SO_REUSEADDR`.
/// Port 0 binds an ephemeral port; read it back via `local_addr()`.
pub fn listen(port: u16) -> io::Result<TcpListener> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = (|| {
        let opt: libc::c_int = 1;
        check(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                mem::size_of_val(&opt) as libc::socklen_t,
            )
        })?;

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        check(unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of_val(&addr) as libc::socklen_t,
            )
        })?;

        check(unsafe { libc::listen(fd, 128) })?;
        set_nonblocking(fd)?;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(unsafe { TcpListener::from_raw_fd(fd) }),
        Err(e) => {
            unsafe { libc::close(fd) };
            Err(e)
        }
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })
}

pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    let opt: libc::c_int = 1;
    check(unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            mem::size_of_val(&opt) as libc::socklen_t,
        )
    })
}

fn set_buffer(fd: RawFd, option: libc::c_int, bytes: usize) -> io::Result<usize> {
    let requested: libc::c_int = bytes as libc::c_int;
    check(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &requested as *const _ as *const libc::c_void,
            mem::size_of_val(&requested) as libc::socklen_t,
        )
    })?;

    // Read back the value the kernel actually granted
    let mut actual: libc::c_int = 0;
    let mut len = mem::size_of_val(&actual) as libc::socklen_t;
    check(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &mut actual as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(actual as usize)
}

/// Set `SO_SNDBUF`; returns the granted size.
pub fn set_send_buffer(fd: RawFd, bytes: usize) -> io::Result<usize> {
    set_buffer(fd, libc::SO_SNDBUF, bytes)
}

/// Set `SO_RCVBUF`; returns the granted size.
pub fn set_recv_buffer(fd: RawFd, bytes: usize) -> io::Result<usize> {
    set_buffer(fd, libc::SO_RCVBUF, bytes)
}

/// Bytes queued in the kernel send buffer, not yet acknowledged by the
/// peer. Returns 0 when the query fails.
pub fn pending_out_bytes(fd: RawFd) -> usize {
    let mut pending: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut pending) };
    if rc < 0 {
        return 0;
    }
    pending.max(0) as usize
}

/// Non-blocking send. `Ok(Some(n))` sent n bytes (possibly partial),
/// `Ok(None)` the socket would block, `Err` the connection is broken.
pub fn send_nonblocking(fd: RawFd, data: &[u8]) -> io::Result<Option<usize>> {
    let sent = unsafe {
        libc::send(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
        )
    };
    if sent < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(sent as usize))
}

/// Non-blocking receive. `Ok(Some(n))` read n bytes, `Ok(None)` no data
/// available, `Err(UnexpectedEof)` orderly shutdown by the peer.
pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ));
    }
    Ok(Some(n as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_listen_ephemeral_port() {
        let listener = listen(0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // Non-blocking accept on an idle listener must not hang
        match listener.accept() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }

    #[test]
    fn test_buffer_sizing_reads_back() {
        let listener = listen(0).unwrap();
        let granted = set_send_buffer(listener.as_raw_fd(), 256 * 1024).unwrap();
        assert!(granted > 0);
        let granted = set_recv_buffer(listener.as_raw_fd(), 256 * 1024).unwrap();
        assert!(granted > 0);
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let listener = listen(0).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();

        // Accept may race the connect on a non-blocking listener
        let server = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        client.write_all(b"hello").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut buf = [0u8; 16];
        let n = recv_nonblocking(server.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, Some(5));
        assert_eq!(&buf[..5], b"hello");

        // Drained socket reports no data rather than blocking
        assert_eq!(recv_nonblocking(server.as_raw_fd(), &mut buf).unwrap(), None);

        let sent = send_nonblocking(server.as_raw_fd(), b"world").unwrap();
        assert_eq!(sent, Some(5));
    }

    #[test]
    fn test_recv_reports_peer_close() {
        let listener = listen(0).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let server = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut buf = [0u8; 16];
        let err = recv_nonblocking(server.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
