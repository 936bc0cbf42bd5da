//! Socket binding for the HTTP and per-camera listeners

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn,
    SockaddrIn6,
};

use crate::error::AppError;

fn socket_addr_family(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

/// Bind a non-blocking TCP listener, IPv6-only for IPv6 addresses.
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let fd = socket::socket(
        socket_addr_family(&addr),
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(io::Error::from)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;

    match addr {
        SocketAddr::V4(v4) => {
            socket::bind(fd.as_raw_fd(), &SockaddrIn::from(v4)).map_err(io::Error::from)?;
        }
        SocketAddr::V6(v6) => {
            socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
            socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)).map_err(io::Error::from)?;
        }
    }
    socket::listen(&fd, Backlog::MAXCONN).map_err(io::Error::from)?;

    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Human-readable reason for a failed bind
pub fn describe_bind_error(addr: SocketAddr, err: &io::Error) -> String {
    match err.raw_os_error().map(Errno::from_raw) {
        Some(Errno::EADDRINUSE) => format!("Address {} already in use", addr),
        Some(Errno::EACCES) => format!("Port {} requires elevated privileges", addr.port()),
        _ => err.to_string(),
    }
}

/// Bind a camera's dedicated listener, mapping failures to `ListenerBind`
pub fn bind_camera_listener(camera: &str, addr: SocketAddr) -> Result<TcpListener, AppError> {
    bind_tcp_listener(addr).map_err(|e| AppError::ListenerBind {
        camera: camera.to_string(),
        addr: addr.to_string(),
        reason: describe_bind_error(addr, &e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_address_in_use_is_readable() {
        // No SO_REUSEPORT, so a second listener on the same port fails
        let first = bind_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        let err = bind_camera_listener("front-door", addr).unwrap_err();
        match err {
            AppError::ListenerBind { camera, reason, .. } => {
                assert_eq!(camera, "front-door");
                assert_eq!(reason, format!("Address {} already in use", addr));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_describe_permission_denied() {
        let addr: SocketAddr = "0.0.0.0:80".parse().unwrap();
        let err = io::Error::from_raw_os_error(Errno::EACCES as i32);
        assert_eq!(
            describe_bind_error(addr, &err),
            "Port 80 requires elevated privileges"
        );
    }
}
