//! Listener setup and client socket options.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
};

use mio::net::{TcpListener, TcpStream, UnixListener};
use socket2::{Domain, Socket, Type};

pub type Result<T, E = NetError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("invalid bind address `{0}`")]
    InvalidBindAddr(String),
    #[error("I/O related error")]
    Io(#[from] io::Error),
}

/// Open a non-blocking TCP listener with `SO_REUSEADDR` and the configured
/// backlog. A missing bind address listens on every IPv4 interface.
pub fn tcp_listener(bind: Option<&str>, port: u16, backlog: i32) -> Result<TcpListener> {
    let addr: SocketAddr = match bind {
        Some(host) => {
            let ip: std::net::IpAddr = host
                .parse()
                .map_err(|_| NetError::InvalidBindAddr(host.to_owned()))?;
            SocketAddr::new(ip, port)
        }
        None => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Open a Unix-domain listener, replacing any stale socket file, and apply
/// the configured permission bits.
pub fn unix_listener(path: &Path, perm: u32) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    let mut permissions = std::fs::metadata(path)?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut permissions, perm);
    std::fs::set_permissions(path, permissions)?;
    Ok(listener)
}

/// Per-client socket options: no Nagle delay, keepalive probes on.
pub fn set_client_options(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{tcp_listener, unix_listener};

    #[test]
    fn binds_an_ephemeral_port() {
        let listener = tcp_listener(Some("127.0.0.1"), 0, 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
        // The listener accepts plain TCP connections.
        let _conn = std::net::TcpStream::connect(addr).unwrap();
    }

    #[test]
    fn rejects_malformed_bind_address() {
        assert!(tcp_listener(Some("not-an-ip"), 0, 16).is_err());
    }

    #[test]
    fn unix_socket_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rr.sock");
        std::fs::write(&path, b"stale").unwrap();
        let _listener = unix_listener(&path, 0o700).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        let mode = std::os::unix::fs::PermissionsExt::mode(&meta.permissions());
        assert_eq!(mode & 0o777, 0o700);
    }
}
