//! Non-blocking UDP socket bound to a single remote endpoint.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::{debug, warn};

use crate::wire::MTU;

/// Failed to open the circuit socket.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Datagram counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
}

/// Raw datagram boundary; no reliability here.
pub struct NetworkConnection {
    socket: UdpSocket,
    remote: SocketAddr,
    recv_buf: Box<[u8]>,
    stats: ConnectionStats,
}

impl NetworkConnection {
    /// Resolve `address`, bind an ephemeral local port and connect to the remote.
    pub fn open(address: &str, port: u16) -> Result<Self, ConnectError> {
        let remote = (address, port)
            .to_socket_addrs()
            .map_err(|_| ConnectError::Resolve(format!("{}:{}", address, port)))?
            .next()
            .ok_or_else(|| ConnectError::Resolve(format!("{}:{}", address, port)))?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(remote)?;
        socket.set_nonblocking(true)?;
        debug!(%remote, local = %socket.local_addr()?, "circuit socket open");
        Ok(Self {
            socket,
            remote,
            recv_buf: vec![0u8; MTU * 2].into_boxed_slice(),
            stats: ConnectionStats::default(),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram without blocking. `Ok(false)` means the socket was full and the datagram was dropped.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<bool> {
        match self.socket.send(bytes) {
            Ok(n) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += n as u64;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => {
                self.stats.send_errors += 1;
                Err(e)
            }
        }
    }

    /// Next pending datagram, if any.
    pub fn try_receive(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.socket.recv(&mut self.recv_buf) {
                Ok(n) => {
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += n as u64;
                    return Some(self.recv_buf[..n].to_vec());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // ICMP unreachable surfaces here on connected sockets; keep polling next frame.
                    self.stats.recv_errors += 1;
                    warn!(remote = %self.remote, error = %e, "receive failed");
                    return None;
                }
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Close the socket.
    pub fn close(self) {
        debug!(remote = %self.remote, "circuit socket closed");
    }
}
