use crate::error::ProtocolResult;
use std::net::SocketAddr;

/// What a datagram transport can do. `encryption` means the transport
/// secures frames itself, in which case the protocol layer skips its own
/// AEAD envelope.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub client: bool,
    pub server: bool,
    pub encryption: bool,
}

/// The lower edge of the protocol layer: an unreliable datagram pipe.
/// Implementations are nonblocking; the socket pumps `poll_recv` from its
/// `update` pass until it returns `None`.
pub trait Transport {
    fn capability(&self) -> Capability;

    /// Binds an ephemeral local port and fixes the remote address. Client
    /// transports send with `address: None` afterwards.
    fn connect(&mut self, address: SocketAddr) -> ProtocolResult<()>;

    /// Binds the given local address for a server.
    fn listen(&mut self, address: SocketAddr) -> ProtocolResult<()>;

    fn stop(&mut self);

    /// Sends one frame. `address` is `None` on connected (client)
    /// transports. A full OS buffer drops the frame, as UDP would.
    fn send(&mut self, address: Option<SocketAddr>, frame: &[u8]) -> ProtocolResult<()>;

    /// Receives one pending datagram into `buffer`, or `None` when drained.
    fn poll_recv(&mut self, buffer: &mut [u8]) -> Option<(SocketAddr, usize)>;
}

pub mod udp {
    use super::{Capability, Transport};
    use crate::error::{ProtocolError, ProtocolResult};
    use brine::logging::{self, trace, warn, Logger};
    use mio::net::UdpSocket;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    /// Nonblocking UDP transport. One instance serves either as a connected
    /// client socket or a bound server socket, never both.
    pub struct UdpTransport {
        socket: Option<UdpSocket>,
        connected: Option<SocketAddr>,
        log: Logger,
    }

    impl UdpTransport {
        pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> UdpTransport {
            UdpTransport {
                socket: None,
                connected: None,
                log: logging::child(log),
            }
        }

        fn wildcard_for(address: &SocketAddr) -> SocketAddr {
            match address {
                SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            }
        }
    }

    impl Transport for UdpTransport {
        fn capability(&self) -> Capability {
            Capability {
                client: true,
                server: true,
                encryption: false,
            }
        }

        fn connect(&mut self, address: SocketAddr) -> ProtocolResult<()> {
            let socket = UdpSocket::bind(Self::wildcard_for(&address))?;
            socket.connect(address)?;

            trace!(self.log, "udp transport connected"; "remote" => %address);
            self.socket = Some(socket);
            self.connected = Some(address);
            Ok(())
        }

        fn listen(&mut self, address: SocketAddr) -> ProtocolResult<()> {
            let socket = UdpSocket::bind(address)?;

            trace!(self.log, "udp transport listening"; "local" => %address);
            self.socket = Some(socket);
            self.connected = None;
            Ok(())
        }

        fn stop(&mut self) {
            self.socket = None;
            self.connected = None;
        }

        fn send(&mut self, address: Option<SocketAddr>, frame: &[u8]) -> ProtocolResult<()> {
            let socket = match &self.socket {
                Some(socket) => socket,
                None => return Err(ProtocolError::Io(io::ErrorKind::NotConnected)),
            };

            let result = match (self.connected, address) {
                (Some(_), _) => socket.send(frame),
                (None, Some(address)) => socket.send_to(frame, address),
                (None, None) => return Err(ProtocolError::Io(io::ErrorKind::InvalidInput)),
            };

            match result {
                Ok(_) => Ok(()),
                // A full send buffer loses the datagram, like the wire would
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => {
                    warn!(self.log, "udp send failed"; "error" => %err);
                    Err(err.into())
                }
            }
        }

        fn poll_recv(&mut self, buffer: &mut [u8]) -> Option<(SocketAddr, usize)> {
            let socket = self.socket.as_ref()?;

            loop {
                match socket.recv_from(buffer) {
                    Ok((length, address)) => return Some((address, length)),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                    Err(ref err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                        // ICMP unreachable bounced a previous send; skip it
                        continue;
                    }
                    Err(err) => {
                        warn!(self.log, "udp recv failed"; "error" => %err);
                        return None;
                    }
                }
            }
        }
    }
}
