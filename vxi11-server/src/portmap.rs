//! rpcbind responders that announce the current VXI-11 port.
//!
//! Both the UDP and the TCP responder only answer GETPORT requests for the
//! VXI-11 core program. Everything else is dropped without a reply so that
//! the client runs into its own timeout.
use std::{
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::mpsc::{self, RecvTimeoutError},
    thread::{self, JoinHandle},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use vxi11_protocol::{
    PortmapCall, Transport,
    codec::{build_response, getport_reply},
    error::ProtocolError,
};

use crate::{error::ServerError, registry::PortReader};

/// Bytes read from a TCP portmap connection, record marker included
const TCP_BUFFER_LEN: usize = 128;
const UDP_BUFFER_LEN: usize = 1024;
const WAKE_TIMEOUT: Duration = Duration::from_millis(200);
/// Pause after a failed `accept` or `recv_from` before trying again
const ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// Read and write timeout of a TCP portmap connection
pub const DEFAULT_PORTMAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum Socket {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

/// A bound rpcbind responder for one transport.
#[derive(Debug)]
pub struct Portmapper {
    socket: Socket,
    port: PortReader,
    timeout: Duration,
}

impl Portmapper {
    pub fn bind(
        transport: Transport,
        addr: SocketAddr,
        port: PortReader,
    ) -> Result<Portmapper, ServerError> {
        let socket = match transport {
            Transport::Udp => UdpSocket::bind(addr).map(Socket::Udp),
            Transport::Tcp => TcpListener::bind(addr).map(Socket::Tcp),
        }
        .map_err(|source| ServerError::Bind { addr, source })?;
        log::info!("{} portmapper listening on {}", transport, addr);
        Ok(Portmapper {
            socket,
            port,
            timeout: DEFAULT_PORTMAP_TIMEOUT,
        })
    }

    /// Set how long a TCP client may take to send its request or read the reply.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> Transport {
        match self.socket {
            Socket::Udp(_) => Transport::Udp,
            Socket::Tcp(_) => Transport::Tcp,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.socket {
            Socket::Udp(socket) => socket.local_addr(),
            Socket::Tcp(listener) => listener.local_addr(),
        }
    }

    /// Waits for one request and answers it if it is a GETPORT for VXI-11.
    ///
    /// Returns the announced port, or `None` if the request was dropped.
    pub fn serve_one(&self) -> io::Result<Option<u16>> {
        match &self.socket {
            Socket::Udp(socket) => {
                let mut buf = [0u8; UDP_BUFFER_LEN];
                let (len, peer) = socket.recv_from(&mut buf)?;
                let Some((port, response)) = self.respond(&buf[..len], peer, Transport::Udp)
                else {
                    return Ok(None);
                };
                socket.send_to(&response, peer)?;
                Ok(Some(port))
            }
            Socket::Tcp(listener) => {
                let (mut stream, peer) = listener.accept()?;
                stream.set_read_timeout(Some(self.timeout))?;
                stream.set_write_timeout(Some(self.timeout))?;
                let mut buf = [0u8; TCP_BUFFER_LEN];
                let len = match stream.read(&mut buf) {
                    Ok(len) => len,
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                        log::warn!(
                            "TCP portmapper: no request from {} within {:?}, closing connection",
                            peer,
                            self.timeout
                        );
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                };
                // Strip the record marker to get the same layout as a datagram
                let request = if len > 4 { &buf[4..len] } else { &buf[..len] };
                let Some((port, response)) = self.respond(request, peer, Transport::Tcp) else {
                    return Ok(None);
                };
                // One reply per connection, the connection closes when dropped
                stream.write_all(&response)?;
                Ok(Some(port))
            }
        }
    }

    fn respond(
        &self,
        request: &[u8],
        peer: SocketAddr,
        transport: Transport,
    ) -> Option<(u16, Vec<u8>)> {
        if request.is_empty() {
            // Wake-up packets and connections closed without a request
            log::debug!("{} portmapper: empty request from {}", transport, peer);
            return None;
        }
        log::trace!("{} portmapper request from {}: {:02x?}", transport, peer, request);
        let call = match PortmapCall::parse(request) {
            Ok(call) => call,
            Err(e) => {
                log_dropped(transport, peer, &e);
                return None;
            }
        };
        let port = self.port.get();
        log::debug!("{} portmapper: announcing port {} to {}", transport, port, peer);
        Some((port, build_response(call.xid(), &getport_reply(port), transport)))
    }

    /// Starts answering requests on a dedicated thread until `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> Result<PortmapperHandle, ServerError> {
        let transport = self.transport();
        let wake_addr = loopback(self.local_addr()?);
        let (done_tx, done_rx) = mpsc::channel();
        let worker_token = token.clone();
        let thread = thread::Builder::new()
            .name(format!("portmap-{}", transport).to_lowercase())
            .spawn(move || {
                serve_until_cancelled(transport, &worker_token, || self.serve_one());
                log::debug!("{} portmapper stopped", transport);
                let _ = done_tx.send(());
            })?;
        Ok(PortmapperHandle {
            transport,
            wake_addr,
            token,
            done: done_rx,
            thread,
        })
    }
}

/// Calls `serve` until `token` is cancelled, backing off after every error.
fn serve_until_cancelled<F>(transport: Transport, token: &CancellationToken, mut serve: F)
where
    F: FnMut() -> io::Result<Option<u16>>,
{
    while !token.is_cancelled() {
        if let Err(e) = serve() {
            log::warn!("{} portmapper: {}", transport, e);
            thread::sleep(ERROR_BACKOFF);
        }
    }
}

fn log_dropped(transport: Transport, peer: SocketAddr, error: &ProtocolError) {
    log::warn!(
        "{} portmapper: dropping incompatible request from {}: {}",
        transport,
        peer,
        error
    );
}

/// The address a local client uses to reach a socket bound to `addr`.
pub(crate) fn loopback(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Controls a running portmapper thread.
#[derive(Debug)]
pub struct PortmapperHandle {
    transport: Transport,
    wake_addr: SocketAddr,
    token: CancellationToken,
    done: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

impl PortmapperHandle {
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// The address to reach the portmapper from this host.
    pub fn local_addr(&self) -> SocketAddr {
        self.wake_addr
    }

    /// Requests the worker to stop and waits up to `grace` for it.
    ///
    /// The worker only checks for the stop request between two requests, so it is
    /// woken with a throwaway request. If it still does not finish, the thread is
    /// detached and ends with the process.
    pub fn stop(self, grace: Duration) {
        self.token.cancel();
        if let Err(e) = self.wake() {
            log::debug!("Could not wake {} portmapper: {}", self.transport, e);
        }
        match self.done.recv_timeout(grace) {
            Ok(()) => {
                if self.thread.join().is_err() {
                    log::error!("{} portmapper panicked", self.transport);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::error!("{} portmapper terminated unexpectedly", self.transport);
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "{} portmapper did not stop within {:?}, detaching it",
                    self.transport,
                    grace
                );
            }
        }
    }

    fn wake(&self) -> io::Result<()> {
        match self.transport {
            Transport::Udp => {
                let unspecified = match self.wake_addr {
                    SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
                socket.send_to(&[], self.wake_addr)?;
            }
            Transport::Tcp => {
                TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT)?;
            }
        }
        Ok(())
    }
}
