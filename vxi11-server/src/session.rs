//! The VXI-11 core channel: one connection at a time, one session per connection.
use std::{
    io::{self, ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use vxi11_protocol::{
    DeviceCall, DeviceRequest, Procedure, Transport,
    codec::{
        build_response, create_link_reply, destroy_link_reply, device_read_reply,
        device_write_reply, read_record,
    },
    error::ProtocolError,
};

use crate::{CommandHandler, bridge::CommandBridge, server::Config};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a session ended, determined once its connection is closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionOutcome {
    /// The connection carried neither the start nor the end of a sweep.
    Ongoing,
    /// The oscilloscope switched the output on.
    Started,
    /// No connection arrived within the end-of-session timeout.
    Timeout,
    /// The oscilloscope switched the output off.
    Ended,
    /// Accepting a connection failed.
    Error,
}

/// Flags collected from the commands of a single connection.
#[derive(Debug, Default)]
struct Session {
    start_of_session: bool,
    end_of_session: bool,
}

impl Session {
    fn observe(&mut self, command: &str) {
        let command = command.to_lowercase();
        if command.contains("outp off") {
            self.end_of_session = true;
        }
        if command.contains("outp on") {
            self.start_of_session = true;
        }
    }

    fn outcome(&self) -> SessionOutcome {
        if self.end_of_session {
            SessionOutcome::Ended
        } else if self.start_of_session {
            SessionOutcome::Started
        } else {
            SessionOutcome::Ongoing
        }
    }
}

/// A reply and whether the connection ends after sending it.
struct Reply {
    bytes: Vec<u8>,
    close: bool,
}

/// Runs the VXI-11 request/response state machine and forwards commands.
#[derive(Debug)]
pub struct SessionEngine<T: CommandHandler> {
    bridge: CommandBridge<T>,
    id: Vec<u8>,
    max_record_len: usize,
}

impl<T: CommandHandler> SessionEngine<T> {
    pub fn new(handler: T, config: &Config) -> SessionEngine<T> {
        SessionEngine {
            bridge: CommandBridge::new(handler),
            id: config.id_string.clone(),
            max_record_len: config.max_record_len,
        }
    }

    pub fn handler(&self) -> &T {
        self.bridge.handler()
    }

    /// Accepts one connection and serves it until it ends.
    ///
    /// Without a `timeout` the accept blocks indefinitely.
    pub fn process(&mut self, listener: &TcpListener, timeout: Option<Duration>) -> SessionOutcome {
        let (mut stream, peer) = match accept(listener, timeout) {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                log::info!("No VXI-11 connection within {:?}", timeout);
                return SessionOutcome::Timeout;
            }
            Err(e) => {
                log::error!("Accepting VXI-11 connection failed: {}", e);
                return SessionOutcome::Error;
            }
        };
        log::debug!("VXI-11 connection from {}", peer);
        let outcome = self.serve_connection(&mut stream);
        drop(stream);
        log::debug!("VXI-11 connection from {} closed: {:?}", peer, outcome);
        outcome
    }

    /// Serves requests until the peer destroys the link, closes the connection or
    /// sends something that is not an answerable VXI-11 call.
    pub fn serve_connection<S: Read + Write>(&mut self, stream: &mut S) -> SessionOutcome {
        let mut session = Session::default();
        loop {
            let record = match read_record(stream, self.max_record_len) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) if e.is_request_error() => {
                    log::warn!("Aborting VXI-11 connection: {}", e);
                    break;
                }
                Err(e) => {
                    log::debug!("VXI-11 connection lost: {}", e);
                    break;
                }
            };
            log::trace!("VXI-11 request: {:02x?}", &record[..]);
            let reply = match self.handle_record(&record, &mut session) {
                Ok(reply) => reply,
                Err(e @ ProtocolError::ProtocolMismatch(_)) => {
                    log::warn!("Request from an unknown source: {}", e);
                    break;
                }
                Err(e) => {
                    log::warn!("Ignoring VXI-11 request: {}", e);
                    break;
                }
            };
            log::trace!("VXI-11 reply: {:02x?}", &reply.bytes[..]);
            if let Err(e) = stream.write_all(&reply.bytes) {
                log::warn!("Sending VXI-11 reply failed: {}", e);
                break;
            }
            if reply.close {
                break;
            }
        }
        session.outcome()
    }

    fn handle_record(&mut self, record: &[u8], session: &mut Session) -> Result<Reply, ProtocolError> {
        let call = DeviceCall::parse(record)?;
        let request = call.request()?;
        let payload = match request {
            DeviceRequest::CreateLink { device } => {
                log::debug!("CREATE_LINK to {}", String::from_utf8_lossy(device));
                create_link_reply().to_vec()
            }
            DeviceRequest::DeviceWrite { data } => {
                let command = std::str::from_utf8(data)?.trim();
                log::debug!("DEVICE_WRITE: {}", command);
                session.observe(command);
                self.bridge.forward(command);
                device_write_reply(data.len() as u32).to_vec()
            }
            DeviceRequest::DeviceRead => {
                // The identity is the right answer to *IDN? and the oscilloscope
                // accepts it for any other query as well.
                log::debug!("DEVICE_READ");
                device_read_reply(&self.id)
            }
            DeviceRequest::DestroyLink => {
                log::debug!("DESTROY_LINK");
                destroy_link_reply().to_vec()
            }
        };
        Ok(Reply {
            bytes: build_response(call.xid(), &payload, Transport::Tcp),
            close: call.procedure() == Procedure::DestroyLink,
        })
    }
}

/// Accepts a connection, giving up after `timeout` if one is set.
fn accept(
    listener: &TcpListener,
    timeout: Option<Duration>,
) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    let Some(timeout) = timeout else {
        listener.set_nonblocking(false)?;
        loop {
            match listener.accept() {
                Ok(connection) => return Ok(Some(connection)),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    };

    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                return Ok(Some((stream, peer)));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                thread::sleep(ACCEPT_POLL_INTERVAL.min(deadline - now));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
