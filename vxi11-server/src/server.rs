use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use vxi11_protocol::{RPCBIND_PORT, Transport, codec::DEFAULT_MAX_RECORD_LEN};

use crate::{
    CommandHandler,
    error::ServerError,
    portmap::{DEFAULT_PORTMAP_TIMEOUT, Portmapper, PortmapperHandle, loopback},
    registry::{PortRange, PortReader, PortRegistry},
    session::{SessionEngine, SessionOutcome},
};

/// Identification returned for every DEVICE_READ. Oscilloscopes expect the `SDG` model prefix.
pub const DEFAULT_ID_STRING: &[u8] = b"IDN-SGLT-PRI SDG0000X";

const WAKE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub rpcbind_port: u16,
    pub port_range: PortRange,
    /// Inactivity after which a started sweep counts as finished in run-once mode
    pub end_of_session_timeout: Duration,
    /// Stop after the first complete sweep
    pub run_once: bool,
    pub id_string: Vec<u8>,
    pub max_record_len: usize,
    /// How long to wait for a portmapper thread at shutdown
    pub portmapper_grace: Duration,
    /// Read and write timeout of TCP portmap connections
    pub portmap_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rpcbind_port: RPCBIND_PORT,
            port_range: PortRange::default(),
            end_of_session_timeout: Duration::from_secs(10),
            run_once: false,
            id_string: DEFAULT_ID_STRING.to_vec(),
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            portmapper_grace: Duration::from_secs(1),
            portmap_timeout: DEFAULT_PORTMAP_TIMEOUT,
        }
    }
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use vxi11_server::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .rpcbind_port(1111)
///     .run_once(true)
///     .end_of_session_timeout(Duration::from_secs(5))
///     .build(my_generator);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the address all sockets are bound to.
    pub fn host(mut self, host: IpAddr) -> Self {
        self.config.host = host;
        self
    }

    /// Set the port of the UDP and TCP portmappers.
    pub fn rpcbind_port(mut self, port: u16) -> Self {
        self.config.rpcbind_port = port;
        self
    }

    /// Set the ports the VXI-11 service rotates through.
    pub fn port_range(mut self, range: PortRange) -> Self {
        self.config.port_range = range;
        self
    }

    pub fn end_of_session_timeout(mut self, timeout: Duration) -> Self {
        self.config.end_of_session_timeout = timeout;
        self
    }

    pub fn run_once(mut self, run_once: bool) -> Self {
        self.config.run_once = run_once;
        self
    }

    /// Set the identification returned to every DEVICE_READ.
    pub fn id_string(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.config.id_string = id.into();
        self
    }

    pub fn portmapper_grace(mut self, grace: Duration) -> Self {
        self.config.portmapper_grace = grace;
        self
    }

    /// Set how long a TCP portmap client may stay silent before it is dropped.
    pub fn portmap_timeout(mut self, timeout: Duration) -> Self {
        self.config.portmap_timeout = timeout;
        self
    }

    /// Build and return the server
    pub fn build<T: CommandHandler>(self, handler: T) -> Server<T> {
        Server::new(handler, self.config)
    }
}

#[derive(Debug)]
pub struct Server<T: CommandHandler> {
    engine: SessionEngine<T>,
    config: Config,
    registry: PortRegistry,
    shutdown: CancellationToken,
}

impl<T: CommandHandler> Server<T> {
    pub fn new(handler: T, config: Config) -> Server<T> {
        Server {
            engine: SessionEngine::new(handler, &config),
            registry: PortRegistry::new(config.port_range),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancelling the token stops the server once the current session is over.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A handle that stops the server from another thread, even while it waits
    /// for a connection.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
            host: self.config.host,
            port: self.registry.reader(),
        }
    }

    pub fn handler(&self) -> &T {
        self.engine.handler()
    }

    /// Runs the portmappers and serves VXI-11 sessions until the server stops.
    ///
    /// Returns an error if a socket cannot be opened or accepting a connection fails.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let portmappers = self.start_portmappers()?;
        let result = self.serve_sessions();
        self.shutdown.cancel();
        for portmapper in portmappers {
            portmapper.stop(self.config.portmapper_grace);
        }
        result
    }

    fn start_portmappers(&self) -> Result<Vec<PortmapperHandle>, ServerError> {
        let addr = SocketAddr::new(self.config.host, self.config.rpcbind_port);
        let mut handles = Vec::with_capacity(2);
        for transport in [Transport::Udp, Transport::Tcp] {
            let started = Portmapper::bind(transport, addr, self.registry.reader())
                .map(|portmapper| portmapper.timeout(self.config.portmap_timeout))
                .and_then(|portmapper| portmapper.spawn(self.shutdown.child_token()));
            match started {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        handle.stop(self.config.portmapper_grace);
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    fn bind_vxi11(&self) -> Result<TcpListener, ServerError> {
        let addr = SocketAddr::new(self.config.host, self.registry.get());
        // std sets SO_REUSEADDR on unix, so recently used ports can be bound again
        let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        log::info!("VXI-11 listening on {}", addr);
        Ok(listener)
    }

    fn serve_sessions(&mut self) -> Result<(), ServerError> {
        let mut listener = self.bind_vxi11()?;
        let mut session_started = false;
        loop {
            if self.shutdown.is_cancelled() {
                log::info!("Shutdown requested, stopping server");
                return Ok(());
            }
            let timeout = (self.config.run_once && session_started)
                .then_some(self.config.end_of_session_timeout);
            let outcome = self.engine.process(&listener, timeout);
            if self.config.run_once && outcome == SessionOutcome::Started {
                log::info!("Sweep started");
                session_started = true;
            }

            // Some oscilloscopes refuse to connect to a listening socket twice
            drop(listener);
            if outcome == SessionOutcome::Error {
                return Err(ServerError::FatalSession);
            }

            let port = self.registry.advance();
            log::debug!("Moving VXI-11 service to port {}", port);
            listener = self.bind_vxi11()?;

            if self.config.run_once
                && matches!(outcome, SessionOutcome::Ended | SessionOutcome::Timeout)
            {
                log::info!("Sweep finished, stopping server");
                return Ok(());
            }
        }
    }
}

/// Stops a running [Server] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
    host: IpAddr,
    port: PortReader,
}

impl ShutdownHandle {
    /// Cancels the server and wakes it if it is waiting for a VXI-11 connection.
    ///
    /// The server finishes a session that is in progress before it stops.
    pub fn shutdown(&self) {
        self.token.cancel();
        let addr = loopback(SocketAddr::new(self.host, self.port.get()));
        // A refused connection means the listener is being replaced, and the
        // server checks the token before it accepts again
        if let Err(e) = TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
            log::debug!("Could not wake VXI-11 listener on {}: {}", addr, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::error::Error;

    struct Ignore;

    impl CommandHandler for Ignore {
        fn execute(&mut self, _command: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
            Ok(())
        }
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.rpcbind_port, 111);
        assert_eq!(config.port_range, PortRange::new(9010, 9019).unwrap());
        assert_eq!(config.end_of_session_timeout, Duration::from_secs(10));
        assert!(!config.run_once);
        assert_eq!(config.id_string, b"IDN-SGLT-PRI SDG0000X");
        assert_eq!(config.portmap_timeout, Duration::from_secs(2));
    }

    #[test]
    fn builder_sets_options() {
        let server = Builder::new()
            .host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .rpcbind_port(1111)
            .port_range(PortRange::new(20000, 20004).unwrap())
            .run_once(true)
            .end_of_session_timeout(Duration::from_secs(3))
            .id_string("IDN-SGLT-PRI SDG2042X")
            .build(Ignore);
        let config = server.config();
        assert_eq!(config.rpcbind_port, 1111);
        assert_eq!(config.port_range.start(), 20000);
        assert!(config.run_once);
        assert_eq!(config.end_of_session_timeout, Duration::from_secs(3));
        assert_eq!(config.id_string, b"IDN-SGLT-PRI SDG2042X");
    }

    #[test]
    fn shutdown_handle_wakes_waiting_server() {
        let mut server = Builder::new()
            .host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .rpcbind_port(47301)
            .port_range(PortRange::new(47310, 47319).unwrap())
            .build(Ignore);
        let handle = server.shutdown_handle();
        let worker = std::thread::spawn(move || server.run());

        // Wait until the VXI-11 listener accepts connections
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 47310);
        let started = std::time::Instant::now();
        while TcpStream::connect(addr).is_err() {
            assert!(started.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(20));
        }

        handle.shutdown();
        let started = std::time::Instant::now();
        while !worker.is_finished() {
            assert!(started.elapsed() < Duration::from_secs(3), "server still running");
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn rpcbind_port_in_use_fails_start() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let mut server = Builder::new()
            .host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .rpcbind_port(port)
            .build(Ignore);
        assert!(matches!(server.run(), Err(ServerError::Bind { .. })));
    }
}
