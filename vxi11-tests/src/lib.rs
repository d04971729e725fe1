//! Fixtures shared by the end-to-end tests.
use std::{
    error::Error,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use vxi11_client::{Vxi11Client, get_port};
use vxi11_protocol::Transport;
use vxi11_server::{
    CommandHandler,
    error::ServerError,
    registry::PortRange,
    server::{Builder, Config},
};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const RETRY_INTERVAL: Duration = Duration::from_millis(20);
const RETRY_LIMIT: Duration = Duration::from_secs(5);

/// Records every command it receives.
#[derive(Clone, Default)]
pub struct Recorder {
    commands: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl CommandHandler for Recorder {
    fn execute(&mut self, command: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(())
    }
}

/// A configuration bound to the loopback interface.
pub fn local_config(rpcbind_port: u16, port_range: PortRange) -> Builder {
    Builder::new()
        .host(LOCALHOST)
        .rpcbind_port(rpcbind_port)
        .port_range(port_range)
        .portmapper_grace(Duration::from_millis(200))
}

/// A server running on its own thread.
pub struct TestServer {
    pub rpcbind: SocketAddr,
    pub recorder: Recorder,
    pub shutdown: CancellationToken,
    config: Config,
    thread: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub fn start(builder: Builder) -> TestServer {
        let recorder = Recorder::default();
        let mut server = builder.build(recorder.clone());
        let config = server.config().clone();
        let shutdown = server.shutdown_token();
        let thread = thread::spawn(move || server.run());
        let test_server = TestServer {
            rpcbind: SocketAddr::new(config.host, config.rpcbind_port),
            recorder,
            shutdown,
            config,
            thread,
        };
        test_server.wait_for_port(|_| true);
        test_server
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Asks the portmapper until it announces a port accepted by `expected`.
    pub fn wait_for_port(&self, expected: impl Fn(u16) -> bool) -> u16 {
        let rpcbind = self.rpcbind;
        retry(|| match get_port(rpcbind, Transport::Tcp) {
            Ok(port) if expected(port) => Some(port),
            _ => None,
        })
    }

    /// Connects to the VXI-11 service at `port` once it listens.
    pub fn connect(&self, port: u16) -> Vxi11Client {
        let addr = SocketAddr::new(self.config.host, port);
        retry(|| Vxi11Client::new(addr).ok())
    }

    /// Runs a complete session: create link, the given writes, one read, destroy link.
    pub fn session(&self, port: u16, commands: &[&str]) -> Vec<u8> {
        let mut client = self.connect(port);
        client.create_link("inst0").unwrap();
        for command in commands {
            client.device_write(command).unwrap();
        }
        let id = client.device_read().unwrap();
        client.destroy_link().unwrap();
        id.into_vec()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the server thread to return.
    pub fn join(self) -> Result<(), ServerError> {
        self.thread.join().unwrap()
    }

    /// Requests shutdown and completes the pending accept with an empty connection.
    pub fn stop(self) -> Result<(), ServerError> {
        self.shutdown.cancel();
        let range = self.config.port_range;
        retry(|| {
            for port in range.start()..=range.end() {
                let _ = TcpStream::connect(SocketAddr::new(self.config.host, port));
            }
            self.is_finished().then_some(())
        });
        self.join()
    }
}

/// Calls `attempt` until it returns a value. Panics after a few seconds.
pub fn retry<T>(mut attempt: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();
    loop {
        if let Some(value) = attempt() {
            return value;
        }
        assert!(start.elapsed() < RETRY_LIMIT, "Gave up after {:?}", RETRY_LIMIT);
        thread::sleep(RETRY_INTERVAL);
    }
}
