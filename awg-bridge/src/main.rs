//! # AWG Bode Plot Bridge
//!
//! Lets the Bode plot function of an oscilloscope drive a waveform generator it
//! does not support natively.
//!
//! ## Overview
//!
//! The binary impersonates a vendor signal generator on the network using
//! [`vxi11_server`](https://docs.rs/vxi11-server/). The SCPI commands written by the
//! oscilloscope are interpreted by [`scpi::CommandParser`] and applied to the
//! generator selected on the command line.
//!
//! Binding the rpcbind port 111 usually requires elevated privileges.
pub mod drivers;
pub mod scpi;

use std::error::Error;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{ArgAction, Parser, builder::PossibleValuesParser};
use env_logger::Env;
use vxi11_protocol::RPCBIND_PORT;
use vxi11_server::{
    CommandHandler,
    registry::{DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START, PortRange},
    server::{Builder, Server},
};

use crate::drivers::{AwgDriver, driver_names, open_driver};
use crate::scpi::CommandParser;

/// Time the server gets to stop its sockets after Ctrl-C
const STOP_TIMEOUT: Duration = Duration::from_secs(3);
/// Time the runtime waits for the server thread after the main task finished
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(about = "Bode plot bridge between an oscilloscope and a waveform generator", long_about = None)]
struct Args {
    /// The waveform generator driver
    #[arg(
        default_value = "dummy",
        ignore_case = true,
        value_parser = PossibleValuesParser::new(driver_names().iter().copied())
    )]
    awg: String,

    /// Serial port or VISA resource of the generator
    #[arg(default_value = "/dev/ttyUSB0")]
    port: String,

    #[arg(default_value = "19200")]
    baudrate: u32,

    /// Increase the log level, can be repeated
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,

    /// Stop after the first complete sweep
    #[arg(short = '1', long)]
    run_once: bool,

    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, default_value_t = RPCBIND_PORT, value_parser = port_number)]
    rpcbind_port: u16,

    #[arg(long, default_value_t = DEFAULT_PORT_RANGE_START, value_parser = port_number)]
    port_start: u16,

    #[arg(long, default_value_t = DEFAULT_PORT_RANGE_END, value_parser = port_number)]
    port_end: u16,

    /// Seconds without a connection after which a started sweep counts as finished
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Identification returned to the oscilloscope
    #[arg(long, default_value = "IDN-SGLT-PRI SDG0000X")]
    id: String,
}

fn port_number(s: &str) -> Result<u16, String> {
    clap_num::number_range(s, 1, 65535)
}

fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Runs the server until it stops by itself or Ctrl-C is pressed.
async fn serve<T>(mut server: Server<T>) -> Result<(), Box<dyn Error>>
where
    T: CommandHandler + Send + 'static,
{
    let shutdown = server.shutdown_handle();
    let mut task = tokio::task::spawn_blocking(move || server.run());
    tokio::select! {
        joined = &mut task => return Ok(joined??),
        signal = tokio::signal::ctrl_c() => signal?,
    }

    log::info!("Ctrl-C pressed, stopping");
    tokio::task::spawn_blocking(move || shutdown.shutdown()).await?;
    match tokio::time::timeout(STOP_TIMEOUT, task).await {
        Ok(joined) => Ok(joined??),
        Err(_) => {
            log::warn!("Server did not stop within {:?}", STOP_TIMEOUT);
            Ok(())
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(log_filter(args.verbose)))
        .init();
    log::info!("Starting AWG bridge");

    let port_range = PortRange::new(args.port_start, args.port_end).ok_or_else(|| {
        format!(
            "Invalid port range {}..{}: start must not exceed end",
            args.port_start, args.port_end
        )
    })?;

    log::info!("Initializing {} generator on {}", args.awg, args.port);
    let mut driver = open_driver(&args.awg, &args.port, args.baudrate)?;
    driver.initialize()?;
    log::info!("Generator identifies as '{}'", driver.get_id()?);
    let driver = Arc::new(Mutex::new(driver));

    let server = Builder::new()
        .host(args.host)
        .rpcbind_port(args.rpcbind_port)
        .port_range(port_range)
        .end_of_session_timeout(Duration::from_secs(args.timeout))
        .run_once(args.run_once)
        .id_string(args.id)
        .build(CommandParser::new(Arc::clone(&driver)));

    if args.run_once {
        log::info!("Stopping after one sweep, press Ctrl-C to stop earlier");
    } else {
        log::info!("Press Ctrl-C to stop");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(server));
    // The server thread may still be busy with a session
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

    let mut driver = driver.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = driver.disconnect() {
        log::warn!("Failed to disconnect the generator: {}", e);
    }
    if let Err(e) = &result {
        log::error!("Server stopped: {}", e);
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["awg-bridge"]);
        assert_eq!(args.awg, "dummy");
        assert_eq!(args.port, "/dev/ttyUSB0");
        assert_eq!(args.baudrate, 19200);
        assert_eq!(args.rpcbind_port, 111);
        assert_eq!(args.port_start, 9010);
        assert_eq!(args.port_end, 9019);
        assert_eq!(args.timeout, 10);
        assert!(!args.run_once);
    }

    #[test]
    fn options() {
        let args = Args::parse_from([
            "awg-bridge",
            "dummy",
            "/dev/ttyACM0",
            "115200",
            "-1",
            "-vv",
            "--rpcbind-port",
            "1111",
            "--id",
            "IDN-SGLT-PRI SDG2042X",
        ]);
        assert_eq!(args.port, "/dev/ttyACM0");
        assert_eq!(args.baudrate, 115200);
        assert!(args.run_once);
        assert_eq!(log_filter(args.verbose), "trace");
        assert_eq!(args.rpcbind_port, 1111);
        assert_eq!(args.id, "IDN-SGLT-PRI SDG2042X");
    }

    #[test]
    fn rejects_port_zero_and_unknown_driver() {
        assert!(Args::try_parse_from(["awg-bridge", "--port-start", "0"]).is_err());
        assert!(Args::try_parse_from(["awg-bridge", "--rpcbind-port", "70000"]).is_err());
        assert!(Args::try_parse_from(["awg-bridge", "sdg1000"]).is_err());
    }

    #[test]
    fn verbosity() {
        assert_eq!(log_filter(0), "info");
        assert_eq!(log_filter(1), "debug");
        assert_eq!(log_filter(5), "trace");
    }
}
