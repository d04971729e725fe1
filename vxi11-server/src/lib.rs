//! # VXI-11 Server Library
//!
//! This crate lets an oscilloscope's built-in Bode plot sweep drive an arbitrary
//! waveform generator. It impersonates the network stack of a vendor signal
//! generator: an rpcbind (portmap) service and the VXI-11 core channel.
//!
//! ## Architecture
//!
//! - **[`CommandHandler`] Trait**: receives every SCPI command the oscilloscope
//!   writes. Implementations interpret the command and drive the generator.
//! - **[`portmap::Portmapper`]**: one UDP and one TCP responder on the rpcbind port,
//!   each on its own thread, announcing where the VXI-11 service listens.
//! - **[`session::SessionEngine`]**: serves one VXI-11 connection at a time and
//!   tracks whether the oscilloscope started or finished a sweep.
//! - **[`registry::PortRegistry`]**: the only state shared between the two. The
//!   session engine moves the VXI-11 service to the next port after every session.
//! - **[`server::Server`]**: ties everything together.
//!
//! ## How It Works
//!
//! 1. The oscilloscope sends a GETPORT request for program 395183 to port 111
//! 2. A portmapper replies with the current VXI-11 port
//! 3. The oscilloscope connects to that port and creates a link
//! 4. Each DEVICE_WRITE is forwarded to the [`CommandHandler`]; every DEVICE_READ
//!    is answered with the configured identification string
//! 5. After DESTROY_LINK the connection and the listening socket are closed, the
//!    service moves to the next port of the range and waits again
//!
//! ## Basic Usage
//!
//! ```ignore
//! use std::error::Error;
//! use vxi11_server::{CommandHandler, server::Builder};
//!
//! struct Printer;
//!
//! impl CommandHandler for Printer {
//!     fn execute(&mut self, command: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
//!         println!("{}", command);
//!         Ok(())
//!     }
//! }
//!
//! let mut server = Builder::new().run_once(true).build(Printer);
//! server.run()?;
//! ```
//!
//! ## Error Handling
//!
//! Requests that cannot be answered are never replied to: the portmappers drop them
//! and the session engine closes the connection. Failures of the [`CommandHandler`]
//! are logged but do not change the reply. Only socket failures stop the server.
//!
//! ## Logging
//!
//! This crate uses the `log` crate. `info` covers the server lifecycle, `debug` the
//! individual procedures and commands, `trace` the raw packets.
//!
//! ## Thread Model
//!
//! The session engine runs on the thread calling [`server::Server::run`] and serves
//! exactly one connection at a time. The portmappers run on two additional threads.
use std::error::Error;

pub mod bridge;
pub mod error;
pub mod portmap;
pub mod registry;
pub mod server;
pub mod session;

/// Receives the SCPI commands written by the oscilloscope.
///
/// This is the boundary to the waveform generator. Implementors translate a
/// command such as `C1:BSWV WVTP,SINE,FRQ,1000` into calls to their hardware.
pub trait CommandHandler {
    /// Execute one command.
    ///
    /// The command has surrounding whitespace removed and may contain several
    /// `;`-separated parts. Queries (like `*IDN?`) are passed on as well.
    ///
    /// # Error Handling
    ///
    /// VXI-11 acknowledges a write regardless of what happens to it. Returned errors
    /// are logged and otherwise ignored.
    fn execute(&mut self, command: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
}
