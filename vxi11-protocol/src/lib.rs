//! # VXI-11 Protocol Library
//!
//! This crate provides the small subset of [ONC-RPC](https://www.rfc-editor.org/rfc/rfc1057)
//! and the VXI-11 core channel that an oscilloscope uses to remote-control a
//! signal generator during a Bode plot sweep.
//!
//! ## Overview
//!
//! The oscilloscope first asks the rpcbind (portmap) service on port 111 for the
//! port of the VXI-11 core program (395183), then opens a TCP connection to that
//! port and issues `CREATE_LINK`, `DEVICE_WRITE`, `DEVICE_READ` and `DESTROY_LINK`
//! calls. This library allows you to:
//!
//! - Validate GETPORT and VXI-11 calls by reading fields at fixed offsets,
//!   without copying the received buffer
//! - Build the fixed replies an instrument sends back
//! - Read record-marked messages from a TCP stream
//! - Build calls, for clients and tests
//!
//! ## Message Format
//!
//! Every reply consists of a 24 byte header followed by the payload:
//!
//! - **xid**: the transaction id of the call
//! - **message type**: `REPLY` (1)
//! - **reply state**: `ACCEPTED` (0)
//! - **verifier**: `AUTH_NULL` (0) with length 0
//! - **accept state**: `SUCCESS` (0)
//!
//! On TCP, each message is preceded by a record marker: the message length with the
//! highest bit set to flag the last fragment.
//!
//! ## Basic Usage
//!
//! ### Answering a GETPORT request
//!
//! ```
//! use vxi11_protocol::codec::{build_response, encode_call, getport_args, getport_reply};
//! use vxi11_protocol::*;
//!
//! let datagram = encode_call(
//!     42,
//!     PORTMAP_PROGRAM,
//!     PORTMAP_VERSION,
//!     GETPORT,
//!     &getport_args(VXI11_CORE_PROGRAM, VXI11_CORE_VERSION, IPPROTO_TCP),
//! );
//! let call = PortmapCall::parse(&datagram).expect("GETPORT for VXI-11 should parse");
//! let reply = build_response(call.xid(), &getport_reply(9010), Transport::Udp);
//! assert_eq!(reply.len(), 28);
//! assert_eq!(&reply[24..], &[0x00, 0x00, 0x23, 0x32]);
//! ```
//!
//! ### Decoding a DEVICE_WRITE call
//!
//! ```
//! use vxi11_protocol::codec::{device_write_args, encode_call, frame_record};
//! use vxi11_protocol::*;
//!
//! let record = frame_record(&encode_call(
//!     7,
//!     VXI11_CORE_PROGRAM,
//!     VXI11_CORE_VERSION,
//!     Procedure::DeviceWrite.id(),
//!     &device_write_args(0, b"C1:OUTP ON"),
//! ));
//! let call = DeviceCall::parse(&record).expect("Call should parse");
//! match call.request().expect("Arguments should be complete") {
//!     DeviceRequest::DeviceWrite { data } => assert_eq!(data, b"C1:OUTP ON"),
//!     other => panic!("unexpected request {:?}", other),
//! }
//! ```
//!
//! ## Error Handling
//!
//! Decoding failures are reported as [`error::ProtocolError`]. A server is expected
//! to drop requests that fail to decode rather than reply to them.
//!
//! ## Features
//!
//! - `tokio`: a `tokio_util::codec` implementation of record marking in the `framed` module.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
#[cfg(feature = "tokio")]
pub mod framed;
