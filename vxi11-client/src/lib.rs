//! # VXI-11 Client
//!
//! A small blocking client for the two services an oscilloscope talks to when it
//! drives a signal generator: rpcbind GETPORT and the VXI-11 core channel.
//!
//! ## Overview
//!
//! This crate is the counterpart of [`vxi11_server`](https://docs.rs/vxi11-server/).
//! It speaks exactly the calls the oscilloscope makes, which makes it handy for
//! checking a running bridge from the bench and for end-to-end tests.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use vxi11_client::{Vxi11Client, get_port};
//! use vxi11_protocol::Transport;
//!
//! let port = get_port("192.168.1.20:111", Transport::Udp)?;
//! let mut client = Vxi11Client::new(("192.168.1.20", port))?;
//! client.create_link("inst0")?;
//! client.device_write("*IDN?")?;
//! let id = client.device_read()?;
//! println!("{}", String::from_utf8_lossy(&id));
//! client.device_write("C1:BSWV WVTP,SINE,FRQ,1000")?;
//! client.destroy_link()?;
//! ```
use std::{
    io::{self, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use vxi11_protocol::{
    GETPORT, PORTMAP_PROGRAM, PORTMAP_VERSION, Procedure, Transport, VXI11_CORE_PROGRAM,
    VXI11_CORE_VERSION,
    codec::{
        DEFAULT_MAX_RECORD_LEN, create_link_args, decode_u32, destroy_link_args,
        device_read_args, device_write_args, encode_call, frame_record, getport_args,
        parse_reply, read_record, u32_at,
    },
    error::ProtocolError,
};

const UDP_TIMEOUT: Duration = Duration::from_secs(2);
const READ_REQUEST_SIZE: u32 = 1024;

/// Asks the rpcbind service at `addr` for the TCP port of the VXI-11 core channel.
pub fn get_port(addr: impl ToSocketAddrs, transport: Transport) -> Result<u16, ProtocolError> {
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No address given"))?;
    let xid = 0x4750_0000 | u32::from(addr.port());
    let call = encode_call(
        xid,
        PORTMAP_PROGRAM,
        PORTMAP_VERSION,
        GETPORT,
        &getport_args(VXI11_CORE_PROGRAM, VXI11_CORE_VERSION, Transport::Tcp.ip_protocol()),
    );
    let port = match transport {
        Transport::Udp => {
            let local: SocketAddr = if addr.is_ipv4() {
                ([0, 0, 0, 0], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            let socket = UdpSocket::bind(local)?;
            socket.set_read_timeout(Some(UDP_TIMEOUT))?;
            socket.send_to(&call, addr)?;
            let mut buf = [0u8; 128];
            let len = socket.recv(&mut buf)?;
            decode_u32(parse_reply(&buf[..len], xid)?)?
        }
        Transport::Tcp => {
            let mut tcp = TcpStream::connect(addr)?;
            tcp.write_all(&frame_record(&call))?;
            let record = read_record(&mut tcp, DEFAULT_MAX_RECORD_LEN)?.ok_or_else(closed)?;
            decode_u32(parse_reply(&record[4..], xid)?)?
        }
    };
    u16::try_from(port)
        .map_err(|_| ProtocolError::InvalidReply(format!("Port {} out of range", port)))
}

fn closed() -> ProtocolError {
    ProtocolError::InvalidReply("Connection closed before the reply".to_string())
}

/// The parameters announced in a CREATE_LINK reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Link {
    pub link_id: u32,
    pub abort_port: u32,
    pub max_receive_size: u32,
}

/// VXI-11 client for one connection to the core channel.
pub struct Vxi11Client {
    tcp: TcpStream,
    next_xid: u32,
    link_id: u32,
}

impl Vxi11Client {
    pub fn new(addr: impl ToSocketAddrs) -> io::Result<Vxi11Client> {
        Ok(Vxi11Client {
            tcp: TcpStream::connect(addr)?,
            next_xid: 1,
            link_id: 0,
        })
    }

    /// Open a link to `device`, usually `inst0`.
    pub fn create_link(&mut self, device: &str) -> Result<Link, ProtocolError> {
        let reply = self.call(
            Procedure::CreateLink,
            &create_link_args(0x5343_4F50, device.as_bytes()),
        )?;
        let link = Link {
            link_id: u32_at(&reply, 4)?,
            abort_port: u32_at(&reply, 8)?,
            max_receive_size: u32_at(&reply, 12)?,
        };
        self.link_id = link.link_id;
        Ok(link)
    }

    /// Write a command. Returns the number of bytes the device accepted.
    pub fn device_write(&mut self, command: &str) -> Result<u32, ProtocolError> {
        let reply = self.call(
            Procedure::DeviceWrite,
            &device_write_args(self.link_id, command.as_bytes()),
        )?;
        u32_at(&reply, 4)
    }

    /// Read the pending response of the device.
    pub fn device_read(&mut self) -> Result<Box<[u8]>, ProtocolError> {
        let reply = self.call(
            Procedure::DeviceRead,
            &device_read_args(self.link_id, READ_REQUEST_SIZE),
        )?;
        let len = u32_at(&reply, 8)? as usize;
        let data = reply.get(12..12 + len).ok_or_else(|| {
            ProtocolError::InvalidReply(format!("DEVICE_READ announces {} bytes", len))
        })?;
        Ok(data.into())
    }

    /// Close the link. The device closes the connection afterwards.
    pub fn destroy_link(&mut self) -> Result<(), ProtocolError> {
        self.call(Procedure::DestroyLink, &destroy_link_args(self.link_id))?;
        Ok(())
    }

    fn call(&mut self, procedure: Procedure, args: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        let call = encode_call(
            xid,
            VXI11_CORE_PROGRAM,
            VXI11_CORE_VERSION,
            procedure.id(),
            args,
        );
        self.tcp.write_all(&frame_record(&call))?;
        let record = read_record(&mut self.tcp, DEFAULT_MAX_RECORD_LEN)?.ok_or_else(closed)?;
        let payload = parse_reply(&record[4..], xid)?;
        let error = decode_u32(payload)?;
        if error != 0 {
            return Err(ProtocolError::InvalidReply(format!(
                "{} failed with device error {}",
                procedure, error
            )));
        }
        Ok(payload.to_vec())
    }
}
