use std::fmt::Display;

use crate::codec::{opaque_at, u32_at};
use crate::error::ProtocolError;

/// Well known port of the rpcbind / portmap service
pub const RPCBIND_PORT: u16 = 111;
/// Program id of the portmap service
pub const PORTMAP_PROGRAM: u32 = 100_000;
/// Portmap version spoken by the oscilloscopes (RFC 1057)
pub const PORTMAP_VERSION: u32 = 2;
/// Portmap procedure that maps a program id to a port
pub const GETPORT: u32 = 3;
/// Program id of the VXI-11 core channel
pub const VXI11_CORE_PROGRAM: u32 = 395_183;
pub const VXI11_CORE_VERSION: u32 = 1;

pub const IPPROTO_TCP: u32 = 6;
pub const IPPROTO_UDP: u32 = 17;

/// Maximum receive size announced in every CREATE_LINK reply
pub const MAX_RECEIVE_SIZE: u32 = 0x0080_0000;
/// DEVICE_READ reason flag: the end of the message was reached
pub const REASON_END: u32 = 4;

pub(crate) const MSG_CALL: u32 = 0;
pub(crate) const MSG_REPLY: u32 = 1;
pub(crate) const REPLY_ACCEPTED: u32 = 0;
pub(crate) const AUTH_NULL: u32 = 0;
pub(crate) const ACCEPT_SUCCESS: u32 = 0;
pub(crate) const RPC_VERSION: u32 = 2;

/// Fixed byte offsets into received requests.
///
/// Portmap offsets apply to the call as it appears in a UDP datagram,
/// i.e. after a TCP record marker has been stripped. VXI-11 offsets are
/// absolute offsets into a TCP record with its 4 byte marker still in front.
pub mod offsets {
    pub const PORTMAP_XID: usize = 0x00;
    pub const PORTMAP_PROCEDURE: usize = 0x14;
    pub const PORTMAP_PROGRAM: usize = 0x28;
    /// A portmap request must be strictly longer than this
    pub const PORTMAP_MIN_LEN: usize = 0x2C;

    pub const RECORD_MARKER_LEN: usize = 0x04;
    pub const DEVICE_XID: usize = 0x04;
    pub const DEVICE_PROGRAM: usize = 0x10;
    pub const DEVICE_PROCEDURE: usize = 0x18;
    pub const CREATE_LINK_DEVICE_LEN: usize = 0x38;
    pub const DEVICE_WRITE_DATA_LEN: usize = 0x3C;
}

/// The transport a message travels on. Only TCP messages carry a record marker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    /// The IP protocol number used in portmap mappings
    pub fn ip_protocol(&self) -> u32 {
        match self {
            Transport::Udp => IPPROTO_UDP,
            Transport::Tcp => IPPROTO_TCP,
        }
    }
}

impl Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Udp => write!(f, "UDP"),
            Transport::Tcp => write!(f, "TCP"),
        }
    }
}

/// The VXI-11 core procedures understood by the emulated instrument.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Procedure {
    CreateLink,
    DeviceWrite,
    DeviceRead,
    DestroyLink,
}

impl Procedure {
    pub fn id(self) -> u32 {
        match self {
            Procedure::CreateLink => 10,
            Procedure::DeviceWrite => 11,
            Procedure::DeviceRead => 12,
            Procedure::DestroyLink => 23,
        }
    }
}

impl TryFrom<u32> for Procedure {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(Procedure::CreateLink),
            11 => Ok(Procedure::DeviceWrite),
            12 => Ok(Procedure::DeviceRead),
            23 => Ok(Procedure::DestroyLink),
            other => Err(ProtocolError::UnknownProcedure(other)),
        }
    }
}

impl Display for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Procedure::CreateLink => "CREATE_LINK",
            Procedure::DeviceWrite => "DEVICE_WRITE",
            Procedure::DeviceRead => "DEVICE_READ",
            Procedure::DestroyLink => "DESTROY_LINK",
        };
        write!(f, "{}", name)
    }
}

/// A validated rpcbind GETPORT call asking for the VXI-11 core port.
///
/// The view borrows the received datagram; nothing is copied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortmapCall<'a> {
    buf: &'a [u8],
}

impl<'a> PortmapCall<'a> {
    /// Accepts only GETPORT requests for the VXI-11 core program.
    pub fn parse(buf: &'a [u8]) -> Result<PortmapCall<'a>, ProtocolError> {
        if buf.len() <= offsets::PORTMAP_MIN_LEN {
            return Err(ProtocolError::MalformedRequest {
                needed: offsets::PORTMAP_MIN_LEN + 1,
                got: buf.len(),
            });
        }
        let procedure = u32_at(buf, offsets::PORTMAP_PROCEDURE)?;
        if procedure != GETPORT {
            return Err(ProtocolError::UnknownProcedure(procedure));
        }
        let program = u32_at(buf, offsets::PORTMAP_PROGRAM)?;
        if program != VXI11_CORE_PROGRAM {
            return Err(ProtocolError::ProtocolMismatch(program));
        }
        Ok(PortmapCall { buf })
    }

    pub fn xid(&self) -> u32 {
        // Length was checked in `parse`
        u32_at(self.buf, offsets::PORTMAP_XID).unwrap_or_default()
    }
}

/// A VXI-11 core call, borrowed from a complete TCP record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceCall<'a> {
    record: &'a [u8],
    xid: u32,
    procedure: Procedure,
}

/// The decoded arguments of a VXI-11 core call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceRequest<'a> {
    /// Negotiates a link. The device name (e.g. `inst0`) is not interpreted.
    CreateLink { device: &'a [u8] },
    /// Carries one SCPI command.
    DeviceWrite { data: &'a [u8] },
    DeviceRead,
    DestroyLink,
}

impl<'a> DeviceCall<'a> {
    /// Checks the program id and procedure of a record.
    ///
    /// Fails with [`ProtocolError::ProtocolMismatch`] for a foreign program and
    /// with [`ProtocolError::UnknownProcedure`] for anything but the four core procedures.
    pub fn parse(record: &'a [u8]) -> Result<DeviceCall<'a>, ProtocolError> {
        let program = u32_at(record, offsets::DEVICE_PROGRAM)?;
        if program != VXI11_CORE_PROGRAM {
            return Err(ProtocolError::ProtocolMismatch(program));
        }
        let procedure = Procedure::try_from(u32_at(record, offsets::DEVICE_PROCEDURE)?)?;
        let xid = u32_at(record, offsets::DEVICE_XID)?;
        Ok(DeviceCall {
            record,
            xid,
            procedure,
        })
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn procedure(&self) -> Procedure {
        self.procedure
    }

    /// Extracts the procedure arguments that the emulation cares about.
    pub fn request(&self) -> Result<DeviceRequest<'a>, ProtocolError> {
        match self.procedure {
            Procedure::CreateLink => Ok(DeviceRequest::CreateLink {
                device: opaque_at(self.record, offsets::CREATE_LINK_DEVICE_LEN)?,
            }),
            Procedure::DeviceWrite => Ok(DeviceRequest::DeviceWrite {
                data: opaque_at(self.record, offsets::DEVICE_WRITE_DATA_LEN)?,
            }),
            Procedure::DeviceRead => Ok(DeviceRequest::DeviceRead),
            Procedure::DestroyLink => Ok(DeviceRequest::DestroyLink),
        }
    }
}

#[test]
fn procedure_ids_round_trip() {
    for procedure in [
        Procedure::CreateLink,
        Procedure::DeviceWrite,
        Procedure::DeviceRead,
        Procedure::DestroyLink,
    ] {
        assert_eq!(Procedure::try_from(procedure.id()).unwrap(), procedure);
    }
    assert!(matches!(
        Procedure::try_from(13),
        Err(ProtocolError::UnknownProcedure(13))
    ));
}
