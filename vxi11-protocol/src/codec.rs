/// Encoders and decoders for the ONC-RPC messages exchanged with the oscilloscope
use std::io::{self, Read};

use crate::{
    error::ProtocolError,
    protocol::{
        ACCEPT_SUCCESS, AUTH_NULL, MAX_RECEIVE_SIZE, MSG_CALL, MSG_REPLY, REASON_END,
        REPLY_ACCEPTED, RPC_VERSION, Transport,
    },
};

/// Length of the fixed accepted-reply header
pub const REPLY_HEADER_LEN: usize = 24;
/// Length of the fixed call header with AUTH_NULL credentials and verifier
pub const CALL_HEADER_LEN: usize = 40;

const LAST_FRAGMENT: u32 = 0x8000_0000;
const FRAGMENT_LEN_MASK: u32 = 0x7FFF_FFFF;

/// Identification trailer sent after the id string of every DEVICE_READ reply
const READ_TRAILER: &[u8; 3] = b"\n\0\0";

pub fn encode_u32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Decodes the first four bytes of `bytes` as a big-endian integer.
pub fn decode_u32(bytes: &[u8]) -> Result<u32, ProtocolError> {
    u32_at(bytes, 0)
}

/// Reads a big-endian integer at a fixed offset.
pub fn u32_at(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    let end = offset + 4;
    let field = buf
        .get(offset..end)
        .ok_or(ProtocolError::MalformedRequest {
            needed: end,
            got: buf.len(),
        })?;
    Ok(u32::from_be_bytes([field[0], field[1], field[2], field[3]]))
}

/// Reads a length-prefixed byte string whose length field sits at `len_offset`.
pub fn opaque_at(buf: &[u8], len_offset: usize) -> Result<&[u8], ProtocolError> {
    let len = u32_at(buf, len_offset)? as usize;
    let start = len_offset + 4;
    let end = start.saturating_add(len);
    buf.get(start..end).ok_or(ProtocolError::MalformedRequest {
        needed: end,
        got: buf.len(),
    })
}

/// The TCP record marker for a message of `len` bytes sent as a single, last fragment.
pub fn size_header(len: usize) -> [u8; 4] {
    encode_u32(len as u32 | LAST_FRAGMENT)
}

/// The 24 byte header of an accepted, successful reply with an AUTH_NULL verifier.
pub fn reply_header(xid: u32) -> [u8; REPLY_HEADER_LEN] {
    let mut header = [0u8; REPLY_HEADER_LEN];
    for (chunk, word) in header.chunks_exact_mut(4).zip([
        xid,
        MSG_REPLY,
        REPLY_ACCEPTED,
        AUTH_NULL,
        0,
        ACCEPT_SUCCESS,
    ]) {
        chunk.copy_from_slice(&encode_u32(word));
    }
    header
}

/// Assembles a complete reply. Only TCP replies carry the record marker.
pub fn build_response(xid: u32, payload: &[u8], transport: Transport) -> Vec<u8> {
    let header = reply_header(xid);
    let mut response = Vec::with_capacity(4 + REPLY_HEADER_LEN + payload.len());
    if transport == Transport::Tcp {
        response.extend_from_slice(&size_header(header.len() + payload.len()));
    }
    response.extend_from_slice(&header);
    response.extend_from_slice(payload);
    response
}

/// Prefixes a message with its TCP record marker.
pub fn frame_record(message: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(4 + message.len());
    record.extend_from_slice(&size_header(message.len()));
    record.extend_from_slice(message);
    record
}

pub fn getport_reply(port: u16) -> [u8; 4] {
    encode_u32(u32::from(port))
}

/// No error, link id 0, abort port 0 and the maximum receive size.
/// The negotiation payload of the request does not influence this reply.
pub fn create_link_reply() -> [u8; 16] {
    let mut reply = [0u8; 16];
    reply[12..].copy_from_slice(&encode_u32(MAX_RECEIVE_SIZE));
    reply
}

pub fn device_write_reply(written: u32) -> [u8; 8] {
    let mut reply = [0u8; 8];
    reply[4..].copy_from_slice(&encode_u32(written));
    reply
}

/// No error, reason END and the identification string.
///
/// The length field counts the id plus the newline; two fill bytes follow.
pub fn device_read_reply(id: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(12 + id.len() + READ_TRAILER.len());
    reply.extend_from_slice(&encode_u32(0));
    reply.extend_from_slice(&encode_u32(REASON_END));
    reply.extend_from_slice(&encode_u32(id.len() as u32 + 1));
    reply.extend_from_slice(id);
    reply.extend_from_slice(READ_TRAILER);
    reply
}

pub fn destroy_link_reply() -> [u8; 4] {
    encode_u32(0)
}

/// Encodes a call message with AUTH_NULL credentials. No record marker is added.
pub fn encode_call(xid: u32, program: u32, version: u32, procedure: u32, args: &[u8]) -> Vec<u8> {
    let mut call = Vec::with_capacity(CALL_HEADER_LEN + args.len());
    for word in [
        xid,
        MSG_CALL,
        RPC_VERSION,
        program,
        version,
        procedure,
        AUTH_NULL,
        0,
        AUTH_NULL,
        0,
    ] {
        call.extend_from_slice(&encode_u32(word));
    }
    call.extend_from_slice(args);
    call
}

fn push_opaque(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&encode_u32(data.len() as u32));
    out.extend_from_slice(data);
    let padding = (4 - data.len() % 4) % 4;
    out.extend_from_slice(&[0u8; 3][..padding]);
}

pub fn getport_args(program: u32, version: u32, protocol: u32) -> Vec<u8> {
    [program, version, protocol, 0]
        .into_iter()
        .flat_map(encode_u32)
        .collect()
}

pub fn create_link_args(client_id: u32, device: &[u8]) -> Vec<u8> {
    let mut args = Vec::new();
    // client id, lock device, lock timeout
    for word in [client_id, 0, 0] {
        args.extend_from_slice(&encode_u32(word));
    }
    push_opaque(&mut args, device);
    args
}

pub fn device_write_args(link_id: u32, data: &[u8]) -> Vec<u8> {
    let mut args = Vec::new();
    // link id, io timeout, lock timeout, flags (END)
    for word in [link_id, 10_000, 0, 0x08] {
        args.extend_from_slice(&encode_u32(word));
    }
    push_opaque(&mut args, data);
    args
}

pub fn device_read_args(link_id: u32, request_size: u32) -> Vec<u8> {
    // link id, request size, io timeout, lock timeout, flags, term char
    [link_id, request_size, 10_000, 0, 0, 0]
        .into_iter()
        .flat_map(encode_u32)
        .collect()
}

pub fn destroy_link_args(link_id: u32) -> Vec<u8> {
    encode_u32(link_id).to_vec()
}

/// Validates the header of a reply (without record marker) and returns its payload.
pub fn parse_reply(message: &[u8], expected_xid: u32) -> Result<&[u8], ProtocolError> {
    if message.len() < REPLY_HEADER_LEN {
        return Err(ProtocolError::InvalidReply(format!(
            "Reply has {} bytes, header alone needs {}",
            message.len(),
            REPLY_HEADER_LEN
        )));
    }
    let xid = u32_at(message, 0)?;
    if xid != expected_xid {
        return Err(ProtocolError::InvalidReply(format!(
            "Transaction id {:#010x} does not match {:#010x}",
            xid, expected_xid
        )));
    }
    if u32_at(message, 4)? != MSG_REPLY {
        return Err(ProtocolError::InvalidReply("Not a reply".to_string()));
    }
    if u32_at(message, 8)? != REPLY_ACCEPTED || u32_at(message, 20)? != ACCEPT_SUCCESS {
        return Err(ProtocolError::InvalidReply(
            "Call was not executed successfully".to_string(),
        ));
    }
    Ok(&message[REPLY_HEADER_LEN..])
}

/// Reads one complete record from a TCP stream, joining all fragments.
///
/// The returned buffer starts with a record marker for the joined message so that
/// the fixed VXI-11 offsets apply to it. Returns `Ok(None)` if the peer closed the
/// connection before sending the first byte of a record.
pub fn read_record(reader: &mut impl Read, max_len: usize) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut record = vec![0u8; 4];
    let mut marker = [0u8; 4];
    loop {
        if record.len() == 4 {
            // A clean close is only possible on a record boundary
            if read_first(reader, &mut marker)? == 0 {
                return Ok(None);
            }
        } else {
            reader.read_exact(&mut marker)?;
        }
        let marker = u32::from_be_bytes(marker);
        let fragment_len = (marker & FRAGMENT_LEN_MASK) as usize;
        let total = record.len() - 4 + fragment_len;
        if total > max_len {
            return Err(ProtocolError::TooLarge {
                max: max_len,
                got: total,
            });
        }
        let start = record.len();
        record.resize(start + fragment_len, 0);
        reader.read_exact(&mut record[start..])?;
        if marker & LAST_FRAGMENT != 0 {
            let header = size_header(record.len() - 4);
            record[..4].copy_from_slice(&header);
            return Ok(Some(record));
        }
    }
}

fn read_first(reader: &mut impl Read, marker: &mut [u8; 4]) -> io::Result<usize> {
    let n = loop {
        match reader.read(&mut marker[..1]) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => break other?,
        }
    };
    if n > 0 {
        reader.read_exact(&mut marker[1..])?;
    }
    Ok(n)
}

/// Default limit for [`read_record`], equal to the announced maximum receive size
pub const DEFAULT_MAX_RECORD_LEN: usize = MAX_RECEIVE_SIZE as usize;

#[test]
fn size_header_sets_last_fragment() {
    assert_eq!(size_header(28), [0x80, 0x00, 0x00, 0x1C]);
}

#[test]
fn reply_header_layout() {
    let header = reply_header(0x0102_0304);
    assert_eq!(
        header,
        [
            0x01, 0x02, 0x03, 0x04, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0
        ]
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn udp_response_has_no_record_marker() {
        let response = build_response(0xAABB_CCDD, &getport_reply(9010), Transport::Udp);
        assert_eq!(response.len(), REPLY_HEADER_LEN + 4);
        assert_eq!(&response[..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&response[REPLY_HEADER_LEN..], &[0x00, 0x00, 0x23, 0x32]);
    }

    #[test]
    fn tcp_response_is_framed() {
        let response = build_response(1, &getport_reply(9019), Transport::Tcp);
        assert_eq!(&response[..4], &[0x80, 0x00, 0x00, 0x1C]);
        assert_eq!(&response[4..8], &[0, 0, 0, 1]);
        assert_eq!(&response[28..], &[0x00, 0x00, 0x23, 0x3B]);
    }

    #[test]
    fn create_link_reply_is_fixed() {
        assert_eq!(
            create_link_reply(),
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x80, 0x00, 0x00]
        );
    }

    #[test]
    fn device_write_reply_echoes_length() {
        assert_eq!(device_write_reply(10), [0, 0, 0, 0, 0, 0, 0, 10]);
    }

    #[test]
    fn device_read_reply_layout() {
        let id = b"IDN-SGLT-PRI SDG0000X";
        let reply = device_read_reply(id);
        assert_eq!(&reply[..8], &[0, 0, 0, 0, 0, 0, 0, 4]);
        assert_eq!(decode_u32(&reply[8..]).unwrap(), id.len() as u32 + 1);
        assert_eq!(&reply[12..12 + id.len()], id);
        assert!(reply.ends_with(&[0x0A, 0x00, 0x00]));
        assert_eq!(reply.len() % 4, 0);
    }

    #[test]
    fn opaque_is_padded() {
        let args = device_write_args(0, b"*IDN?");
        // 4 words, length, 5 bytes of data and 3 fill bytes
        assert_eq!(args.len(), 16 + 4 + 8);
        assert_eq!(&args[16..20], &[0, 0, 0, 5]);
        assert_eq!(&args[25..], &[0, 0, 0]);
    }

    #[test]
    fn u32_at_out_of_bounds() {
        match u32_at(&[0; 6], 4) {
            Err(ProtocolError::MalformedRequest { needed, got }) => {
                assert_eq!(needed, 8);
                assert_eq!(got, 6);
            }
            other => panic!("expected MalformedRequest, got {:?}", other),
        }
    }

    #[test]
    fn parse_reply_checks_xid() {
        let response = build_response(5, &destroy_link_reply(), Transport::Udp);
        assert_eq!(parse_reply(&response, 5).unwrap(), &[0, 0, 0, 0]);
        assert!(matches!(
            parse_reply(&response, 6),
            Err(ProtocolError::InvalidReply(_))
        ));
    }

    #[test]
    fn read_single_record() {
        let message = encode_call(3, 1, 1, 1, &[]);
        let mut cursor = Cursor::new(frame_record(&message));
        let record = read_record(&mut cursor, DEFAULT_MAX_RECORD_LEN)
            .unwrap()
            .unwrap();
        assert_eq!(record, frame_record(&message));
        assert!(read_record(&mut cursor, DEFAULT_MAX_RECORD_LEN)
            .unwrap()
            .is_none());
    }

    #[test]
    fn read_fragmented_record() {
        let message = encode_call(3, 1, 1, 1, b"abcdefgh");
        let (first, second) = message.split_at(20);
        let mut data = encode_u32(first.len() as u32).to_vec();
        data.extend_from_slice(first);
        data.extend_from_slice(&size_header(second.len()));
        data.extend_from_slice(second);

        let record = read_record(&mut Cursor::new(data), DEFAULT_MAX_RECORD_LEN)
            .unwrap()
            .unwrap();
        assert_eq!(record, frame_record(&message));
    }

    #[test]
    fn read_record_too_large() {
        let data = size_header(1025).to_vec();
        match read_record(&mut Cursor::new(data), 1024) {
            Err(ProtocolError::TooLarge { max, got }) => {
                assert_eq!(max, 1024);
                assert_eq!(got, 1025);
            }
            other => panic!("expected TooLarge, got {:?}", other),
        }
    }

    #[test]
    fn read_truncated_record() {
        let mut data = size_header(16).to_vec();
        data.extend_from_slice(&[0; 8]);
        match read_record(&mut Cursor::new(data), 1024) {
            Err(ProtocolError::IoError(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected IoError, got {:?}", other),
        }
    }
}
