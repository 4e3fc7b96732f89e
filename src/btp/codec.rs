//! OER serialization of the BTP envelope.
//!
//! Wire layout, big-endian throughout:
//!
//! ```text
//! u8 type | u32 requestId | typed payload | var-uint count { var-str name, u8 contentType, var-octets data }
//! ```
//!
//! Variable-length fields use the OER octet-string form: a single length byte
//! below 128, otherwise `0x80 | n` followed by `n` big-endian length bytes.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::{
    BtpData, BtpError, BtpFulfill, BtpPacket, BtpPrepare, BtpReject, ContentType, PacketType,
    ProtocolData,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of packet")]
    UnexpectedEof,
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("unknown content type {0}")]
    UnknownContentType(u8),
    #[error("length prefix of {0} bytes is not supported")]
    LengthPrefixTooLong(usize),
    #[error("{0} trailing bytes after packet end")]
    TrailingBytes(usize),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("field {0} exceeds the packet length")]
    Overflow(&'static str),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.read_exact(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(out))
    }

    /// OER variable-length octet string.
    fn read_var_octets(&mut self) -> Result<&'a [u8], CodecError> {
        let first = self.read_u8()?;
        let len = if first < 0x80 {
            first as usize
        } else {
            let len_of_len = (first & 0x7f) as usize;
            if len_of_len == 0 || len_of_len > 4 {
                return Err(CodecError::LengthPrefixTooLong(len_of_len));
            }
            let mut len = 0usize;
            for byte in self.read_exact(len_of_len)? {
                len = (len << 8) | *byte as usize;
            }
            len
        };
        self.read_exact(len)
    }

    fn read_var_string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let bytes = self.read_var_octets()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
    }

    fn read_var_uint(&mut self) -> Result<u64, CodecError> {
        let bytes = self.read_var_octets()?;
        if bytes.len() > 8 {
            return Err(CodecError::Overflow("var-uint"));
        }
        let mut out = 0u64;
        for byte in bytes {
            out = (out << 8) | *byte as u64;
        }
        Ok(out)
    }

    fn read_uuid(&mut self) -> Result<Uuid, CodecError> {
        let bytes = self.read_exact(16)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(out))
    }

    fn read_bytes32(&mut self) -> Result<[u8; 32], CodecError> {
        let bytes = self.read_exact(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_timestamp(&mut self) -> Result<DateTime<Utc>, CodecError> {
        let raw = self.read_var_string("timestamp")?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|_| CodecError::InvalidTimestamp(raw))
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::with_capacity(64) }
    }

    fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_var_octets(&mut self, bytes: &[u8]) {
        let len = bytes.len();
        if len < 0x80 {
            self.buf.push(len as u8);
        } else {
            let len_bytes = len.to_be_bytes();
            let skip = len_bytes.iter().take_while(|byte| **byte == 0).count();
            let significant = &len_bytes[skip..];
            self.buf.push(0x80 | significant.len() as u8);
            self.buf.extend_from_slice(significant);
        }
        self.buf.extend_from_slice(bytes);
    }

    fn write_var_string(&mut self, value: &str) {
        self.write_var_octets(value.as_bytes());
    }

    fn write_var_uint(&mut self, value: u64) {
        if value == 0 {
            self.write_var_octets(&[0]);
            return;
        }
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|byte| **byte == 0).count();
        self.write_var_octets(&bytes[skip..]);
    }

    fn write_timestamp(&mut self, value: &DateTime<Utc>) {
        self.write_var_string(&value.to_rfc3339_opts(SecondsFormat::Millis, true));
    }
}

fn write_protocol_data(writer: &mut Writer, parts: &[ProtocolData]) {
    writer.write_var_uint(parts.len() as u64);
    for part in parts {
        writer.write_var_string(&part.name);
        writer.write_u8(part.content_type as u8);
        writer.write_var_octets(&part.data);
    }
}

fn read_protocol_data(reader: &mut Reader<'_>) -> Result<Vec<ProtocolData>, CodecError> {
    let count = reader.read_var_uint()?;
    if count > reader.remaining() as u64 {
        // each entry takes at least three bytes, so this cannot be honest
        return Err(CodecError::Overflow("protocol data count"));
    }
    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = reader.read_var_string("protocol name")?;
        let raw_type = reader.read_u8()?;
        let content_type =
            ContentType::from_u8(raw_type).ok_or(CodecError::UnknownContentType(raw_type))?;
        let data = reader.read_var_octets()?.to_vec();
        parts.push(ProtocolData {
            name,
            content_type,
            data,
        });
    }
    Ok(parts)
}

pub fn serialize(packet: &BtpPacket) -> Bytes {
    let mut writer = Writer::new();
    writer.write_u8(packet.data.packet_type() as u8);
    writer.write_u32(packet.request_id);
    match &packet.data {
        BtpData::Response(parts) | BtpData::Message(parts) => {
            write_protocol_data(&mut writer, parts);
        }
        BtpData::Error(error) => {
            let mut code = [b' '; 3];
            for (slot, byte) in code.iter_mut().zip(error.code.bytes()) {
                *slot = byte;
            }
            writer.write_raw(&code);
            writer.write_var_string(&error.name);
            writer.write_timestamp(&error.triggered_at);
            writer.write_var_octets(&error.data);
            write_protocol_data(&mut writer, &error.protocol_data);
        }
        BtpData::Prepare(prepare) => {
            writer.write_raw(prepare.transfer_id.as_bytes());
            writer.write_u64(prepare.amount);
            writer.write_raw(&prepare.execution_condition);
            writer.write_timestamp(&prepare.expires_at);
            write_protocol_data(&mut writer, &prepare.protocol_data);
        }
        BtpData::Fulfill(fulfill) => {
            writer.write_raw(fulfill.transfer_id.as_bytes());
            writer.write_raw(&fulfill.fulfillment);
            write_protocol_data(&mut writer, &fulfill.protocol_data);
        }
        BtpData::Reject(reject) => {
            writer.write_raw(reject.transfer_id.as_bytes());
            write_protocol_data(&mut writer, &reject.protocol_data);
        }
    }
    Bytes::from(writer.buf)
}

pub fn deserialize(bytes: &[u8]) -> Result<BtpPacket, CodecError> {
    let mut reader = Reader::new(bytes);
    let raw_type = reader.read_u8()?;
    let packet_type =
        PacketType::from_u8(raw_type).ok_or(CodecError::UnknownPacketType(raw_type))?;
    let request_id = reader.read_u32()?;
    let data = match packet_type {
        PacketType::Response => BtpData::Response(read_protocol_data(&mut reader)?),
        PacketType::Message => BtpData::Message(read_protocol_data(&mut reader)?),
        PacketType::Error => {
            let code_bytes = reader.read_exact(3)?;
            let code = std::str::from_utf8(code_bytes)
                .map_err(|_| CodecError::InvalidUtf8("error code"))?
                .to_string();
            let name = reader.read_var_string("error name")?;
            let triggered_at = reader.read_timestamp()?;
            let data = reader.read_var_octets()?.to_vec();
            let protocol_data = read_protocol_data(&mut reader)?;
            BtpData::Error(BtpError {
                code,
                name,
                triggered_at,
                data,
                protocol_data,
            })
        }
        PacketType::Prepare => {
            let transfer_id = reader.read_uuid()?;
            let amount = reader.read_u64()?;
            let execution_condition = reader.read_bytes32()?;
            let expires_at = reader.read_timestamp()?;
            let protocol_data = read_protocol_data(&mut reader)?;
            BtpData::Prepare(BtpPrepare {
                transfer_id,
                amount,
                execution_condition,
                expires_at,
                protocol_data,
            })
        }
        PacketType::Fulfill => {
            let transfer_id = reader.read_uuid()?;
            let fulfillment = reader.read_bytes32()?;
            let protocol_data = read_protocol_data(&mut reader)?;
            BtpData::Fulfill(BtpFulfill {
                transfer_id,
                fulfillment,
                protocol_data,
            })
        }
        PacketType::Reject => {
            let transfer_id = reader.read_uuid()?;
            let protocol_data = read_protocol_data(&mut reader)?;
            BtpData::Reject(BtpReject {
                transfer_id,
                protocol_data,
            })
        }
    };
    if reader.remaining() != 0 {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }
    Ok(BtpPacket { request_id, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 15, 12, 30, 45).unwrap()
    }

    fn roundtrip(packet: BtpPacket) {
        let bytes = serialize(&packet);
        let decoded = deserialize(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn roundtrips_a_message() {
        roundtrip(BtpPacket {
            request_id: 12345,
            data: BtpData::Message(vec![
                ProtocolData::octet("auth", vec![]),
                ProtocolData::text("auth_username", "alice"),
                ProtocolData::text("auth_token", "hunter2"),
            ]),
        });
    }

    #[test]
    fn roundtrips_an_empty_response() {
        roundtrip(BtpPacket {
            request_id: 1,
            data: BtpData::Response(vec![]),
        });
    }

    #[test]
    fn roundtrips_a_prepare() {
        roundtrip(BtpPacket {
            request_id: u32::MAX,
            data: BtpData::Prepare(BtpPrepare {
                transfer_id: Uuid::new_v4(),
                amount: 1_000_000_007,
                execution_condition: [7u8; 32],
                expires_at: fixed_time(),
                protocol_data: vec![ProtocolData::octet("ilp", vec![1, 2, 3])],
            }),
        });
    }

    #[test]
    fn roundtrips_fulfill_reject_and_error() {
        roundtrip(BtpPacket {
            request_id: 2,
            data: BtpData::Fulfill(BtpFulfill {
                transfer_id: Uuid::new_v4(),
                fulfillment: [9u8; 32],
                protocol_data: vec![],
            }),
        });
        roundtrip(BtpPacket {
            request_id: 3,
            data: BtpData::Reject(BtpReject {
                transfer_id: Uuid::new_v4(),
                protocol_data: vec![ProtocolData::octet("ilp", vec![0xde, 0xad])],
            }),
        });
        roundtrip(BtpPacket {
            request_id: 4,
            data: BtpData::Error(BtpError {
                code: "F00".to_string(),
                name: "NotAcceptedError".to_string(),
                triggered_at: fixed_time(),
                data: b"{\"message\":\"no\"}".to_vec(),
                protocol_data: vec![],
            }),
        });
    }

    #[test]
    fn long_form_length_prefix_roundtrips() {
        // a part larger than 127 bytes forces the 0x80|n length form
        roundtrip(BtpPacket {
            request_id: 5,
            data: BtpData::Message(vec![ProtocolData::octet("blob", vec![0xab; 300])]),
        });
    }

    #[test]
    fn message_wire_layout_is_stable() {
        let bytes = serialize(&BtpPacket {
            request_id: 0x0102_0304,
            data: BtpData::Message(vec![ProtocolData::text("memo", "hi")]),
        });
        let expected = [
            6, // MESSAGE
            1, 2, 3, 4, // request id
            1, 1, // one protocol data entry
            4, b'm', b'e', b'm', b'o', // name
            1, // text/plain-utf8
            2, b'h', b'i', // payload
        ];
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn rejects_unknown_packet_type() {
        let err = deserialize(&[9, 0, 0, 0, 1, 0]).unwrap_err();
        assert_eq!(err, CodecError::UnknownPacketType(9));
    }

    #[test]
    fn rejects_truncated_packets() {
        let packet = BtpPacket {
            request_id: 6,
            data: BtpData::Message(vec![ProtocolData::text("info", "{}")]),
        };
        let bytes = serialize(&packet);
        for cut in 1..bytes.len() {
            assert!(deserialize(&bytes[..cut]).is_err(), "cut at {} passed", cut);
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut bytes = serialize(&BtpPacket {
            request_id: 7,
            data: BtpData::Response(vec![]),
        })
        .to_vec();
        bytes.push(0);
        assert_eq!(deserialize(&bytes).unwrap_err(), CodecError::TrailingBytes(1));
    }

    #[test]
    fn rejects_dishonest_protocol_data_count() {
        // MESSAGE header claiming 2^32 parts with no bodies behind it
        let bytes = [6u8, 0, 0, 0, 1, 4, 0xff, 0xff, 0xff, 0xff];
        assert!(deserialize(&bytes).is_err());
    }
}
