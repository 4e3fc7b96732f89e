//! Packet model for the Bilateral Transfer Protocol: one binary envelope per
//! WebSocket frame, a typed payload per packet type, and a list of named
//! sub-protocol parts.

pub mod codec;
pub mod protocol_data;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Sub-protocol names with built-in meaning.
pub const PROTOCOL_AUTH: &str = "auth";
pub const PROTOCOL_AUTH_USERNAME: &str = "auth_username";
pub const PROTOCOL_AUTH_TOKEN: &str = "auth_token";
pub const PROTOCOL_ILP: &str = "ilp";
pub const PROTOCOL_VOUCH: &str = "vouch";
pub const PROTOCOL_INFO: &str = "info";
pub const PROTOCOL_BALANCE: &str = "balance";
pub const PROTOCOL_LIMIT: &str = "limit";
pub const PROTOCOL_CLAIM: &str = "claim";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Response = 1,
    Error = 2,
    Prepare = 3,
    Fulfill = 4,
    Reject = 5,
    Message = 6,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<PacketType> {
        match value {
            1 => Some(PacketType::Response),
            2 => Some(PacketType::Error),
            3 => Some(PacketType::Prepare),
            4 => Some(PacketType::Fulfill),
            5 => Some(PacketType::Reject),
            6 => Some(PacketType::Message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    OctetStream = 0,
    TextPlainUtf8 = 1,
    ApplicationJson = 2,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<ContentType> {
        match value {
            0 => Some(ContentType::OctetStream),
            1 => Some(ContentType::TextPlainUtf8),
            2 => Some(ContentType::ApplicationJson),
            _ => None,
        }
    }
}

/// One named sub-protocol part of a BTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolData {
    pub name: String,
    pub content_type: ContentType,
    pub data: Vec<u8>,
}

impl ProtocolData {
    pub fn octet(name: &str, data: Vec<u8>) -> Self {
        ProtocolData {
            name: name.to_string(),
            content_type: ContentType::OctetStream,
            data,
        }
    }

    pub fn text(name: &str, data: &str) -> Self {
        ProtocolData {
            name: name.to_string(),
            content_type: ContentType::TextPlainUtf8,
            data: data.as_bytes().to_vec(),
        }
    }

    pub fn json(name: &str, value: &serde_json::Value) -> Self {
        ProtocolData {
            name: name.to_string(),
            content_type: ContentType::ApplicationJson,
            data: serde_json::to_vec(value).expect("JSON value serialization cannot fail"),
        }
    }
}

/// A full BTP packet: the request id correlating requests with responses plus
/// the typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BtpPacket {
    pub request_id: u32,
    pub data: BtpData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BtpData {
    Response(Vec<ProtocolData>),
    Error(BtpError),
    Prepare(BtpPrepare),
    Fulfill(BtpFulfill),
    Reject(BtpReject),
    Message(Vec<ProtocolData>),
}

impl BtpData {
    pub fn packet_type(&self) -> PacketType {
        match self {
            BtpData::Response(_) => PacketType::Response,
            BtpData::Error(_) => PacketType::Error,
            BtpData::Prepare(_) => PacketType::Prepare,
            BtpData::Fulfill(_) => PacketType::Fulfill,
            BtpData::Reject(_) => PacketType::Reject,
            BtpData::Message(_) => PacketType::Message,
        }
    }

    pub fn protocol_data(&self) -> &[ProtocolData] {
        match self {
            BtpData::Response(parts) | BtpData::Message(parts) => parts,
            BtpData::Error(err) => &err.protocol_data,
            BtpData::Prepare(prepare) => &prepare.protocol_data,
            BtpData::Fulfill(fulfill) => &fulfill.protocol_data,
            BtpData::Reject(reject) => &reject.protocol_data,
        }
    }
}

/// PREPARE payload. The amount travels as an unsigned 64-bit integer; the
/// expiry as an RFC 3339 UTC timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct BtpPrepare {
    pub transfer_id: Uuid,
    pub amount: u64,
    pub execution_condition: [u8; 32],
    pub expires_at: DateTime<Utc>,
    pub protocol_data: Vec<ProtocolData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BtpFulfill {
    pub transfer_id: Uuid,
    pub fulfillment: [u8; 32],
    pub protocol_data: Vec<ProtocolData>,
}

/// REJECT payload. The rejection reason travels as the `ilp` sub-protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct BtpReject {
    pub transfer_id: Uuid,
    pub protocol_data: Vec<ProtocolData>,
}

/// ERROR payload. `code` is three ASCII characters (e.g. `F00`).
#[derive(Debug, Clone, PartialEq)]
pub struct BtpError {
    pub code: String,
    pub name: String,
    pub triggered_at: DateTime<Utc>,
    pub data: Vec<u8>,
    pub protocol_data: Vec<ProtocolData>,
}
