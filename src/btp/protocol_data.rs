//! Mapping between the flat list of sub-protocol parts on the wire and the
//! structured `{ilp, custom, map}` view handlers work with.
//!
//! The part named `ilp` surfaces base64url-encoded under `.ilp`; every other
//! part lands in `.custom` keyed by name, decoded per content type. `map`
//! keeps every part in wire order so primary-protocol dispatch (`auth`,
//! `info`, `balance`, `limit`) can look at the first entry.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::Value;

use super::{ContentType, ProtocolData, PROTOCOL_ILP, PROTOCOL_VOUCH};
use crate::errors::PluginError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideData {
    /// The `ilp` part, base64url-encoded without padding.
    pub ilp: Option<String>,
    /// Every non-`ilp` part decoded per content type: JSON parts parsed,
    /// text parts as strings, octet parts base64url-encoded.
    pub custom: serde_json::Map<String, Value>,
    /// All parts in wire order, untouched.
    pub map: Vec<ProtocolData>,
}

impl SideData {
    pub fn from_ilp(ilp: impl Into<String>) -> Self {
        SideData {
            ilp: Some(ilp.into()),
            ..SideData::default()
        }
    }

    pub fn from_custom(custom: serde_json::Map<String, Value>) -> Self {
        SideData {
            custom,
            ..SideData::default()
        }
    }

    /// Primary protocol of the message, i.e. the first part on the wire.
    pub fn primary(&self) -> Option<&ProtocolData> {
        self.map.first()
    }

    pub fn part(&self, name: &str) -> Option<&ProtocolData> {
        self.map.iter().find(|part| part.name == name)
    }
}

/// Builds the structured view from decoded wire parts. Fails on a JSON part
/// that does not parse or a text part that is not UTF-8.
pub fn to_side_data(parts: &[ProtocolData]) -> Result<SideData, PluginError> {
    let mut side = SideData {
        map: parts.to_vec(),
        ..SideData::default()
    };
    for part in parts {
        if part.name == PROTOCOL_ILP {
            side.ilp = Some(URL_SAFE_NO_PAD.encode(&part.data));
            continue;
        }
        let value = match part.content_type {
            ContentType::ApplicationJson => serde_json::from_slice(&part.data).map_err(|err| {
                PluginError::InvalidFields(format!(
                    "sub-protocol {:?} carries invalid JSON: {}",
                    part.name, err
                ))
            })?,
            ContentType::TextPlainUtf8 => {
                let text = std::str::from_utf8(&part.data).map_err(|_| {
                    PluginError::InvalidFields(format!(
                        "sub-protocol {:?} carries invalid UTF-8",
                        part.name
                    ))
                })?;
                Value::String(text.to_string())
            }
            ContentType::OctetStream => Value::String(URL_SAFE_NO_PAD.encode(&part.data)),
        };
        side.custom.insert(part.name.clone(), value);
    }
    Ok(side)
}

/// Rebuilds wire parts from the structured view. The `ilp` part (when
/// present) leads; `ilp` and `vouch` always go out as octet-stream, strings
/// as text, everything else as JSON.
pub fn to_protocol_data(side: &SideData) -> Result<Vec<ProtocolData>, PluginError> {
    let mut parts = Vec::with_capacity(side.custom.len() + 1);
    if let Some(ilp) = &side.ilp {
        let bytes = URL_SAFE_NO_PAD.decode(ilp).map_err(|_| {
            PluginError::InvalidFields("ilp payload is not valid base64url".to_string())
        })?;
        parts.push(ProtocolData::octet(PROTOCOL_ILP, bytes));
    }
    for (name, value) in &side.custom {
        if name == PROTOCOL_VOUCH {
            let encoded = value.as_str().ok_or_else(|| {
                PluginError::InvalidFields("vouch payload must be a base64url string".to_string())
            })?;
            let bytes = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| {
                PluginError::InvalidFields("vouch payload is not valid base64url".to_string())
            })?;
            parts.push(ProtocolData::octet(PROTOCOL_VOUCH, bytes));
        } else if let Value::String(text) = value {
            parts.push(ProtocolData::text(name, text));
        } else {
            parts.push(ProtocolData::json(name, value));
        }
    }
    Ok(parts)
}
