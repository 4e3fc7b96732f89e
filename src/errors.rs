use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::btp::codec::CodecError;

/// A structured ILP-style error as it travels inside BTP `ERROR` frames and
/// `REJECT` reasons. `data` is free-form; handlers put a JSON object with a
/// `message` field in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IlpError {
    pub code: String,
    pub name: String,
    pub triggered_at: DateTime<Utc>,
    pub data: String,
}

impl IlpError {
    pub fn new(code: &str, name: &str, data: impl Into<String>) -> Self {
        IlpError {
            code: code.to_string(),
            name: name.to_string(),
            triggered_at: Utc::now(),
            data: data.into(),
        }
    }

    /// The reason sent on expiry of a prepared transfer.
    pub fn timed_out() -> Self {
        IlpError::new("R00", "Transfer Timed Out", "expired")
    }

    pub fn triggered_at_rfc3339(&self) -> String {
        self.triggered_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl std::fmt::Display for IlpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.code, self.name, self.data)
    }
}

/// Every failure the plugin can surface. Variants that correspond to a BTP
/// error code carry it via [`PluginError::btp_code`]; everything else maps to
/// `F00 NotAcceptedError` when it has to cross the wire.
#[derive(Error, Debug)]
pub enum PluginError {
    /// No authenticated socket was available to carry the request
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The peer or a local check refused the operation
    #[error("not accepted: {0}")]
    NotAccepted(String),

    /// Malformed packet, protocol data or configuration value
    #[error("invalid fields: {0}")]
    InvalidFields(String),

    /// No transfer with this id in the log
    #[error("transfer not found: {0}")]
    TransferNotFound(Uuid),

    /// Fulfillment did not hash to the execution condition
    #[error("invalid fulfillment for transfer {0}: {1}")]
    InvalidFulfillment(Uuid, String),

    /// A different transfer already exists under this id
    #[error("duplicate id: {0}")]
    DuplicateId(Uuid),

    /// The transfer was already cancelled
    #[error("transfer {0} already rolled back")]
    AlreadyRolledBack(Uuid),

    /// The transfer was already fulfilled
    #[error("transfer {0} already fulfilled")]
    AlreadyFulfilled(Uuid),

    /// The prepare would push a directional balance past its bound
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// The outgoing request saw neither RESPONSE nor ERROR in time
    #[error("request {0} timed out after {1} ms")]
    RequestTimeout(u32, u64),

    /// The connection was torn down while the operation was in flight
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer answered with an ERROR frame
    #[error("peer error: {0}")]
    Peer(IlpError),

    /// The persistence backend failed
    #[error("store error: {0}")]
    Store(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl PluginError {
    /// BTP error code for this failure, per the fixed name-to-code table.
    pub fn btp_code(&self) -> &'static str {
        match self {
            PluginError::Unreachable(_) => "T00",
            PluginError::NotAccepted(_) => "F00",
            PluginError::InvalidFields(_) | PluginError::Codec(_) => "F01",
            PluginError::TransferNotFound(_) => "F02",
            PluginError::InvalidFulfillment(..) => "F03",
            PluginError::DuplicateId(_) => "F04",
            PluginError::AlreadyRolledBack(_) => "F05",
            PluginError::AlreadyFulfilled(_) => "F06",
            PluginError::InsufficientBalance(_) => "F07",
            PluginError::RequestTimeout(..) | PluginError::ConnectionClosed => "T00",
            PluginError::Peer(err) => match err.code.as_str() {
                "T00" => "T00",
                _ => "F00",
            },
            PluginError::Store(_) => "F00",
        }
    }

    pub fn btp_name(&self) -> &'static str {
        match self.btp_code() {
            "T00" => "UnreachableError",
            "F01" => "InvalidFieldsError",
            "F02" => "TransferNotFoundError",
            "F03" => "InvalidFulfillmentError",
            "F04" => "DuplicateIdError",
            "F05" => "AlreadyRolledBackError",
            "F06" => "AlreadyFulfilledError",
            "F07" => "InsufficientBalanceError",
            _ => "NotAcceptedError",
        }
    }

    /// Converts a handler failure into the error value serialized back to the
    /// peer for the same request id.
    pub fn to_ilp(&self) -> IlpError {
        match self {
            PluginError::Peer(err) => err.clone(),
            other => IlpError::new(
                other.btp_code(),
                other.btp_name(),
                json!({ "message": other.to_string() }).to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_table() {
        let id = Uuid::new_v4();
        assert_eq!(PluginError::Unreachable("x".into()).btp_code(), "T00");
        assert_eq!(PluginError::NotAccepted("x".into()).btp_code(), "F00");
        assert_eq!(PluginError::InvalidFields("x".into()).btp_code(), "F01");
        assert_eq!(PluginError::TransferNotFound(id).btp_code(), "F02");
        assert_eq!(
            PluginError::InvalidFulfillment(id, "bad hash".into()).btp_code(),
            "F03"
        );
        assert_eq!(PluginError::DuplicateId(id).btp_code(), "F04");
        assert_eq!(PluginError::AlreadyRolledBack(id).btp_code(), "F05");
        assert_eq!(PluginError::AlreadyFulfilled(id).btp_code(), "F06");
        assert_eq!(
            PluginError::InsufficientBalance("over max".into()).btp_code(),
            "F07"
        );
    }

    #[test]
    fn handler_failures_serialize_with_a_message() {
        let err = PluginError::NotAccepted("balance exceeds maximum".into());
        let ilp = err.to_ilp();
        assert_eq!(ilp.code, "F00");
        assert_eq!(ilp.name, "NotAcceptedError");
        let data: serde_json::Value = serde_json::from_str(&ilp.data).unwrap();
        assert_eq!(data["message"], "not accepted: balance exceeds maximum");
    }

    #[test]
    fn peer_errors_pass_through_unchanged() {
        let original = IlpError::new("F07", "InsufficientBalanceError", "nope");
        let wrapped = PluginError::Peer(original.clone());
        assert_eq!(wrapped.to_ilp(), original);
    }
}
