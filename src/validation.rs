//! Field-level checks shared by the plugin core and the transfer log.
//! Conditions and fulfillments travel base64url-encoded without padding and
//! must decode to exactly 32 bytes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use ring::digest::{digest, SHA256};
use std::str::FromStr;

use crate::errors::PluginError;
use crate::transfer_log::Transfer;

pub fn encode_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes a base64url field that must hold exactly 32 bytes. The error is a
/// bare reason so callers can wrap it with the right error code.
pub fn decode_bytes32(encoded: &str) -> Result<[u8; 32], String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| "not valid base64url".to_string())?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn decode_condition(encoded: &str) -> Result<[u8; 32], PluginError> {
    decode_bytes32(encoded)
        .map_err(|reason| PluginError::InvalidFields(format!("executionCondition: {}", reason)))
}

/// `SHA-256(fulfillment) == condition`, byte for byte.
pub fn fulfillment_matches(fulfillment: &[u8; 32], condition: &[u8; 32]) -> bool {
    digest(&SHA256, fulfillment).as_ref() == condition
}

/// Parses a non-negative decimal amount string.
pub fn parse_amount(amount: &str) -> Result<BigUint, PluginError> {
    if amount.is_empty() || !amount.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(PluginError::InvalidFields(format!(
            "amount {:?} is not a non-negative decimal string",
            amount
        )));
    }
    BigUint::from_str(amount)
        .map_err(|_| PluginError::InvalidFields(format!("amount {:?} does not parse", amount)))
}

/// The wire carries amounts as u64, so anything larger cannot be prepared.
pub fn amount_to_u64(amount: &str) -> Result<u64, PluginError> {
    parse_amount(amount)?.to_u64().ok_or_else(|| {
        PluginError::InvalidFields(format!("amount {:?} exceeds the 64-bit range", amount))
    })
}

/// Schema check run on every transfer before it reaches the log.
pub fn validate_transfer(transfer: &Transfer) -> Result<(), PluginError> {
    amount_to_u64(&transfer.amount)?;
    decode_condition(&transfer.execution_condition)?;
    if let Some(ilp) = &transfer.ilp {
        URL_SAFE_NO_PAD.decode(ilp).map_err(|_| {
            PluginError::InvalidFields("ilp packet is not valid base64url".to_string())
        })?;
    }
    Ok(())
}

/// Routing check: a locally submitted transfer must go from us to the peer;
/// an incoming one the other way around.
pub fn assert_addressed(transfer: &Transfer, from: &str, to: &str) -> Result<(), PluginError> {
    if transfer.from != from {
        return Err(PluginError::InvalidFields(format!(
            "transfer.from must be {:?}, got {:?}",
            from, transfer.from
        )));
    }
    if transfer.to != to {
        return Err(PluginError::InvalidFields(format!(
            "transfer.to must be {:?}, got {:?}",
            to, transfer.to
        )));
    }
    Ok(())
}
