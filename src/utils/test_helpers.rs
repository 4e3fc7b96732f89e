//! Shared fixtures for the unit tests: a known preimage/condition pair, a
//! transfer builder and an instrumented payment-channel backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use ring::digest::{digest, SHA256};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::PluginError;
use crate::transfer_log::Transfer;
use crate::validation::encode_base64url;
use crate::{BackendContext, PaymentChannelBackend};

pub const FULFILLMENT: &str = "gHJ2QeIZpstXaGZVCSq4d3vkrMSChNYKriefys3KMtI";

/// base64url SHA-256 of a base64url-encoded preimage.
pub fn condition_for(fulfillment: &str) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    let preimage = URL_SAFE_NO_PAD.decode(fulfillment).unwrap();
    encode_base64url(digest(&SHA256, &preimage).as_ref())
}

pub fn test_transfer(amount: &str, from: &str, to: &str, ledger: &str) -> Transfer {
    Transfer {
        id: Uuid::new_v4(),
        amount: amount.to_string(),
        execution_condition: condition_for(FULFILLMENT),
        expires_at: Utc::now() + Duration::seconds(60),
        ilp: None,
        custom: None,
        from: from.to_string(),
        to: to.to_string(),
        ledger: ledger.to_string(),
    }
}

/// Backend that records every hook call and can be told to refuse prepares.
#[derive(Default)]
pub struct TestBackend {
    pub refuse_incoming: bool,
    pub prepares: Mutex<Vec<Uuid>>,
    pub outgoing_claims: Mutex<Vec<String>>,
    pub incoming_claims: Mutex<Vec<Value>>,
}

impl TestBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(TestBackend::default())
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(TestBackend {
            refuse_incoming: true,
            ..TestBackend::default()
        })
    }
}

#[async_trait]
impl PaymentChannelBackend for TestBackend {
    async fn handle_incoming_prepare(
        &self,
        _ctx: &BackendContext,
        transfer: &Transfer,
    ) -> Result<(), PluginError> {
        if self.refuse_incoming {
            return Err(PluginError::NotAccepted(
                "backend refused the escrow".to_string(),
            ));
        }
        self.prepares.lock().push(transfer.id);
        Ok(())
    }

    async fn create_outgoing_claim(
        &self,
        _ctx: &BackendContext,
        outgoing_fulfilled: String,
    ) -> Result<Option<Value>, PluginError> {
        self.outgoing_claims.lock().push(outgoing_fulfilled.clone());
        Ok(Some(json!({ "amount": outgoing_fulfilled })))
    }

    async fn handle_incoming_claim(
        &self,
        _ctx: &BackendContext,
        claim: Value,
    ) -> Result<(), PluginError> {
        self.incoming_claims.lock().push(claim);
        Ok(())
    }
}
