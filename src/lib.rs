//! # Interledger BTP Payment-Channel Plugin
//!
//! Crate implementing the core of a bilateral payment-channel plugin speaking
//! the Bilateral Transfer Protocol (BTP) between two Interledger peers over a
//! persistent socket. The crate is structured around three pieces: the RPC
//! engine ([`rpc`]) framing and correlating packets on authenticated sockets,
//! the transfer log ([`transfer_log`]) keeping the authoritative balance and
//! lifecycle state, and the plugin core ([`plugin`]) running the
//! conditional-transfer state machine between them.
//!
//! Settlement itself is not done here: a settlement layer plugs in by
//! implementing the [`PaymentChannelBackend`] trait and gets called on
//! incoming prepares, fulfills and claims. The transport, the listener and
//! the persistence backend are likewise collaborators behind the
//! [`socket::BtpSocket`], [`socket::SocketConnector`] and [`store::Store`]
//! traits.

pub mod backends;
pub mod btp;
pub mod config;
pub mod custom_rpc;
pub mod errors;
pub mod events;
pub mod plugin;
pub mod rpc;
pub mod socket;
pub mod store;
pub mod transfer_log;
pub mod utils;
pub mod validation;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use crate::btp::protocol_data::SideData;
pub use crate::config::{parse_btp_uri, AuthCheck, BtpUri, ListenerOpts, PluginOpts, Role};
pub use crate::custom_rpc::SideProtocolHandler;
pub use crate::errors::{IlpError, PluginError};
pub use crate::events::{EventKind, PluginEvent, SubscriptionHandle};
pub use crate::plugin::{BtpPlugin, RequestHandler};
pub use crate::socket::{memory_pair, BtpSocket, MemorySocket, SocketConnector};
pub use crate::store::{Store, StoreError};
pub use crate::transfer_log::{Transfer, TransferLog, TransferRecord, TransferState};

/// Read-only view of the transfer log's counters, handed to the payment
/// channel backend. The backend must never mutate the log directly; anything
/// it needs to change goes through its own hooks.
#[derive(Clone)]
pub struct BalanceView {
    log: Arc<TransferLog>,
}

impl BalanceView {
    pub(crate) fn new(log: Arc<TransferLog>) -> Self {
        BalanceView { log }
    }

    pub fn balance(&self) -> String {
        self.log.get_balance()
    }

    pub fn incoming_fulfilled(&self) -> String {
        self.log.get_incoming_fulfilled()
    }

    pub fn outgoing_fulfilled(&self) -> String {
        self.log.get_outgoing_fulfilled()
    }

    pub fn incoming_fulfilled_and_prepared(&self) -> String {
        self.log.get_incoming_fulfilled_and_prepared()
    }

    pub fn outgoing_fulfilled_and_prepared(&self) -> String {
        self.log.get_outgoing_fulfilled_and_prepared()
    }

    pub fn maximum(&self) -> Option<String> {
        self.log.get_maximum()
    }

    pub fn minimum(&self) -> Option<String> {
        self.log.get_minimum()
    }
}

/// Context passed to every backend hook.
pub struct BackendContext {
    pub prefix: String,
    pub balances: BalanceView,
}

/// Settlement-layer hook. Every payment channel backend MUST implement this
/// trait; the plugin drives it on connect/disconnect, when an incoming
/// transfer is prepared, when an outgoing transfer is fulfilled (to produce a
/// claim for the peer) and when the peer sends a claim back.
#[async_trait]
pub trait PaymentChannelBackend: Send + Sync + 'static {
    async fn connect(&self, _ctx: &BackendContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn disconnect(&self, _ctx: &BackendContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Veto point for incoming escrows; an error here cancels the transfer
    /// and travels back to the peer.
    async fn handle_incoming_prepare(
        &self,
        _ctx: &BackendContext,
        _transfer: &Transfer,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called after an outgoing transfer is fulfilled, with the new total of
    /// fulfilled outgoing value. The returned claim rides back to the peer as
    /// the `claim` sub-protocol.
    async fn create_outgoing_claim(
        &self,
        _ctx: &BackendContext,
        _outgoing_fulfilled: String,
    ) -> Result<Option<Value>, PluginError> {
        Ok(None)
    }

    /// Called with the `claim` part of the peer's FULFILL response.
    async fn handle_incoming_claim(
        &self,
        _ctx: &BackendContext,
        _claim: Value,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}
