//! Helpers shared by the integration suites: a connector that hands out a
//! pre-wired in-memory socket, an instrumented backend and event recording.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use ring::digest::{digest, SHA256};
use serde_json::{json, Value};
use uuid::Uuid;

use interledger_btp_plugin::{
    memory_pair, BackendContext, BtpPlugin, BtpSocket, ListenerOpts, PaymentChannelBackend,
    PluginError, PluginEvent, PluginOpts, SocketConnector, Transfer,
};

pub const FULFILLMENT: &str = "gHJ2QeIZpstXaGZVCSq4d3vkrMSChNYKriefys3KMtI";
pub const SECRET: &str = "s3cret";
pub const PREFIX: &str = "example.red.";

pub static CONDITION: Lazy<String> = Lazy::new(|| condition_for(FULFILLMENT));

pub fn condition_for(fulfillment: &str) -> String {
    let preimage = URL_SAFE_NO_PAD.decode(fulfillment).unwrap();
    URL_SAFE_NO_PAD.encode(digest(&SHA256, &preimage).as_ref())
}

/// Connector that yields one pre-established socket, once.
pub struct StaticConnector {
    socket: Mutex<Option<Arc<dyn BtpSocket>>>,
}

impl StaticConnector {
    pub fn new(socket: Arc<dyn BtpSocket>) -> Arc<Self> {
        Arc::new(StaticConnector {
            socket: Mutex::new(Some(socket)),
        })
    }
}

#[async_trait]
impl SocketConnector for StaticConnector {
    async fn connect(&self) -> Result<Arc<dyn BtpSocket>, PluginError> {
        self.socket
            .lock()
            .take()
            .ok_or_else(|| PluginError::Unreachable("the socket was already dialed".to_string()))
    }
}

#[derive(Default)]
pub struct TestBackend {
    pub refuse_incoming: bool,
    pub outgoing_claims: Mutex<Vec<String>>,
    pub incoming_claims: Mutex<Vec<Value>>,
}

impl TestBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(TestBackend::default())
    }
}

#[async_trait]
impl PaymentChannelBackend for TestBackend {
    async fn handle_incoming_prepare(
        &self,
        _ctx: &BackendContext,
        _transfer: &Transfer,
    ) -> Result<(), PluginError> {
        if self.refuse_incoming {
            return Err(PluginError::NotAccepted(
                "backend refused the escrow".to_string(),
            ));
        }
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

pub fn server_opts() -> PluginOpts {
    let mut opts = PluginOpts::new(PREFIX);
    opts.listener = Some(ListenerOpts {
        port: 1801,
        cert: None,
        key: None,
        ca: None,
    });
    opts.incoming_secret = Some(SECRET.to_string());
    opts.max_balance = Some("10".to_string());
    opts.info = Some(json!({ "currencyCode": "USD", "currencyScale": 2 }));
    opts
}

pub fn client_opts(socket: Arc<dyn BtpSocket>) -> PluginOpts {
    let mut opts = PluginOpts::new(PREFIX);
    opts.server = Some(format!("btp+ws://client:{}@localhost:1801", SECRET));
    opts.connector = Some(StaticConnector::new(socket) as Arc<dyn SocketConnector>);
    opts.max_balance = Some("10".to_string());
    opts
}

/// A connected client/server plugin pair over an in-memory socket pair.
pub async fn connected_pair(
    client_backend: Option<Arc<dyn PaymentChannelBackend>>,
    server_backend: Option<Arc<dyn PaymentChannelBackend>>,
) -> (BtpPlugin, BtpPlugin) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_socket, server_socket) = memory_pair();

    let mut server_options = server_opts();
    server_options.backend = server_backend;
    let server = BtpPlugin::new(server_options).unwrap();
    server.connect().await.unwrap();
    server.handle_incoming_socket(server_socket);

    let mut client_options = client_opts(client_socket);
    client_options.backend = client_backend;
    let client = BtpPlugin::new(client_options).unwrap();
    client.connect().await.unwrap();

    (client, server)
}

pub fn outgoing_transfer(plugin: &BtpPlugin, amount: &str) -> Transfer {
    Transfer {
        id: Uuid::new_v4(),
        amount: amount.to_string(),
        execution_condition: CONDITION.clone(),
        expires_at: Utc::now() + Duration::seconds(60),
        ilp: None,
        custom: None,
        from: plugin.account().to_string(),
        to: plugin.peer_account().to_string(),
        ledger: plugin.prefix().to_string(),
    }
}

/// Records every event the plugin emits, in order.
pub fn record_events(plugin: &BtpPlugin) -> Arc<Mutex<Vec<PluginEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    plugin.events().subscribe(move |event| {
        sink.lock().push(event.clone());
        Ok(())
    });
    log
}
