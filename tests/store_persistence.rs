//! Durability behavior with a configured store: counters survive a restart,
//! and duplicate detection reads through to records a previous process wrote.

mod test_helpers;

use std::sync::Arc;

use interledger_btp_plugin::backends::memory::MemoryStore;
use interledger_btp_plugin::{memory_pair, BtpPlugin, PluginError, Store};

use test_helpers::{client_opts, outgoing_transfer, server_opts, FULFILLMENT};

async fn pair_with_server_store(store: Arc<MemoryStore>) -> (BtpPlugin, BtpPlugin) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_socket, server_socket) = memory_pair();

    let mut server_options = server_opts();
    server_options.store = Some(store as Arc<dyn Store>);
    let server = BtpPlugin::new(server_options).unwrap();
    server.connect().await.unwrap();
    server.handle_incoming_socket(server_socket);

    let client = BtpPlugin::new(client_opts(client_socket)).unwrap();
    client.connect().await.unwrap();
    (client, server)
}

#[tokio::test]
async fn fulfilled_balances_survive_a_server_restart() {
    let store = Arc::new(MemoryStore::new());
    let (client, server) = pair_with_server_store(store.clone()).await;

    let transfer = outgoing_transfer(&client, "5");
    let id = transfer.id;
    client.send_transfer(transfer.clone()).await.unwrap();
    server.fulfill_condition(&id, FULFILLMENT).await.unwrap();
    assert_eq!(server.get_balance(), "5");

    client.disconnect().await.unwrap();
    server.disconnect().await.unwrap();

    // a new process over the same store sees the settled balance
    let (client2, server2) = pair_with_server_store(store.clone()).await;
    assert_eq!(server2.get_balance(), "5");

    // a colliding id with a different body is caught by reading the old
    // process's record back out of the store
    let mut collision = outgoing_transfer(&client2, "6");
    collision.id = id;
    let err = client2.send_transfer(collision).await.unwrap_err();
    match err {
        PluginError::Peer(ilp) => {
            assert_eq!(ilp.code, "F04");
            assert_eq!(ilp.name, "DuplicateIdError");
        }
        other => panic!("expected the duplicate to be refused, got {}", other),
    }

    // retransmitting the identical transfer is idempotent even though it was
    // fulfilled in the previous life
    client2.send_transfer(transfer).await.unwrap();
    assert_eq!(server2.get_balance(), "5");
}

#[tokio::test]
async fn the_configured_bounds_are_persisted() {
    let store = Arc::new(MemoryStore::new());
    {
        let (_client, server) = pair_with_server_store(store.clone()).await;
        server.disconnect().await.unwrap();
    }
    // the first run wrote maxBalance; a run configured without one inherits it
    let (client_socket, server_socket) = memory_pair();
    let mut opts = server_opts();
    opts.max_balance = None;
    opts.store = Some(store as Arc<dyn Store>);
    let server = BtpPlugin::new(opts).unwrap();
    server.connect().await.unwrap();
    server.handle_incoming_socket(server_socket);
    let client = BtpPlugin::new(client_opts(client_socket)).unwrap();
    client.connect().await.unwrap();

    let limit = client.get_limit().await.unwrap();
    assert_eq!(limit, serde_json::json!("10"));
}
