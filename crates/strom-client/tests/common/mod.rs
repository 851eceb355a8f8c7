// Shared helpers for integration tests against the harness node.
#![allow(dead_code)]
use std::time::Duration;

use strom_client::{Client, Settings, SettingsBuilder};
use strom_test_harness::HarnessNode;
use tokio::sync::mpsc;

pub async fn node_and_client() -> (HarnessNode, Client) {
    let node = HarnessNode::start().await.expect("start node");
    let client = connect_client(base_settings(&node));
    (node, client)
}

pub fn base_settings(node: &HarnessNode) -> SettingsBuilder {
    Settings::builder()
        .single_node(node.addr())
        .reconnection_delay(Duration::from_millis(50))
}

pub fn connect_client(builder: SettingsBuilder) -> Client {
    let client = Client::new(builder.build().expect("settings"));
    client.connect().expect("connect");
    client
}

pub async fn recv_one<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for channel")
        .expect("channel closed")
}

pub async fn recv_many<T>(rx: &mut mpsc::UnboundedReceiver<T>, count: usize) -> Vec<T> {
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(recv_one(rx).await);
    }
    items
}

/// Asserts that nothing arrives for a little while.
pub async fn expect_silence<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(outcome.is_err(), "unexpected item: {:?}", outcome);
}
