use std::sync::Arc;
use std::time::Duration;

use super::listener::{Connection, NetworkListener};
use crate::error::Result;

/// The raft transport's view of the network: a thin handle over the
/// listener the server was started with. It adds no buffering or protocol
/// of its own and does not own the listener.
#[derive(Clone)]
pub struct TransportAdapter {
    listener: Arc<dyn NetworkListener>,
}

impl TransportAdapter {
    pub fn new(listener: Arc<dyn NetworkListener>) -> Self {
        TransportAdapter { listener }
    }

    pub async fn dial(&self, address: &str, timeout: Duration) -> Result<Connection> {
        self.listener.dial(address, timeout).await
    }

    pub async fn accept(&self) -> Result<Connection> {
        self.listener.accept().await
    }

    pub fn close(&self) -> Result<()> {
        self.listener.close()
    }

    pub fn local_address(&self) -> String {
        self.listener.local_address()
    }
}
