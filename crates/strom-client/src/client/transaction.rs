//! Handle to a server-side transaction.
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::client::Client;
use crate::error::OperationError;
use crate::types::{EventData, WriteResult};

/// A multi-request write that becomes visible atomically on commit.
/// Dropping the handle without committing leaves the server transaction to
/// expire on its own.
pub struct Transaction {
    transaction_id: u64,
    client: Client,
    committed: AtomicBool,
    rolled_back: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(transaction_id: u64, client: Client) -> Self {
        Self {
            transaction_id,
            client,
            committed: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
        }
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    pub async fn write(&self, events: Vec<EventData>) -> Result<(), OperationError> {
        self.ensure_open()?;
        self.client
            .transaction_write(self.transaction_id, events)
            .await
    }

    pub async fn commit(&self) -> Result<WriteResult, OperationError> {
        self.ensure_open()?;
        let result = self.client.transaction_commit(self.transaction_id).await?;
        self.committed.store(true, Ordering::Release);
        Ok(result)
    }

    /// Client-side only: marks the handle unusable. The server discards the
    /// uncommitted transaction when it times out.
    pub fn rollback(&self) {
        self.rolled_back.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), OperationError> {
        if self.committed.load(Ordering::Acquire) {
            return Err(OperationError::InvalidArgument(
                "transaction is already committed".to_string(),
            ));
        }
        if self.rolled_back.load(Ordering::Acquire) {
            return Err(OperationError::InvalidArgument(
                "transaction is rolled back".to_string(),
            ));
        }
        Ok(())
    }
}
