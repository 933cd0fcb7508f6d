//! Process-wide registry of in-flight verification requests.
//!
//! The store is the single owner of all request and transaction state.
//! Each record sits behind its own lock so mutations to one ceremony are
//! serialized while unrelated ceremonies proceed in parallel.

use crate::error::CancelCode;
use crate::request::{VerificationRequest, VerificationRequestSnapshot};
use crate::transaction::VerificationTransactionSnapshot;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

type RecordKey = (String, String);
type Record = Arc<RwLock<VerificationRequest>>;

/// Registry of live requests keyed by (other user id, flow id)
pub struct VerificationStore {
    retention: Duration,
    records: RwLock<HashMap<RecordKey, Record>>,
}

impl VerificationStore {
    pub fn new(retention: Duration) -> Self {
        Self { retention, records: RwLock::new(HashMap::new()) }
    }

    /// Register a new request. Returns `None` when the flow id is already
    /// taken for this user; flow ids are never reused, even after a
    /// terminal state.
    pub async fn insert(&self, request: VerificationRequest) -> Option<Record> {
        self.prune().await;
        let key = (request.other_user_id().to_string(), request.flow_id().to_string());
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return None;
        }
        let record = Arc::new(RwLock::new(request));
        records.insert(key, record.clone());
        Some(record)
    }

    pub async fn get(&self, user_id: &str, flow_id: &str) -> Option<Record> {
        self.prune().await;
        let key = (user_id.to_string(), flow_id.to_string());
        self.records.read().await.get(&key).cloned()
    }

    /// Look a record up by flow id alone; flow ids are unique per ceremony
    pub async fn find_by_flow(&self, flow_id: &str) -> Option<Record> {
        self.prune().await;
        let records = self.records.read().await;
        records
            .iter()
            .find(|((_, key_flow), _)| key_flow == flow_id)
            .map(|(_, record)| record.clone())
    }

    pub async fn get_request(
        &self,
        user_id: &str,
        flow_id: &str,
    ) -> Option<VerificationRequestSnapshot> {
        let record = self.get(user_id, flow_id).await?;
        let snapshot = record.read().await.snapshot();
        Some(snapshot)
    }

    pub async fn get_transaction(
        &self,
        user_id: &str,
        flow_id: &str,
    ) -> Option<VerificationTransactionSnapshot> {
        let record = self.get(user_id, flow_id).await?;
        let guard = record.read().await;
        guard.transaction().map(|transaction| transaction.snapshot())
    }

    /// Remove a record outright. Evicting a non-terminal request is a
    /// protocol error; it is cancelled first so no ceremony ends without a
    /// terminal state.
    pub async fn evict(&self, user_id: &str, flow_id: &str) {
        let key = (user_id.to_string(), flow_id.to_string());
        let record = self.records.write().await.remove(&key);
        if let Some(record) = record {
            let mut request = record.write().await;
            if !request.state().is_terminal() {
                warn!("Evicting non-terminal verification request {}", flow_id);
                request.cancel(CancelCode::User);
            }
        }
    }

    /// Drop terminal records older than the retention window
    pub async fn prune(&self) {
        let retention = match chrono::Duration::from_std(self.retention) {
            Ok(retention) => retention,
            Err(_) => return,
        };
        let cutoff = Utc::now() - retention;

        let mut stale = Vec::new();
        {
            let records = self.records.read().await;
            for (key, record) in records.iter() {
                let request = record.read().await;
                if request.state().is_terminal()
                    && request.completed_at().is_some_and(|at| at < cutoff)
                {
                    stale.push(key.clone());
                }
            }
        }
        if stale.is_empty() {
            return;
        }

        let mut records = self.records.write().await;
        for key in stale {
            debug!("Pruning terminal verification request {}", key.1);
            records.remove(&key);
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
