use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use sacco_core::UserId;
use sacco_ledger::Transaction;

use super::r#trait::{EntityKey, LedgerStore, LockedRows, Row, RowKind, StoreError};

/// In-memory ledger store.
///
/// Intended for tests/dev. Every row sits behind its own async mutex; a locked scope
/// acquires the mutexes of its rows in ascending key order and holds them until its
/// copies are written back or discarded.
///
/// Account owners are indexed like the unique owner index of the Postgres schema: a
/// second account row for the same user is a [`StoreError::Duplicate`].
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    rows: RwLock<BTreeMap<EntityKey, Arc<Mutex<Row>>>>,
    account_owners: RwLock<BTreeSet<UserId>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self, keys: &[EntityKey]) -> Result<Vec<(EntityKey, Arc<Mutex<Row>>)>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        keys.iter()
            .map(|key| {
                rows.get(key)
                    .cloned()
                    .map(|handle| (key.clone(), handle))
                    .ok_or_else(|| StoreError::NotFound(key.to_string()))
            })
            .collect()
    }

    /// Record the owner of a new account row. Called with the row index write guard held.
    fn claim_owner(&self, row: &Row) -> Result<(), StoreError> {
        let Row::Account(account) = row else {
            return Ok(());
        };
        let mut owners = self.account_owners.write().map_err(|_| poisoned())?;
        if !owners.insert(account.owner()) {
            return Err(StoreError::Duplicate(format!(
                "account owner:{}",
                account.owner()
            )));
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<Arc<Mutex<Row>>>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.values().cloned().collect())
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("row index lock poisoned".to_string())
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert(&self, row: Row) -> Result<(), StoreError> {
        let key = row.key();
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        if rows.contains_key(&key) {
            return Err(StoreError::Duplicate(key.to_string()));
        }
        self.claim_owner(&row)?;
        rows.insert(key, Arc::new(Mutex::new(row)));
        Ok(())
    }

    async fn upsert(&self, row: Row) -> Result<(), StoreError> {
        let key = row.key();
        let existing = {
            let mut rows = self.rows.write().map_err(|_| poisoned())?;
            match rows.get(&key) {
                Some(handle) => handle.clone(),
                None => {
                    self.claim_owner(&row)?;
                    rows.insert(key, Arc::new(Mutex::new(row)));
                    return Ok(());
                }
            }
        };
        *existing.lock().await = row;
        Ok(())
    }

    async fn get(&self, key: &EntityKey) -> Result<Option<Row>, StoreError> {
        let handle = {
            let rows = self.rows.read().map_err(|_| poisoned())?;
            rows.get(key).cloned()
        };
        match handle {
            Some(handle) => Ok(Some(handle.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: RowKind) -> Result<Vec<Row>, StoreError> {
        let mut out = Vec::new();
        for handle in self.snapshot()? {
            let row = handle.lock().await;
            if row.kind() == kind {
                out.push(row.clone());
            }
        }
        Ok(out)
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        for handle in self.snapshot()? {
            if let Row::Transaction(tx) = &*handle.lock().await {
                if tx.provider().correlates(correlation_id) {
                    return Ok(Some(tx.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn with_locked<R, E, F>(&self, keys: &[EntityKey], work: F) -> Result<R, E>
    where
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut LockedRows) -> Result<R, E> + Send + 'static,
    {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let handles = self.handles(&keys)?;
        let mut guards = Vec::with_capacity(handles.len());
        for (_, handle) in &handles {
            guards.push(handle.clone().lock_owned().await);
        }

        let mut copies = LockedRows::from_rows(guards.iter().map(|guard| (**guard).clone()));
        let out = work(&mut copies)?;

        // Commit: every copy replaces its row while all guards are still held.
        let mut committed: BTreeMap<EntityKey, Row> =
            copies.into_rows().map(|row| (row.key(), row)).collect();
        for ((key, _), guard) in handles.iter().zip(guards.iter_mut()) {
            if let Some(row) = committed.remove(key) {
                **guard = row;
            }
        }
        Ok(out)
    }
}
