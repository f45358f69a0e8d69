//! Row store boundary for ledger state.
//!
//! Balance holders, transactions and requirement records are rows addressed by an
//! [`EntityKey`]. Rows that already exist change only inside a locked scope
//! (`LedgerStore::with_locked`), which is what makes settlement atomic.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::{PostgresAuditSink, PostgresLedgerStore};
pub use r#trait::{
    EntityKey, LedgerStore, LedgerStoreExt, LockedRows, Row, RowKind, StoreError, Stored,
};
