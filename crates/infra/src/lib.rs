//! Infrastructure layer: storage, settlement, audit, configuration and payment rails.
//!
//! The [`service::LedgerService`] wires these into the ledger pipeline
//! (`validate → settle → audit → notify`).

pub mod audit_trail;
pub mod config;
pub mod loans;
pub mod payments;
pub mod service;
pub mod settlement;
pub mod store;

pub use audit_trail::{AuditSink, AuditTrail, AuditWriteError, InMemoryAuditSink};
pub use config::{ConfigError, LedgerConfig};
pub use loans::LoanDesk;
pub use service::{LedgerEnvelope, LedgerError, LedgerService};
pub use settlement::{Settlement, SettlementEngine, SettlementError, Transition};
