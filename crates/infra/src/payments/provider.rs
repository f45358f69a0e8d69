use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use sacco_core::UserId;
use sacco_ledger::{PaymentMethod, Transaction, TransactionId, TransactionKind};

use crate::service::LedgerError;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("malformed callback: {0}")]
    MalformedCallback(String),

    #[error("no transaction matches callback ids {0:?}")]
    UnknownCorrelation(Vec<String>),

    /// The rail refused or could not be reached; the transaction is left `failed`.
    #[error("payment rail error: {0}")]
    Rail(String),

    #[error("invalid phone number: {0}")]
    InvalidPhoneNumber(String),

    #[error("{0} transactions cannot go through an external provider")]
    NotExternal(&'static str),

    #[error("no provider registered for payment method {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Who pays (or is paid) on the provider side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payer {
    pub user: Option<UserId>,
    pub phone_number: String,
}

/// An external payment rail.
///
/// Implementations only start requests and translate callbacks; balances move through
/// the ledger service's settlement step, never here.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Record a pending transaction for `destination` and ask the rail to move the money.
    async fn initiate_payment(
        &self,
        destination: TransactionKind,
        amount: u64,
        description: &str,
        payer: &Payer,
        now: DateTime<Utc>,
    ) -> Result<Transaction, ProviderError>;

    /// Resolve the transaction a callback refers to, then settle it.
    async fn handle_callback(
        &self,
        payload: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Transaction, ProviderError>;

    /// Start a refund of (part of) a settled transaction as a new refund transaction.
    async fn initiate_refund(
        &self,
        original: &TransactionId,
        amount: u64,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction, ProviderError>;
}
