//! Settlement engine: applies a completed transaction's postings exactly once.
//!
//! ```text
//! settle(id)
//!   ↓
//! 1. Fast path: processed or not completed → no-op
//!   ↓
//! 2. Lock transaction row + every referenced holder (ascending key order)
//!   ↓
//! 3. Re-check latch and status under the locks
//!   ↓
//! 4. Apply postings to the locked copies (re-validates balances)
//!   ↓
//! 5. Flip `is_processed`, commit everything together
//! ```
//!
//! A business rejection inside the lock (insufficient funds, suspended account, loan
//! rules) restores the holders and commits only the `failed` status. Anything else
//! rolls the whole scope back.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use sacco_core::DomainError;
use sacco_ledger::{
    LedgerEvent, PostingContext, Transaction, TransactionId, TransactionStatus, posting,
};

use crate::store::{EntityKey, LedgerStore, LedgerStoreExt, LockedRows, StoreError};

/// A transaction before and after one ledger step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub before: Transaction,
    pub after: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Postings applied and latch flipped in this call.
    Applied {
        transition: Transition,
        events: Vec<LedgerEvent>,
    },
    /// An earlier call already applied this transaction.
    AlreadyProcessed,
    /// Not completed (pending, processing or failed); nothing to apply.
    NotSettleable { status: TransactionStatus },
}

#[derive(Debug, Error)]
pub enum SettlementError {
    /// Balance re-check failed under the locks; the transaction is now `failed`.
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        available: u64,
        requested: u64,
        failed: Box<Transition>,
    },

    /// Any other business rule refused the postings; the transaction is now `failed`.
    #[error("settlement rejected: {reason}")]
    Validation {
        reason: DomainError,
        failed: Box<Transition>,
    },

    #[error("transaction {0} already processed")]
    AlreadyProcessed(TransactionId),

    #[error("missing reference: {0}")]
    MissingReference(String),

    #[error("internal settlement error: {0}")]
    Internal(String),
}

impl SettlementError {
    /// The committed `completed → failed` transition, for refusals.
    pub fn failed_transition(&self) -> Option<&Transition> {
        match self {
            Self::InsufficientFunds { failed, .. } | Self::Validation { failed, .. } => Some(failed),
            _ => None,
        }
    }
}

impl From<StoreError> for SettlementError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(key) => Self::MissingReference(key),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Why postings could not be applied.
#[derive(Debug)]
pub(crate) enum PostingFailure {
    Domain(DomainError),
    Store(StoreError),
}

impl From<DomainError> for PostingFailure {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

impl From<StoreError> for PostingFailure {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Apply every posting of `tx` to the rows it references.
///
/// Used both for settlement (on locked rows) and for validation (on unlocked copies).
pub(crate) fn post(
    rows: &mut LockedRows,
    tx: &Transaction,
    ctx: &PostingContext,
) -> Result<Vec<LedgerEvent>, PostingFailure> {
    let mut events = Vec::new();
    for p in tx.postings() {
        let holder = rows.holder_mut(p.entity)?;
        events.extend(posting::apply(holder, &p, ctx)?);
    }
    Ok(events)
}

enum Locked {
    Applied(Transition, Vec<LedgerEvent>),
    Refused(DomainError, Transition),
    AlreadyProcessed,
    NotSettleable(TransactionStatus),
}

fn settle_locked(
    rows: &mut LockedRows,
    id: &TransactionId,
    ctx: &PostingContext,
) -> Result<Locked, SettlementError> {
    let key = EntityKey::Transaction(id.clone());
    let before: Transaction = rows.get(&key)?;

    if before.is_processed() {
        return Ok(Locked::AlreadyProcessed);
    }
    if before.status() != TransactionStatus::Completed {
        return Ok(Locked::NotSettleable(before.status()));
    }

    let pristine = rows.clone();
    match post(rows, &before, ctx) {
        Ok(mut derived) => {
            let tx = rows.get_mut::<Transaction>(&key)?;
            tx.mark_processed(ctx.now)
                .map_err(|_| SettlementError::AlreadyProcessed(id.clone()))?;
            let after = tx.clone();

            let mut events = vec![LedgerEvent::TransactionSettled {
                transaction_id: id.clone(),
                transaction_type: after.transaction_type(),
                amount: after.amount(),
                at: ctx.now,
            }];
            events.append(&mut derived);
            Ok(Locked::Applied(Transition { before, after }, events))
        }
        Err(PostingFailure::Domain(DomainError::InvariantViolation(msg))) => {
            Err(SettlementError::Internal(msg))
        }
        Err(PostingFailure::Domain(reason)) => {
            *rows = pristine;
            let tx = rows.get_mut::<Transaction>(&key)?;
            tx.fail(ctx.now)
                .map_err(|e| SettlementError::Internal(e.to_string()))?;
            let after = tx.clone();
            Ok(Locked::Refused(reason, Transition { before, after }))
        }
        Err(PostingFailure::Store(err)) => Err(err.into()),
    }
}

/// Applies balance effects; owns no state besides the store handle.
#[derive(Debug, Clone)]
pub struct SettlementEngine<S> {
    store: S,
    minimum_shares_required: u64,
}

impl<S: LedgerStore> SettlementEngine<S> {
    pub fn new(store: S, minimum_shares_required: u64) -> Self {
        Self {
            store,
            minimum_shares_required,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn context(&self, now: DateTime<Utc>) -> PostingContext {
        PostingContext {
            now,
            minimum_shares_required: self.minimum_shares_required,
        }
    }

    /// Apply `id` if it is completed and unprocessed. Safe to call any number of times,
    /// concurrently: exactly one call applies the postings.
    #[instrument(skip(self), fields(transaction_id = %id))]
    pub async fn settle(
        &self,
        id: &TransactionId,
        now: DateTime<Utc>,
    ) -> Result<Settlement, SettlementError> {
        let tx: Transaction = self
            .store
            .load(&EntityKey::Transaction(id.clone()))
            .await?;

        if tx.is_processed() {
            debug!("already processed");
            return Ok(Settlement::AlreadyProcessed);
        }
        if tx.status() != TransactionStatus::Completed {
            debug!(status = tx.status().as_str(), "not settleable");
            return Ok(Settlement::NotSettleable {
                status: tx.status(),
            });
        }

        let mut keys = vec![EntityKey::Transaction(id.clone())];
        keys.extend(tx.kind().references().into_iter().map(EntityKey::from));

        let ctx = self.context(now);
        let scope_id = id.clone();
        let outcome = self
            .store
            .with_locked(&keys, move |rows| settle_locked(rows, &scope_id, &ctx))
            .await?;

        match outcome {
            Locked::Applied(transition, events) => {
                info!(
                    kind = transition.after.transaction_type().as_str(),
                    amount = transition.after.amount(),
                    "transaction settled"
                );
                Ok(Settlement::Applied { transition, events })
            }
            Locked::AlreadyProcessed => Ok(Settlement::AlreadyProcessed),
            Locked::NotSettleable(status) => Ok(Settlement::NotSettleable { status }),
            Locked::Refused(reason, transition) => {
                warn!(
                    kind = transition.after.transaction_type().as_str(),
                    amount = transition.after.amount(),
                    reason = %reason,
                    "settlement refused; transaction failed"
                );
                let failed = Box::new(transition);
                Err(match reason {
                    DomainError::InsufficientFunds {
                        available,
                        requested,
                    } => SettlementError::InsufficientFunds {
                        available,
                        requested,
                        failed,
                    },
                    reason => SettlementError::Validation { reason, failed },
                })
            }
        }
    }
}
