use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sacco_core::{AccountId, Entity, GoalId, InvestmentId, LoanId, RequirementId};
use sacco_ledger::{
    Account, EntityRef, Goal, HolderMut, Investment, InvestmentAccount, Loan, Transaction,
    TransactionId, UserLoanRequirement,
};

/// Stable key of a persisted row.
///
/// The derived ordering is the lock order: every multi-row scope acquires its rows in
/// ascending key order, so two scopes touching the same rows can never deadlock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    Account(AccountId),
    Goal(GoalId),
    Loan(LoanId),
    Investment(InvestmentId),
    InvestmentAccount(AccountId),
    Requirement(AccountId, RequirementId),
    Transaction(TransactionId),
}

impl EntityKey {
    pub fn kind(&self) -> RowKind {
        match self {
            Self::Account(_) => RowKind::Account,
            Self::Goal(_) => RowKind::Goal,
            Self::Loan(_) => RowKind::Loan,
            Self::Investment(_) => RowKind::Investment,
            Self::InvestmentAccount(_) => RowKind::InvestmentAccount,
            Self::Requirement(..) => RowKind::Requirement,
            Self::Transaction(_) => RowKind::Transaction,
        }
    }
}

impl From<EntityRef> for EntityKey {
    fn from(value: EntityRef) -> Self {
        match value {
            EntityRef::Account(id) => Self::Account(id),
            EntityRef::Goal(id) => Self::Goal(id),
            EntityRef::Loan(id) => Self::Loan(id),
            EntityRef::Investment(id) => Self::Investment(id),
        }
    }
}

/// Text form used as the durable primary key (`kind:id`).
impl core::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Account(id) => write!(f, "account:{id}"),
            Self::Goal(id) => write!(f, "goal:{id}"),
            Self::Loan(id) => write!(f, "loan:{id}"),
            Self::Investment(id) => write!(f, "investment:{id}"),
            Self::InvestmentAccount(id) => write!(f, "investment_account:{id}"),
            Self::Requirement(account, req) => write!(f, "requirement:{account}:{req}"),
            Self::Transaction(id) => write!(f, "transaction:{id}"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Account,
    Goal,
    Loan,
    Investment,
    InvestmentAccount,
    Requirement,
    Transaction,
}

impl RowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Goal => "goal",
            Self::Loan => "loan",
            Self::Investment => "investment",
            Self::InvestmentAccount => "investment_account",
            Self::Requirement => "requirement",
            Self::Transaction => "transaction",
        }
    }
}

/// Any persisted ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Row {
    Account(Account),
    Goal(Goal),
    Loan(Loan),
    Investment(Investment),
    InvestmentAccount(InvestmentAccount),
    Requirement(UserLoanRequirement),
    Transaction(Transaction),
}

impl Row {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Account(a) => EntityKey::Account(*a.id()),
            Self::Goal(g) => EntityKey::Goal(*g.id()),
            Self::Loan(l) => EntityKey::Loan(*l.id()),
            Self::Investment(i) => EntityKey::Investment(*i.id()),
            Self::InvestmentAccount(ia) => EntityKey::InvestmentAccount(*ia.id()),
            Self::Requirement(r) => EntityKey::Requirement(r.account, r.requirement),
            Self::Transaction(t) => EntityKey::Transaction(t.id().clone()),
        }
    }

    pub fn kind(&self) -> RowKind {
        self.key().kind()
    }
}

/// Typed access to one variant of [`Row`].
pub trait Stored: Sized + Send {
    fn into_row(self) -> Row;
    fn from_row(row: Row) -> Option<Self>;
    fn from_row_mut(row: &mut Row) -> Option<&mut Self>;
}

macro_rules! impl_stored {
    ($t:ty, $variant:ident) => {
        impl Stored for $t {
            fn into_row(self) -> Row {
                Row::$variant(self)
            }

            fn from_row(row: Row) -> Option<Self> {
                match row {
                    Row::$variant(value) => Some(value),
                    _ => None,
                }
            }

            fn from_row_mut(row: &mut Row) -> Option<&mut Self> {
                match row {
                    Row::$variant(value) => Some(value),
                    _ => None,
                }
            }
        }
    };
}

impl_stored!(Account, Account);
impl_stored!(Goal, Goal);
impl_stored!(Loan, Loan);
impl_stored!(Investment, Investment);
impl_stored!(InvestmentAccount, InvestmentAccount);
impl_stored!(UserLoanRequirement, Requirement);
impl_stored!(Transaction, Transaction);

/// Store operation error (infrastructure, not business rules).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("row already exists: {0}")]
    Duplicate(String),

    #[error("row {key} is not a {expected}")]
    KindMismatch { key: String, expected: &'static str },

    #[error("row serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Working copies of a set of locked rows.
///
/// Mutations land on the copies; the store writes them back only if the scope's work
/// returns `Ok`.
#[derive(Debug, Clone, Default)]
pub struct LockedRows {
    rows: BTreeMap<EntityKey, Row>,
}

impl LockedRows {
    pub fn from_rows(rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            rows: rows.into_iter().map(|row| (row.key(), row)).collect(),
        }
    }

    pub fn get<T: Stored>(&self, key: &EntityKey) -> Result<T, StoreError>
    where
        T: Clone,
    {
        let row = self
            .rows
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        T::from_row(row.clone()).ok_or_else(|| kind_mismatch::<T>(key))
    }

    pub fn get_mut<T: Stored>(&mut self, key: &EntityKey) -> Result<&mut T, StoreError> {
        let row = self
            .rows
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        T::from_row_mut(row).ok_or_else(|| kind_mismatch::<T>(key))
    }

    /// Mutable balance-holder view of a locked row.
    pub fn holder_mut(&mut self, entity: EntityRef) -> Result<HolderMut<'_>, StoreError> {
        let key = EntityKey::from(entity);
        let row = self
            .rows
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        match row {
            Row::Account(a) => Ok(HolderMut::Account(a)),
            Row::Goal(g) => Ok(HolderMut::Goal(g)),
            Row::Loan(l) => Ok(HolderMut::Loan(l)),
            Row::Investment(i) => Ok(HolderMut::Investment(i)),
            _ => Err(StoreError::KindMismatch {
                key: key.to_string(),
                expected: "balance holder",
            }),
        }
    }

    pub fn into_rows(self) -> impl Iterator<Item = Row> {
        self.rows.into_values()
    }
}

fn kind_mismatch<T>(key: &EntityKey) -> StoreError {
    StoreError::KindMismatch {
        key: key.to_string(),
        expected: core::any::type_name::<T>()
            .rsplit("::")
            .next()
            .unwrap_or("row"),
    }
}

/// Durable home of every ledger row.
///
/// `with_locked` is the only way to change rows that already exist. It gives `work`
/// exclusive access to the requested rows (acquired in ascending [`EntityKey`] order) as
/// working copies: `Ok` commits every copy atomically, `Err` discards them all.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new row; fails if the key is taken.
    async fn insert(&self, row: Row) -> Result<(), StoreError>;

    /// Insert or replace a row that is not a balance holder (e.g. requirement records).
    async fn upsert(&self, row: Row) -> Result<(), StoreError>;

    async fn get(&self, key: &EntityKey) -> Result<Option<Row>, StoreError>;

    async fn list(&self, kind: RowKind) -> Result<Vec<Row>, StoreError>;

    /// The transaction carrying a provider-issued correlation id, if any.
    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    async fn with_locked<R, E, F>(&self, keys: &[EntityKey], work: F) -> Result<R, E>
    where
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut LockedRows) -> Result<R, E> + Send + 'static;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore,
{
    async fn insert(&self, row: Row) -> Result<(), StoreError> {
        (**self).insert(row).await
    }

    async fn upsert(&self, row: Row) -> Result<(), StoreError> {
        (**self).upsert(row).await
    }

    async fn get(&self, key: &EntityKey) -> Result<Option<Row>, StoreError> {
        (**self).get(key).await
    }

    async fn list(&self, kind: RowKind) -> Result<Vec<Row>, StoreError> {
        (**self).list(kind).await
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        (**self).find_by_correlation(correlation_id).await
    }

    async fn with_locked<R, E, F>(&self, keys: &[EntityKey], work: F) -> Result<R, E>
    where
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut LockedRows) -> Result<R, E> + Send + 'static,
    {
        (**self).with_locked(keys, work).await
    }
}

/// Typed convenience reads on top of [`LedgerStore`].
#[async_trait]
pub trait LedgerStoreExt: LedgerStore {
    /// Load a row and unwrap it as `T`; missing rows are `NotFound`.
    async fn load<T: Stored + 'static>(&self, key: &EntityKey) -> Result<T, StoreError> {
        let row = self
            .get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        T::from_row(row).ok_or_else(|| kind_mismatch::<T>(key))
    }

    async fn list_as<T: Stored + 'static>(&self, kind: RowKind) -> Result<Vec<T>, StoreError> {
        Ok(self
            .list(kind)
            .await?
            .into_iter()
            .filter_map(T::from_row)
            .collect())
    }
}

impl<S: LedgerStore> LedgerStoreExt for S {}
