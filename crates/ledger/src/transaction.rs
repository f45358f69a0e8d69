//! Transactions: one record type with a tagged `kind`, a status lifecycle and a one-way
//! processing latch.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sacco_core::{AccountId, DomainError, DomainResult, GoalId, InvestmentId, LoanId, UserId};

use crate::posting::{EntityRef, Leg, Posting};

/// Pending transactions not resolved within this many days are abandoned.
pub const DEFAULT_PENDING_EXPIRY_DAYS: i64 = 3;

/// `TRN` followed by an upper-case, dash-less UUIDv7.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionId(String);

impl TransactionId {
    const PREFIX: &'static str = "TRN";

    pub fn new() -> Self {
        Self(format!(
            "{}{}",
            Self::PREFIX,
            Uuid::now_v7().simple().to_string().to_uppercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TransactionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| DomainError::invalid_id(format!("TransactionId: missing prefix in {s}")))?;
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DomainError::invalid_id(format!("TransactionId: malformed {s}")));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for TransactionId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransactionId> for String {
    fn from(value: TransactionId) -> Self {
        value.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[serde(rename = "mpesa")]
    Mpesa,
    #[serde(rename = "paypal")]
    Paypal,
    #[serde(rename = "bank_transfer")]
    BankTransfer,
    #[serde(rename = "in-house")]
    InHouse,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mpesa => "mpesa",
            Self::Paypal => "paypal",
            Self::BankTransfer => "bank_transfer",
            Self::InHouse => "in-house",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdraw,
    Refund,
    Transfer,
    Loan,
    Investment,
    Saving,
    MinimumSharesDeposit,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Refund => "refund",
            Self::Transfer => "transfer",
            Self::Loan => "loan",
            Self::Investment => "investment",
            Self::Saving => "saving",
            Self::MinimumSharesDeposit => "minimum_shares_deposit",
        }
    }
}

/// One side of a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Endpoint {
    Account(AccountId),
    Goal(GoalId),
}

impl Endpoint {
    fn entity(self) -> EntityRef {
        match self {
            Self::Account(id) => EntityRef::Account(id),
            Self::Goal(id) => EntityRef::Goal(id),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanFlow {
    Disbursement,
    Repayment,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentFlow {
    Contribution,
    Withdrawal,
}

/// Kind-specific payload: exactly the references the kind's balance effect needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit {
        account: AccountId,
    },
    Withdraw {
        account: AccountId,
    },
    Refund {
        account: AccountId,
        original: Option<TransactionId>,
    },
    Transfer {
        from: Endpoint,
        to: Endpoint,
    },
    Loan {
        loan: LoanId,
        flow: LoanFlow,
    },
    Investment {
        investment: InvestmentId,
        flow: InvestmentFlow,
    },
    Saving {
        goal: GoalId,
    },
    MinimumSharesDeposit {
        account: AccountId,
    },
}

impl TransactionKind {
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            Self::Deposit { .. } => TransactionType::Deposit,
            Self::Withdraw { .. } => TransactionType::Withdraw,
            Self::Refund { .. } => TransactionType::Refund,
            Self::Transfer { .. } => TransactionType::Transfer,
            Self::Loan { .. } => TransactionType::Loan,
            Self::Investment { .. } => TransactionType::Investment,
            Self::Saving { .. } => TransactionType::Saving,
            Self::MinimumSharesDeposit { .. } => TransactionType::MinimumSharesDeposit,
        }
    }

    /// Entities referenced by this kind, in posting order.
    pub fn references(&self) -> Vec<EntityRef> {
        match self {
            Self::Deposit { account }
            | Self::Withdraw { account }
            | Self::Refund { account, .. }
            | Self::MinimumSharesDeposit { account } => vec![EntityRef::Account(*account)],
            Self::Transfer { from, to } => vec![from.entity(), to.entity()],
            Self::Loan { loan, .. } => vec![EntityRef::Loan(*loan)],
            Self::Investment { investment, .. } => vec![EntityRef::Investment(*investment)],
            Self::Saving { goal } => vec![EntityRef::Goal(*goal)],
        }
    }

    /// The entity this kind takes money out of, if any.
    pub fn debited(&self) -> Option<EntityRef> {
        match self {
            Self::Withdraw { account } => Some(EntityRef::Account(*account)),
            Self::Transfer { from, .. } => Some(from.entity()),
            Self::Loan {
                loan,
                flow: LoanFlow::Disbursement,
            } => Some(EntityRef::Loan(*loan)),
            Self::Investment {
                investment,
                flow: InvestmentFlow::Withdrawal,
            } => Some(EntityRef::Investment(*investment)),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        self.references()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// Correlation ids and result fields reported by an external payment provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub phone_number: Option<String>,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
}

impl ProviderRef {
    /// Does `id` match any provider-issued correlation id on this record?
    pub fn correlates(&self, id: &str) -> bool {
        [
            &self.checkout_request_id,
            &self.merchant_request_id,
            &self.provider_transaction_id,
        ]
        .into_iter()
        .any(|candidate| candidate.as_deref() == Some(id))
    }
}

/// Outcome fields carried by a provider callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResult {
    pub result_code: i64,
    pub result_desc: String,
    pub provider_transaction_id: Option<String>,
    pub phone_number: Option<String>,
    pub amount: Option<u64>,
}

impl ProviderResult {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }
}

/// Transaction creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub amount: u64,
    pub payment_method: PaymentMethod,
    pub description: String,
    pub initiated_by: Option<UserId>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub provider: ProviderRef,
}

impl NewTransaction {
    pub fn new(kind: TransactionKind, amount: u64, payment_method: PaymentMethod) -> Self {
        Self {
            kind,
            amount,
            payment_method,
            description: String::new(),
            initiated_by: None,
            expiry_date: None,
            provider: ProviderRef::default(),
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn initiated_by(mut self, user: UserId) -> Self {
        self.initiated_by = Some(user);
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expiry_date = Some(at);
        self
    }

    pub fn with_provider(mut self, provider: ProviderRef) -> Self {
        self.provider = provider;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    id: TransactionId,
    kind: TransactionKind,
    amount: u64,
    status: TransactionStatus,
    payment_method: PaymentMethod,
    description: String,
    initiated_by: Option<UserId>,
    is_processed: bool,
    expiry_date: Option<DateTime<Utc>>,
    provider: ProviderRef,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Validate and build a new transaction.
    ///
    /// In-house movements complete immediately; everything else starts pending with an
    /// expiry (explicit, or [`DEFAULT_PENDING_EXPIRY_DAYS`] from `now`).
    pub fn create(req: NewTransaction, now: DateTime<Utc>) -> DomainResult<Self> {
        if req.amount == 0 {
            return Err(DomainError::validation("amount must be greater than zero"));
        }
        if let TransactionKind::Transfer { from, to } = &req.kind {
            if from == to {
                return Err(DomainError::validation(
                    "sender and receiver must be different",
                ));
            }
        }

        let (status, expiry_date) = match req.payment_method {
            PaymentMethod::InHouse => (TransactionStatus::Completed, None),
            _ => (
                TransactionStatus::Pending,
                Some(
                    req.expiry_date
                        .unwrap_or(now + Duration::days(DEFAULT_PENDING_EXPIRY_DAYS)),
                ),
            ),
        };

        Ok(Self {
            id: TransactionId::new(),
            kind: req.kind,
            amount: req.amount,
            status,
            payment_method: req.payment_method,
            description: req.description,
            initiated_by: req.initiated_by,
            is_processed: false,
            expiry_date,
            provider: req.provider,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn kind(&self) -> &TransactionKind {
        &self.kind
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.kind.transaction_type()
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn initiated_by(&self) -> Option<UserId> {
        self.initiated_by
    }

    pub fn is_processed(&self) -> bool {
        self.is_processed
    }

    pub fn expiry_date(&self) -> Option<DateTime<Utc>> {
        self.expiry_date
    }

    pub fn provider(&self) -> &ProviderRef {
        &self.provider
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Unresolved and past its expiry date.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expiry_date.is_some_and(|expiry| now > expiry)
    }

    /// Completed and not yet applied to balances.
    pub fn is_settleable(&self) -> bool {
        self.status == TransactionStatus::Completed && !self.is_processed
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            TransactionStatus::Pending => {
                self.status = TransactionStatus::Processing;
                self.updated_at = now;
                Ok(())
            }
            TransactionStatus::Processing => Ok(()),
            other => Err(self.illegal_transition(other, TransactionStatus::Processing)),
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            TransactionStatus::Pending | TransactionStatus::Processing => {
                if self.is_expired(now) {
                    return Err(DomainError::conflict(format!(
                        "transaction {} expired before completion",
                        self.id
                    )));
                }
                self.status = TransactionStatus::Completed;
                self.updated_at = now;
                Ok(())
            }
            other => Err(self.illegal_transition(other, TransactionStatus::Completed)),
        }
    }

    /// Fail an unresolved transaction, or a completed one whose settlement was refused.
    pub fn fail(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            TransactionStatus::Pending | TransactionStatus::Processing => {}
            TransactionStatus::Completed if !self.is_processed => {}
            other => return Err(self.illegal_transition(other, TransactionStatus::Failed)),
        }
        self.status = TransactionStatus::Failed;
        self.updated_at = now;
        Ok(())
    }

    /// Flip the processing latch. Only a completed, unprocessed transaction may be latched.
    pub fn mark_processed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != TransactionStatus::Completed {
            return Err(DomainError::conflict(format!(
                "transaction {} is {}, not completed",
                self.id,
                self.status.as_str()
            )));
        }
        if self.is_processed {
            return Err(DomainError::conflict(format!(
                "transaction {} already processed",
                self.id
            )));
        }
        self.is_processed = true;
        self.updated_at = now;
        Ok(())
    }

    /// Store the provider's outcome fields. A reported amount replaces the requested one.
    pub fn record_provider_result(
        &mut self,
        result: &ProviderResult,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.is_processed || self.status.is_terminal() {
            return Err(DomainError::conflict(format!(
                "transaction {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        if let Some(amount) = result.amount {
            if amount == 0 {
                return Err(DomainError::validation("provider reported a zero amount"));
            }
            self.amount = amount;
        }
        self.provider.result_code = Some(result.result_code);
        self.provider.result_desc = Some(result.result_desc.clone());
        if result.provider_transaction_id.is_some() {
            self.provider.provider_transaction_id = result.provider_transaction_id.clone();
        }
        if result.phone_number.is_some() {
            self.provider.phone_number = result.phone_number.clone();
        }
        self.updated_at = now;
        Ok(())
    }

    /// Merge correlation ids issued when the provider accepted the request, and move the
    /// transaction to `processing`.
    pub fn attach_provider(&mut self, issued: ProviderRef, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_processed || self.status.is_terminal() {
            return Err(DomainError::conflict(format!(
                "transaction {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        let ProviderRef {
            checkout_request_id,
            merchant_request_id,
            provider_transaction_id,
            phone_number,
            ..
        } = issued;
        if checkout_request_id.is_some() {
            self.provider.checkout_request_id = checkout_request_id;
        }
        if merchant_request_id.is_some() {
            self.provider.merchant_request_id = merchant_request_id;
        }
        if provider_transaction_id.is_some() {
            self.provider.provider_transaction_id = provider_transaction_id;
        }
        if phone_number.is_some() {
            self.provider.phone_number = phone_number;
        }
        self.mark_processing(now)
    }

    /// The balance effect of this transaction, debit legs first.
    pub fn postings(&self) -> Vec<Posting> {
        let amount = self.amount;
        match &self.kind {
            TransactionKind::Deposit { account } | TransactionKind::Refund { account, .. } => {
                vec![Posting::new(EntityRef::Account(*account), Leg::Credit(amount))]
            }
            TransactionKind::Withdraw { account } => {
                vec![Posting::new(EntityRef::Account(*account), Leg::Debit(amount))]
            }
            TransactionKind::MinimumSharesDeposit { account } => vec![Posting::new(
                EntityRef::Account(*account),
                Leg::CreditShares(amount),
            )],
            TransactionKind::Transfer { from, to } => vec![
                Posting::new(from.entity(), Leg::Debit(amount)),
                Posting::new(to.entity(), Leg::Credit(amount)),
            ],
            TransactionKind::Loan { loan, flow } => {
                let leg = match flow {
                    LoanFlow::Disbursement => Leg::Debit(amount),
                    LoanFlow::Repayment => Leg::Credit(amount),
                };
                vec![Posting::new(EntityRef::Loan(*loan), leg)]
            }
            TransactionKind::Investment { investment, flow } => {
                let leg = match flow {
                    InvestmentFlow::Contribution => Leg::Credit(amount),
                    InvestmentFlow::Withdrawal => Leg::Debit(amount),
                };
                vec![Posting::new(EntityRef::Investment(*investment), leg)]
            }
            TransactionKind::Saving { goal } => {
                vec![Posting::new(EntityRef::Goal(*goal), Leg::Credit(amount))]
            }
        }
    }

    /// Field name / stringified value pairs, in a fixed order, for the audit trail.
    pub fn audit_fields(&self) -> Vec<(&'static str, String)> {
        fn opt<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(ToString::to_string).unwrap_or_default()
        }

        vec![
            ("transaction_id", self.id.to_string()),
            ("transaction_type", self.transaction_type().as_str().to_string()),
            ("references", self.kind.describe()),
            ("amount", self.amount.to_string()),
            ("status", self.status.as_str().to_string()),
            ("payment_method", self.payment_method.as_str().to_string()),
            ("description", self.description.clone()),
            ("is_processed", self.is_processed.to_string()),
            ("expiry_date", opt(&self.expiry_date)),
            ("checkout_request_id", opt(&self.provider.checkout_request_id)),
            ("merchant_request_id", opt(&self.provider.merchant_request_id)),
            (
                "provider_transaction_id",
                opt(&self.provider.provider_transaction_id),
            ),
            ("phone_number", opt(&self.provider.phone_number)),
            ("result_code", opt(&self.provider.result_code)),
            ("result_desc", opt(&self.provider.result_desc)),
        ]
    }

    fn illegal_transition(&self, from: TransactionStatus, to: TransactionStatus) -> DomainError {
        DomainError::conflict(format!(
            "transaction {} cannot move from {} to {}",
            self.id,
            from.as_str(),
            to.as_str()
        ))
    }
}
