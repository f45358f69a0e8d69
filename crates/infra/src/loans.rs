//! Loan desk: request, requirement tracking, approval and money movement for loans.
//!
//! Status changes (approve/reject) lock only the loan row. Disbursements and repayments
//! are ordinary `Loan` transactions and go through the ledger pipeline like any other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use sacco_core::{AccountId, DomainError, Entity, LoanId, UserId};
use sacco_events::EventBus;
use sacco_ledger::{
    Account, LedgerEvent, Loan, LoanFlow, LoanType, NewTransaction, PaymentMethod, Transaction,
    TransactionKind, UserLoanRequirement,
};

use crate::audit_trail::AuditSink;
use crate::service::{LedgerEnvelope, LedgerError, LedgerService};
use crate::store::{EntityKey, LedgerStore, LedgerStoreExt, Row};

pub struct LoanDesk<S, A, B> {
    ledger: Arc<LedgerService<S, A, B>>,
}

impl<S, A, B> LoanDesk<S, A, B>
where
    S: LedgerStore + Clone,
    A: AuditSink,
    B: EventBus<LedgerEnvelope>,
{
    pub fn new(ledger: Arc<LedgerService<S, A, B>>) -> Self {
        Self { ledger }
    }

    fn store(&self) -> &S {
        self.ledger.store()
    }

    #[instrument(skip(self, loan_type), fields(account_id = %account, loan_type = %loan_type.name))]
    pub async fn request_loan(
        &self,
        account: AccountId,
        loan_type: LoanType,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Loan, LedgerError> {
        self.store()
            .load::<Account>(&EntityKey::Account(account))
            .await?;

        let loan = Loan::request(LoanId::new(), account, loan_type, amount, now)?;
        self.store().insert(Row::Loan(loan.clone())).await?;

        info!(loan_id = %loan.id(), amount, "loan requested");
        Ok(loan)
    }

    /// Record (or update) a member's fulfilment of a loan requirement.
    #[instrument(skip(self, requirement), fields(account_id = %requirement.account, requirement = %requirement.requirement))]
    pub async fn record_requirement(
        &self,
        requirement: UserLoanRequirement,
    ) -> Result<(), LedgerError> {
        self.store()
            .load::<Account>(&EntityKey::Account(requirement.account))
            .await?;
        self.store().upsert(Row::Requirement(requirement)).await?;
        Ok(())
    }

    /// Approve a pending loan once every mandatory requirement is fulfilled.
    #[instrument(skip(self), fields(loan_id = %loan_id))]
    pub async fn approve_loan(
        &self,
        loan_id: LoanId,
        amount: Option<u64>,
        approved_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<Loan, LedgerError> {
        let loan: Loan = self.store().load(&EntityKey::Loan(loan_id)).await?;
        let submitted = self.submitted_requirements(&loan).await?;

        let key = EntityKey::Loan(loan_id);
        let scope_key = key.clone();
        let approved = self
            .store()
            .with_locked(&[key], move |rows| -> Result<_, LedgerError> {
                let loan = rows.get_mut::<Loan>(&scope_key)?;
                loan.approve(amount, &submitted, approved_by, now)?;
                Ok(loan.clone())
            })
            .await
            .inspect_err(|err| {
                if let LedgerError::Domain(DomainError::RequirementsNotMet(missing)) = err {
                    warn!(missing = ?missing, "loan requirements not met");
                }
            })?;

        info!(
            amount = approved.amount_approved(),
            interest_rate = %approved.interest_rate(),
            "loan approved"
        );
        self.ledger.notify(vec![LedgerEvent::LoanApproved {
            loan: loan_id,
            amount: approved.amount_approved(),
            at: now,
        }]);
        Ok(approved)
    }

    #[instrument(skip(self, reason), fields(loan_id = %loan_id))]
    pub async fn reject_loan(
        &self,
        loan_id: LoanId,
        reason: impl Into<String> + Send + 'static,
        rejected_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<Loan, LedgerError> {
        let key = EntityKey::Loan(loan_id);
        let scope_key = key.clone();
        let rejected = self
            .store()
            .with_locked(&[key], move |rows| -> Result<_, LedgerError> {
                let loan = rows.get_mut::<Loan>(&scope_key)?;
                loan.reject(reason, rejected_by, now)?;
                Ok(loan.clone())
            })
            .await?;

        info!("loan rejected");
        self.ledger.notify(vec![LedgerEvent::LoanRejected {
            loan: loan_id,
            at: now,
        }]);
        Ok(rejected)
    }

    /// Pay out (part of) an approved loan as an in-house transaction.
    pub async fn disburse(
        &self,
        loan_id: LoanId,
        amount: u64,
        by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        let mut req = NewTransaction::new(
            TransactionKind::Loan {
                loan: loan_id,
                flow: LoanFlow::Disbursement,
            },
            amount,
            PaymentMethod::InHouse,
        )
        .described(format!("Disbursement of loan {loan_id}"));
        req.initiated_by = by;
        self.ledger.create_transaction(req, now).await
    }

    /// Record a repayment. In-house repayments settle immediately; external ones settle
    /// when the provider confirms.
    pub async fn repay(
        &self,
        loan_id: LoanId,
        amount: u64,
        method: PaymentMethod,
        by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        let mut req = NewTransaction::new(
            TransactionKind::Loan {
                loan: loan_id,
                flow: LoanFlow::Repayment,
            },
            amount,
            method,
        )
        .described(format!("Repayment of loan {loan_id}"));
        req.initiated_by = by;
        self.ledger.create_transaction(req, now).await
    }

    async fn submitted_requirements(
        &self,
        loan: &Loan,
    ) -> Result<Vec<UserLoanRequirement>, LedgerError> {
        let mut submitted = Vec::new();
        for requirement in &loan.loan_type().requirements {
            let key = EntityKey::Requirement(loan.account(), requirement.id);
            match self.store().load::<UserLoanRequirement>(&key).await {
                Ok(record) => submitted.push(record),
                Err(crate::store::StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(submitted)
    }
}
