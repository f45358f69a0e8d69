//! Loan lifecycle: requirement-gated approval, disbursement, repayment and interest.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use sacco_core::{
    AccountId, DomainError, DomainResult, Entity, LoanId, LoanTypeId, RequirementId, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRequirement {
    pub id: RequirementId,
    pub name: String,
    pub description: Option<String>,
    pub mandatory: bool,
    pub document_required: bool,
}

impl LoanRequirement {
    pub fn mandatory(name: impl Into<String>) -> Self {
        Self {
            id: RequirementId::new(),
            name: name.into(),
            description: None,
            mandatory: true,
            document_required: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            mandatory: false,
            ..Self::mandatory(name)
        }
    }
}

/// A member's fulfilment of one requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLoanRequirement {
    pub account: AccountId,
    pub requirement: RequirementId,
    pub fulfilled: bool,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanType {
    pub id: LoanTypeId,
    pub name: String,
    /// Percentage, e.g. `12.5`.
    pub interest_rate: Decimal,
    pub min_amount: u64,
    pub max_amount: u64,
    pub max_duration_months: u32,
    pub requirements: Vec<LoanRequirement>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Pending,
    Approved,
    Rejected,
    Repaid,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanChange {
    Approved,
    Rejected,
    Disbursed,
    Paid,
    Repaid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanPayment {
    pub amount: u64,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanHistory {
    pub change: LoanChange,
    pub changed_by: Option<UserId>,
    pub notes: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    id: LoanId,
    account: AccountId,
    loan_type: LoanType,
    amount_requested: u64,
    amount_approved: u64,
    amount_disbursed: u64,
    total_paid: u64,
    interest_rate: Option<Decimal>,
    status: LoanStatus,
    date_requested: DateTime<Utc>,
    date_approved: Option<DateTime<Utc>>,
    date_disbursed: Option<DateTime<Utc>>,
    due_date: Option<NaiveDate>,
    approved_by: Option<UserId>,
    active: bool,
    payments: Vec<LoanPayment>,
    history: Vec<LoanHistory>,
}

impl Loan {
    /// Record a loan request against a snapshot of its loan type.
    ///
    /// The loan type's `min_amount` is advisory and not enforced here.
    pub fn request(
        id: LoanId,
        account: AccountId,
        loan_type: LoanType,
        amount_requested: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if amount_requested == 0 {
            return Err(DomainError::validation("requested amount must be greater than zero"));
        }
        if amount_requested > loan_type.max_amount {
            return Err(DomainError::validation(format!(
                "the loan amount cannot exceed the maximum allowed for {}: {}",
                loan_type.name, loan_type.max_amount
            )));
        }

        Ok(Self {
            id,
            account,
            loan_type,
            amount_requested,
            amount_approved: 0,
            amount_disbursed: 0,
            total_paid: 0,
            interest_rate: None,
            status: LoanStatus::Pending,
            date_requested: now,
            date_approved: None,
            date_disbursed: None,
            due_date: None,
            approved_by: None,
            active: true,
            payments: Vec::new(),
            history: Vec::new(),
        })
    }

    /// Pin a negotiated rate; approval keeps it instead of the loan type's.
    pub fn with_interest_rate(mut self, rate: Decimal) -> Self {
        self.interest_rate = Some(rate);
        self
    }

    pub fn with_due_date(mut self, due_date: NaiveDate) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    pub fn loan_type(&self) -> &LoanType {
        &self.loan_type
    }

    pub fn amount_requested(&self) -> u64 {
        self.amount_requested
    }

    pub fn amount_approved(&self) -> u64 {
        self.amount_approved
    }

    pub fn amount_disbursed(&self) -> u64 {
        self.amount_disbursed
    }

    pub fn total_paid(&self) -> u64 {
        self.total_paid
    }

    pub fn status(&self) -> LoanStatus {
        self.status
    }

    pub fn date_approved(&self) -> Option<DateTime<Utc>> {
        self.date_approved
    }

    pub fn date_disbursed(&self) -> Option<DateTime<Utc>> {
        self.date_disbursed
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due_date
    }

    pub fn approved_by(&self) -> Option<UserId> {
        self.approved_by
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_disbursed(&self) -> bool {
        self.amount_disbursed > 0
    }

    pub fn payments(&self) -> &[LoanPayment] {
        &self.payments
    }

    pub fn history(&self) -> &[LoanHistory] {
        &self.history
    }

    /// The snapshotted rate, or the loan type's rate before approval.
    pub fn interest_rate(&self) -> Decimal {
        self.interest_rate.unwrap_or(self.loan_type.interest_rate)
    }

    /// Names of mandatory requirements the borrower has not fulfilled.
    pub fn missing_requirements(&self, submitted: &[UserLoanRequirement]) -> Vec<String> {
        self.loan_type
            .requirements
            .iter()
            .filter(|req| req.mandatory)
            .filter(|req| {
                !submitted.iter().any(|s| {
                    s.account == self.account && s.requirement == req.id && s.fulfilled
                })
            })
            .map(|req| req.name.clone())
            .collect()
    }

    /// Approve a pending loan.
    ///
    /// `amount` defaults to the requested amount. Snapshots the interest rate and due date
    /// when they were not set explicitly.
    pub fn approve(
        &mut self,
        amount: Option<u64>,
        submitted: &[UserLoanRequirement],
        approved_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_status(LoanStatus::Pending, "approve")?;

        let missing = self.missing_requirements(submitted);
        if !missing.is_empty() {
            return Err(DomainError::RequirementsNotMet(missing));
        }

        let amount = amount.unwrap_or(self.amount_requested);
        if amount == 0 || amount > self.loan_type.max_amount {
            return Err(DomainError::validation(format!(
                "approved amount must be between 1 and {}",
                self.loan_type.max_amount
            )));
        }

        self.amount_approved = amount;
        self.interest_rate.get_or_insert(self.loan_type.interest_rate);
        self.date_approved = Some(now);
        self.approved_by = approved_by;
        if self.due_date.is_none() {
            let days = i64::from(self.loan_type.max_duration_months) * 30;
            self.due_date = Some(now.date_naive() + Duration::days(days));
        }
        self.status = LoanStatus::Approved;
        self.log(
            LoanChange::Approved,
            approved_by,
            format!("Loan approved for {amount}"),
            now,
        );
        Ok(())
    }

    pub fn reject(
        &mut self,
        reason: impl Into<String>,
        rejected_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_status(LoanStatus::Pending, "reject")?;
        self.status = LoanStatus::Rejected;
        self.active = false;
        self.log(LoanChange::Rejected, rejected_by, reason.into(), now);
        Ok(())
    }

    /// Simple interest on the outstanding principal, rounded half-to-even.
    pub fn calculate_interest(&self) -> u64 {
        let principal = self.amount_approved.saturating_sub(self.total_paid);
        let interest = Decimal::from(principal) * self.interest_rate() / Decimal::ONE_HUNDRED;
        interest
            .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
            .to_u64()
            .unwrap_or(0)
    }

    /// Most that can still be paid: approved + accrued interest - paid.
    pub fn outstanding(&self) -> u64 {
        (self.amount_approved + self.calculate_interest()).saturating_sub(self.total_paid)
    }

    pub(crate) fn record_disbursement(&mut self, amount: u64, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_status(LoanStatus::Approved, "disburse")?;
        let remaining = self.amount_approved - self.amount_disbursed;
        if amount > remaining {
            return Err(DomainError::insufficient_funds(remaining, amount));
        }

        self.amount_disbursed += amount;
        self.date_disbursed = Some(now);
        self.log(
            LoanChange::Disbursed,
            None,
            format!("Disbursed {amount}"),
            now,
        );
        Ok(())
    }

    /// Apply a repayment; returns [`LoanChange::Repaid`] when it settles the loan.
    pub(crate) fn record_payment(&mut self, amount: u64, now: DateTime<Utc>) -> DomainResult<LoanChange> {
        self.ensure_status(LoanStatus::Approved, "accept payments on")?;
        if !self.is_disbursed() {
            return Err(DomainError::conflict(
                "cannot accept payments on a loan that has not been disbursed",
            ));
        }
        let outstanding = self.outstanding();
        if amount > outstanding {
            return Err(DomainError::validation(format!(
                "payment exceeds remaining loan balance; at most {outstanding} can be paid"
            )));
        }

        self.total_paid += amount;
        self.payments.push(LoanPayment {
            amount,
            paid_at: now,
        });
        self.log(LoanChange::Paid, None, format!("Payment of {amount}"), now);

        if self.total_paid >= self.amount_approved + self.calculate_interest() {
            self.status = LoanStatus::Repaid;
            self.active = false;
            self.log(LoanChange::Repaid, None, "Loan fully repaid".to_string(), now);
            return Ok(LoanChange::Repaid);
        }
        Ok(LoanChange::Paid)
    }

    fn ensure_status(&self, expected: LoanStatus, action: &str) -> DomainResult<()> {
        if self.status != expected {
            return Err(DomainError::conflict(format!(
                "cannot {action} a loan that is {:?}",
                self.status
            )));
        }
        Ok(())
    }

    fn log(&mut self, change: LoanChange, by: Option<UserId>, notes: String, at: DateTime<Utc>) {
        self.history.push(LoanHistory {
            change,
            changed_by: by,
            notes,
            at,
        });
    }
}

impl Entity for Loan {
    type Id = LoanId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn loan_type(requirements: Vec<LoanRequirement>) -> LoanType {
        LoanType {
            id: LoanTypeId::new(),
            name: "Development".to_string(),
            interest_rate: dec!(10),
            min_amount: 1_000,
            max_amount: 100_000,
            max_duration_months: 12,
            requirements,
        }
    }

    fn approved_loan(amount: u64) -> Loan {
        let now = Utc::now();
        let mut loan =
            Loan::request(LoanId::new(), AccountId::new(), loan_type(vec![]), amount, now).unwrap();
        loan.approve(None, &[], None, now).unwrap();
        loan
    }

    #[test]
    fn request_above_maximum_is_rejected() {
        let err = Loan::request(
            LoanId::new(),
            AccountId::new(),
            loan_type(vec![]),
            100_001,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn approval_lists_every_missing_mandatory_requirement() {
        let income = LoanRequirement::mandatory("Proof of Income");
        let id_doc = LoanRequirement::mandatory("Identification Document");
        let guarantor = LoanRequirement::optional("Guarantor");
        let account = AccountId::new();
        let now = Utc::now();
        let mut loan = Loan::request(
            LoanId::new(),
            account,
            loan_type(vec![income.clone(), id_doc, guarantor]),
            5_000,
            now,
        )
        .unwrap();

        let submitted = vec![UserLoanRequirement {
            account,
            requirement: income.id,
            fulfilled: true,
            submitted_at: now,
        }];
        let err = loan.approve(None, &submitted, None, now).unwrap_err();

        assert_eq!(
            err,
            DomainError::RequirementsNotMet(vec!["Identification Document".to_string()])
        );
        assert_eq!(loan.status(), LoanStatus::Pending);
        assert!(loan.history().is_empty());
    }

    #[test]
    fn approval_snapshots_rate_date_and_due_date() {
        let now = Utc::now();
        let loan = approved_loan(10_000);

        assert_eq!(loan.status(), LoanStatus::Approved);
        assert_eq!(loan.amount_approved(), 10_000);
        assert_eq!(loan.interest_rate(), dec!(10));
        assert!(loan.date_approved().is_some());
        assert_eq!(
            loan.due_date(),
            Some(now.date_naive() + Duration::days(360))
        );
        assert_eq!(loan.history()[0].change, LoanChange::Approved);
    }

    #[test]
    fn explicit_rate_survives_approval() {
        let now = Utc::now();
        let mut loan = Loan::request(LoanId::new(), AccountId::new(), loan_type(vec![]), 1_000, now)
            .unwrap()
            .with_interest_rate(dec!(7.5));
        loan.approve(None, &[], None, now).unwrap();
        assert_eq!(loan.interest_rate(), dec!(7.5));
    }

    #[test]
    fn interest_rounds_half_to_even() {
        let now = Utc::now();
        let mut loan = Loan::request(LoanId::new(), AccountId::new(), loan_type(vec![]), 25, now)
            .unwrap()
            .with_interest_rate(dec!(10));
        loan.approve(None, &[], None, now).unwrap();
        // 2.5 rounds to 2
        assert_eq!(loan.calculate_interest(), 2);
    }

    #[test]
    fn payments_require_disbursement() {
        let mut loan = approved_loan(1_000);
        assert!(matches!(
            loan.record_payment(100, Utc::now()),
            Err(DomainError::Conflict(_))
        ));
    }

    #[test]
    fn disbursement_is_capped_at_approved_amount() {
        let mut loan = approved_loan(1_000);
        let now = Utc::now();
        loan.record_disbursement(600, now).unwrap();
        assert_eq!(
            loan.record_disbursement(500, now).unwrap_err(),
            DomainError::insufficient_funds(400, 500)
        );
        assert_eq!(loan.amount_disbursed(), 600);
    }

    #[test]
    fn repayment_with_interest_closes_the_loan() {
        let now = Utc::now();
        let mut loan = approved_loan(1_000);
        loan.record_disbursement(1_000, now).unwrap();

        assert_eq!(loan.outstanding(), 1_100);
        assert!(loan.record_payment(1_101, now).is_err());

        assert_eq!(loan.record_payment(500, now).unwrap(), LoanChange::Paid);
        // interest now accrues on the remaining 500
        assert_eq!(loan.outstanding(), 550);

        assert_eq!(loan.record_payment(550, now).unwrap(), LoanChange::Repaid);
        assert_eq!(loan.status(), LoanStatus::Repaid);
        assert!(!loan.is_active());
        assert_eq!(loan.total_paid(), 1_050);
    }

    #[test]
    fn rejected_loan_cannot_be_approved() {
        let now = Utc::now();
        let mut loan =
            Loan::request(LoanId::new(), AccountId::new(), loan_type(vec![]), 1_000, now).unwrap();
        loan.reject("Insufficient savings history", None, now).unwrap();
        assert!(matches!(
            loan.approve(None, &[], None, now),
            Err(DomainError::Conflict(_))
        ));
        assert_eq!(loan.history()[0].change, LoanChange::Rejected);
    }
}
