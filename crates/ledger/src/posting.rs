//! Postings: the single place balances change.
//!
//! A transaction expands into postings (see `Transaction::postings`); each posting is
//! applied to the balance holder it names. The same function validates a transaction
//! against copies of its holders and settles it against the locked originals, so the
//! dry run and the real run can never disagree about the rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sacco_core::{AccountId, DomainError, DomainResult, Entity, GoalId, InvestmentId, LoanId};

use crate::account::Account;
use crate::events::LedgerEvent;
use crate::goal::Goal;
use crate::investment::Investment;
use crate::loan::{Loan, LoanChange};

/// Reference to a balance-holding row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Account(AccountId),
    Goal(GoalId),
    Loan(LoanId),
    Investment(InvestmentId),
}

impl core::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Account(id) => write!(f, "account:{id}"),
            Self::Goal(id) => write!(f, "goal:{id}"),
            Self::Loan(id) => write!(f, "loan:{id}"),
            Self::Investment(id) => write!(f, "investment:{id}"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Credit(u64),
    Debit(u64),
    /// Credit to an account's share capital rather than its balance.
    CreditShares(u64),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub entity: EntityRef,
    pub leg: Leg,
}

impl Posting {
    pub fn new(entity: EntityRef, leg: Leg) -> Self {
        Self { entity, leg }
    }
}

/// Mutable access to one balance holder.
#[derive(Debug)]
pub enum HolderMut<'a> {
    Account(&'a mut Account),
    Goal(&'a mut Goal),
    Loan(&'a mut Loan),
    Investment(&'a mut Investment),
}

impl HolderMut<'_> {
    pub fn entity(&self) -> EntityRef {
        match self {
            Self::Account(a) => EntityRef::Account(*a.id()),
            Self::Goal(g) => EntityRef::Goal(*g.id()),
            Self::Loan(l) => EntityRef::Loan(*l.id()),
            Self::Investment(i) => EntityRef::Investment(*i.id()),
        }
    }

    /// Whether the holder may currently take part in a movement.
    fn ensure_open(&self) -> DomainResult<()> {
        match self {
            Self::Account(a) if !a.can_transact() => Err(DomainError::conflict(format!(
                "account {} is inactive or suspended",
                a.account_number()
            ))),
            Self::Investment(i) if !i.is_active() => Err(DomainError::conflict(format!(
                "investment {} is closed",
                i.id()
            ))),
            _ => Ok(()),
        }
    }
}

/// Settlement-time parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PostingContext {
    pub now: DateTime<Utc>,
    pub minimum_shares_required: u64,
}

/// Apply one posting to the holder it names, returning derived events.
pub fn apply(
    holder: HolderMut<'_>,
    posting: &Posting,
    ctx: &PostingContext,
) -> DomainResult<Vec<LedgerEvent>> {
    if holder.entity() != posting.entity {
        return Err(DomainError::invariant(format!(
            "posting for {} applied to {}",
            posting.entity,
            holder.entity()
        )));
    }
    holder.ensure_open()?;

    let mut events = Vec::new();
    match (holder, posting.leg) {
        (HolderMut::Account(account), Leg::Credit(amount)) => account.credit(amount)?,
        (HolderMut::Account(account), Leg::Debit(amount)) => account.debit(amount)?,
        (HolderMut::Account(account), Leg::CreditShares(amount)) => {
            if account.credit_shares(amount, ctx.minimum_shares_required)? {
                events.push(LedgerEvent::MembershipGranted {
                    account: *account.id(),
                    at: ctx.now,
                });
            }
        }
        (HolderMut::Goal(goal), Leg::Credit(amount)) => {
            let was_completed = goal.is_completed();
            for milestone in goal.credit(amount)? {
                events.push(LedgerEvent::MilestoneReached {
                    goal: *goal.id(),
                    amount: milestone.amount,
                    at: ctx.now,
                });
            }
            if goal.is_completed() && !was_completed {
                events.push(LedgerEvent::GoalCompleted {
                    goal: *goal.id(),
                    at: ctx.now,
                });
            }
        }
        (HolderMut::Goal(goal), Leg::Debit(amount)) => goal.debit(amount)?,
        (HolderMut::Loan(loan), Leg::Credit(amount)) => {
            if let LoanChange::Repaid = loan.record_payment(amount, ctx.now)? {
                events.push(LedgerEvent::LoanRepaid {
                    loan: *loan.id(),
                    at: ctx.now,
                });
            }
        }
        (HolderMut::Loan(loan), Leg::Debit(amount)) => loan.record_disbursement(amount, ctx.now)?,
        (HolderMut::Investment(investment), Leg::Credit(amount)) => investment.contribute(amount)?,
        (HolderMut::Investment(investment), Leg::Debit(amount)) => investment.withdraw(amount)?,
        (holder, Leg::CreditShares(_)) => {
            return Err(DomainError::invariant(format!(
                "share capital cannot be posted to {}",
                holder.entity()
            )));
        }
    }

    Ok(events)
}
