use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sacco_core::{AccountId, GoalId, LoanId};
use sacco_events::Event;

use crate::transaction::{TransactionId, TransactionStatus, TransactionType};

/// Facts published after the ledger write they describe has committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    TransactionSettled {
        transaction_id: TransactionId,
        transaction_type: TransactionType,
        amount: u64,
        at: DateTime<Utc>,
    },
    TransactionFailed {
        transaction_id: TransactionId,
        transaction_type: TransactionType,
        previous: TransactionStatus,
        reason: String,
        at: DateTime<Utc>,
    },
    MilestoneReached {
        goal: GoalId,
        amount: u64,
        at: DateTime<Utc>,
    },
    GoalCompleted {
        goal: GoalId,
        at: DateTime<Utc>,
    },
    MembershipGranted {
        account: AccountId,
        at: DateTime<Utc>,
    },
    LoanApproved {
        loan: LoanId,
        amount: u64,
        at: DateTime<Utc>,
    },
    LoanRejected {
        loan: LoanId,
        at: DateTime<Utc>,
    },
    LoanRepaid {
        loan: LoanId,
        at: DateTime<Utc>,
    },
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::TransactionSettled { .. } => "ledger.transaction.settled",
            Self::TransactionFailed { .. } => "ledger.transaction.failed",
            Self::MilestoneReached { .. } => "ledger.goal.milestone_reached",
            Self::GoalCompleted { .. } => "ledger.goal.completed",
            Self::MembershipGranted { .. } => "ledger.account.membership_granted",
            Self::LoanApproved { .. } => "ledger.loan.approved",
            Self::LoanRejected { .. } => "ledger.loan.rejected",
            Self::LoanRepaid { .. } => "ledger.loan.repaid",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::TransactionSettled { at, .. }
            | Self::TransactionFailed { at, .. }
            | Self::MilestoneReached { at, .. }
            | Self::GoalCompleted { at, .. }
            | Self::MembershipGranted { at, .. }
            | Self::LoanApproved { at, .. }
            | Self::LoanRejected { at, .. }
            | Self::LoanRepaid { at, .. } => *at,
        }
    }
}

impl LedgerEvent {
    /// Stable key of the row the event is about.
    pub fn subject(&self) -> String {
        match self {
            Self::TransactionSettled { transaction_id, .. }
            | Self::TransactionFailed { transaction_id, .. } => transaction_id.to_string(),
            Self::MilestoneReached { goal, .. } | Self::GoalCompleted { goal, .. } => {
                goal.to_string()
            }
            Self::MembershipGranted { account, .. } => account.to_string(),
            Self::LoanApproved { loan, .. }
            | Self::LoanRejected { loan, .. }
            | Self::LoanRepaid { loan, .. } => loan.to_string(),
        }
    }
}
