//! SACCO ledger domain (accounts, goals, transactions, loans, investments).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns. Balances change in
//! exactly one place, [`posting::apply`]; everything else builds or inspects records.

pub mod account;
pub mod audit;
pub mod events;
pub mod goal;
pub mod investment;
pub mod loan;
pub mod posting;
pub mod transaction;

pub use account::{Account, KycRecord};
pub use audit::{AuditTransaction, NOT_APPLICABLE, change_entries, creation_entries};
pub use events::LedgerEvent;
pub use goal::{Goal, Milestone, SavingFrequency};
pub use investment::{
    Dividend, DividendShare, Investment, InvestmentAccount, InvestmentType, Stake, UserInvestment,
    apportion,
};
pub use loan::{
    Loan, LoanChange, LoanHistory, LoanPayment, LoanRequirement, LoanStatus, LoanType,
    UserLoanRequirement,
};
pub use posting::{EntityRef, HolderMut, Leg, Posting, PostingContext};
pub use transaction::{
    DEFAULT_PENDING_EXPIRY_DAYS, Endpoint, InvestmentFlow, LoanFlow, NewTransaction, PaymentMethod,
    ProviderRef, ProviderResult, Transaction, TransactionId, TransactionKind, TransactionStatus,
    TransactionType,
};
