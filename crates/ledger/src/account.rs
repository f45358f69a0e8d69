use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sacco_core::{AccountId, DomainError, DomainResult, Entity, UserId};

/// Identity verification record produced by onboarding (KYC documents live elsewhere).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycRecord {
    pub user: UserId,
    pub full_name: String,
    pub id_number: String,
    pub confirmed: bool,
    pub submitted_at: DateTime<Utc>,
}

/// Member account (one per user).
///
/// Balances are in the smallest currency unit and only move through postings
/// (see [`crate::posting`]); accounts are deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    id: AccountId,
    owner: UserId,
    account_number: String,
    balance: u64,
    minimum_shares_balance: u64,
    active: bool,
    suspended: bool,
    full_member: bool,
    kyc_confirmed: bool,
    opened_at: DateTime<Utc>,
}

impl Account {
    /// Open an account for the owner of `kyc`.
    ///
    /// The account starts active only if the identity record is already confirmed.
    pub fn open(id: AccountId, kyc: &KycRecord, now: DateTime<Utc>) -> DomainResult<Self> {
        if kyc.full_name.trim().is_empty() || kyc.id_number.trim().is_empty() {
            return Err(DomainError::validation(
                "identity record must carry a name and an id number",
            ));
        }

        Ok(Self {
            id,
            owner: kyc.user,
            account_number: account_number_for(&id),
            balance: 0,
            minimum_shares_balance: 0,
            active: kyc.confirmed,
            suspended: false,
            full_member: false,
            kyc_confirmed: kyc.confirmed,
            opened_at: now,
        })
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn account_number(&self) -> &str {
        &self.account_number
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    pub fn minimum_shares_balance(&self) -> u64 {
        self.minimum_shares_balance
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_full_member(&self) -> bool {
        self.full_member
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn can_transact(&self) -> bool {
        self.active && !self.suspended
    }

    pub fn confirm_kyc(&mut self) {
        self.kyc_confirmed = true;
        self.active = true;
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn reinstate(&mut self) {
        self.suspended = false;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub(crate) fn credit(&mut self, amount: u64) -> DomainResult<()> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant("account balance overflow"))?;
        Ok(())
    }

    pub(crate) fn debit(&mut self, amount: u64) -> DomainResult<()> {
        if amount > self.balance {
            return Err(DomainError::insufficient_funds(self.balance, amount));
        }
        self.balance -= amount;
        Ok(())
    }

    /// Credit the share capital; returns `true` when this deposit made the member full.
    pub(crate) fn credit_shares(&mut self, amount: u64, required: u64) -> DomainResult<bool> {
        self.minimum_shares_balance = self
            .minimum_shares_balance
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant("share balance overflow"))?;

        if !self.full_member && self.minimum_shares_balance >= required {
            self.full_member = true;
            return Ok(true);
        }
        Ok(false)
    }
}

impl Entity for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// `217` followed by ten digits derived from the account id.
fn account_number_for(id: &AccountId) -> String {
    let digits = id.as_uuid().as_u128() % 10_000_000_000;
    format!("217{digits:010}")
}
