//! Investments, per-member investment accounts and dividend apportionment.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use sacco_core::{AccountId, DomainError, DomainResult, Entity, InvestmentId, InvestmentTypeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentType {
    pub id: InvestmentTypeId,
    pub name: String,
    pub description: String,
}

/// A pooled investment product. `current_value` is derived from the ROI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Investment {
    id: InvestmentId,
    investment_type: InvestmentTypeId,
    amount_invested: u64,
    current_value: u64,
    /// Percentage, e.g. `12.5`.
    return_on_investment: Decimal,
    date_invested: DateTime<Utc>,
    maturity_date: Option<DateTime<Utc>>,
    description: String,
    active: bool,
}

impl Investment {
    pub fn new(
        id: InvestmentId,
        investment_type: InvestmentTypeId,
        return_on_investment: Decimal,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            investment_type,
            amount_invested: 0,
            current_value: 0,
            return_on_investment,
            date_invested: now,
            maturity_date: None,
            description: description.into(),
            active: true,
        }
    }

    pub fn maturing_at(mut self, at: DateTime<Utc>) -> Self {
        self.maturity_date = Some(at);
        self
    }

    pub fn investment_type(&self) -> InvestmentTypeId {
        self.investment_type
    }

    pub fn amount_invested(&self) -> u64 {
        self.amount_invested
    }

    pub fn current_value(&self) -> u64 {
        self.current_value
    }

    pub fn return_on_investment(&self) -> Decimal {
        self.return_on_investment
    }

    pub fn maturity_date(&self) -> Option<DateTime<Utc>> {
        self.maturity_date
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn close(&mut self) {
        self.active = false;
    }

    pub fn profit_or_loss(&self) -> i128 {
        i128::from(self.current_value) - i128::from(self.amount_invested)
    }

    /// Realised ROI as a percentage of the invested amount.
    pub fn roi_percentage(&self) -> Decimal {
        if self.amount_invested == 0 {
            return Decimal::ZERO;
        }
        (Decimal::from(self.profit_or_loss()) * Decimal::ONE_HUNDRED
            / Decimal::from(self.amount_invested))
        .round_dp(2)
    }

    pub fn set_return_on_investment(&mut self, roi: Decimal) {
        self.return_on_investment = roi;
        self.revalue();
    }

    pub(crate) fn contribute(&mut self, amount: u64) -> DomainResult<()> {
        self.amount_invested = self
            .amount_invested
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant("investment amount overflow"))?;
        self.revalue();
        Ok(())
    }

    pub(crate) fn withdraw(&mut self, amount: u64) -> DomainResult<()> {
        if amount > self.amount_invested {
            return Err(DomainError::insufficient_funds(self.amount_invested, amount));
        }
        self.amount_invested -= amount;
        self.revalue();
        Ok(())
    }

    fn revalue(&mut self) {
        let factor = Decimal::ONE + self.return_on_investment / Decimal::ONE_HUNDRED;
        self.current_value = (Decimal::from(self.amount_invested) * factor)
            .round()
            .to_u64()
            .unwrap_or(0);
    }
}

impl Entity for Investment {
    type Id = InvestmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// A member's stake in one investment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInvestment {
    pub investment: InvestmentId,
    pub investment_type: InvestmentTypeId,
    pub invested_amount: u64,
    pub date_added: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dividend {
    pub investment_type: InvestmentTypeId,
    pub amount: u64,
    pub date_distributed: DateTime<Utc>,
    pub distributed: bool,
}

/// Aggregates one member's positions under an investment ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentAccount {
    account: AccountId,
    investment_limit: u64,
    positions: Vec<UserInvestment>,
    dividends: Vec<Dividend>,
}

impl InvestmentAccount {
    pub fn open(account: AccountId, investment_limit: u64) -> Self {
        Self {
            account,
            investment_limit,
            positions: Vec::new(),
            dividends: Vec::new(),
        }
    }

    pub fn investment_limit(&self) -> u64 {
        self.investment_limit
    }

    pub fn positions(&self) -> &[UserInvestment] {
        &self.positions
    }

    pub fn dividends(&self) -> &[Dividend] {
        &self.dividends
    }

    /// Total invested across active positions.
    pub fn active_invested(&self) -> u64 {
        self.positions
            .iter()
            .filter(|p| p.active)
            .map(|p| p.invested_amount)
            .sum()
    }

    pub fn has_reached_limit(&self) -> bool {
        self.active_invested() >= self.investment_limit
    }

    /// Add a position; the limit is checked before anything is recorded.
    pub fn add_position(
        &mut self,
        investment: &Investment,
        amount: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<&UserInvestment> {
        if amount == 0 {
            return Err(DomainError::validation("invested amount must be greater than zero"));
        }
        if !investment.is_active() {
            return Err(DomainError::conflict(format!(
                "investment {} is closed",
                investment.id()
            )));
        }
        let total = self.active_invested().saturating_add(amount);
        if total > self.investment_limit {
            return Err(DomainError::validation(format!(
                "investment limit of {} would be exceeded ({total})",
                self.investment_limit
            )));
        }

        self.positions.push(UserInvestment {
            investment: *investment.id(),
            investment_type: investment.investment_type(),
            invested_amount: amount,
            date_added: now,
            active: true,
        });
        Ok(&self.positions[self.positions.len() - 1])
    }

    /// Close every active position in `investment`; returns how many were closed.
    pub fn close_position(&mut self, investment: InvestmentId) -> usize {
        let mut closed = 0;
        for position in self
            .positions
            .iter_mut()
            .filter(|p| p.active && p.investment == investment)
        {
            position.active = false;
            closed += 1;
        }
        closed
    }

    /// This member's active stake in one investment type.
    pub fn stake_in(&self, investment_type: InvestmentTypeId) -> u64 {
        self.positions
            .iter()
            .filter(|p| p.active && p.investment_type == investment_type)
            .map(|p| p.invested_amount)
            .sum()
    }

    pub fn record_dividend(&mut self, dividend: Dividend) {
        self.dividends.push(dividend);
    }
}

impl Entity for InvestmentAccount {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.account
    }
}

/// One member's stake in a dividend pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Stake {
    pub account: AccountId,
    pub invested: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DividendShare {
    pub account: AccountId,
    pub amount: u64,
}

/// Split `pool` pro-rata by invested amount.
///
/// Floors every share, then hands the leftover units to the largest remainders (ties go
/// to the earlier stake) so the shares always sum to the pool. Zero stakes get nothing.
pub fn apportion(pool: u64, stakes: &[Stake]) -> Vec<DividendShare> {
    let total: u128 = stakes.iter().map(|s| u128::from(s.invested)).sum();
    if total == 0 || pool == 0 {
        return Vec::new();
    }

    let mut shares: Vec<(usize, u128, u128)> = stakes
        .iter()
        .enumerate()
        .filter(|(_, s)| s.invested > 0)
        .map(|(i, s)| {
            let weighted = u128::from(pool) * u128::from(s.invested);
            (i, weighted / total, weighted % total)
        })
        .collect();

    let allocated: u128 = shares.iter().map(|(_, floor, _)| floor).sum();
    let mut leftover = u128::from(pool) - allocated;

    let mut by_remainder: Vec<usize> = (0..shares.len()).collect();
    by_remainder.sort_by(|&a, &b| shares[b].2.cmp(&shares[a].2).then(a.cmp(&b)));
    for idx in by_remainder {
        if leftover == 0 {
            break;
        }
        shares[idx].1 += 1;
        leftover -= 1;
    }

    shares
        .into_iter()
        .map(|(i, amount, _)| DividendShare {
            account: stakes[i].account,
            amount: amount as u64,
        })
        .collect()
}
