use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use sacco_core::{AccountId, DomainError, DomainResult, Entity, GoalId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SavingFrequency {
    Daily,
    Weekly,
    Monthly,
    Once,
}

impl SavingFrequency {
    /// Days between milestones; `Once` spans the whole goal.
    fn interval_days(self, total_days: i64) -> i64 {
        match self {
            Self::Daily => 1,
            Self::Weekly => 7,
            Self::Monthly => 30,
            Self::Once => total_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub amount: u64,
    pub date: NaiveDate,
    pub achieved: bool,
}

/// Savings goal held inside an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    id: GoalId,
    account: AccountId,
    name: String,
    target_amount: u64,
    current_amount: u64,
    start_date: NaiveDate,
    deadline: NaiveDate,
    saving_frequency: SavingFrequency,
    milestones: Vec<Milestone>,
    active: bool,
}

impl Goal {
    pub fn create(
        id: GoalId,
        account: AccountId,
        name: impl Into<String>,
        target_amount: u64,
        start_date: NaiveDate,
        deadline: NaiveDate,
        saving_frequency: SavingFrequency,
    ) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("goal name cannot be empty"));
        }
        if deadline < start_date {
            return Err(DomainError::validation("goal deadline precedes its start date"));
        }

        Ok(Self {
            id,
            account,
            name,
            target_amount,
            current_amount: 0,
            start_date,
            deadline,
            saving_frequency,
            milestones: generate_milestones(target_amount, start_date, deadline, saving_frequency),
            active: true,
        })
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_amount(&self) -> u64 {
        self.target_amount
    }

    pub fn current_amount(&self) -> u64 {
        self.current_amount
    }

    pub fn deadline(&self) -> NaiveDate {
        self.deadline
    }

    pub fn saving_frequency(&self) -> SavingFrequency {
        self.saving_frequency
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_completed(&self) -> bool {
        self.target_amount > 0 && self.current_amount >= self.target_amount
    }

    /// Progress towards the target, rounded to two decimal places.
    pub fn progress_percentage(&self) -> Decimal {
        if self.target_amount == 0 {
            return Decimal::ZERO;
        }
        (Decimal::from(self.current_amount) * Decimal::ONE_HUNDRED
            / Decimal::from(self.target_amount))
        .round_dp(2)
    }

    /// Returns the milestones this credit newly achieved.
    pub(crate) fn credit(&mut self, amount: u64) -> DomainResult<Vec<Milestone>> {
        self.current_amount = self
            .current_amount
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant("goal balance overflow"))?;

        let mut reached = Vec::new();
        for milestone in self.milestones.iter_mut() {
            if !milestone.achieved && milestone.amount <= self.current_amount {
                milestone.achieved = true;
                reached.push(milestone.clone());
            }
        }

        if self.is_completed() {
            self.active = false;
        }
        Ok(reached)
    }

    pub(crate) fn debit(&mut self, amount: u64) -> DomainResult<()> {
        if amount > self.current_amount {
            return Err(DomainError::insufficient_funds(self.current_amount, amount));
        }
        self.current_amount -= amount;
        Ok(())
    }
}

impl Entity for Goal {
    type Id = GoalId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

fn generate_milestones(
    target: u64,
    start: NaiveDate,
    deadline: NaiveDate,
    frequency: SavingFrequency,
) -> Vec<Milestone> {
    let total_days = (deadline - start).num_days();
    if total_days <= 0 || target == 0 {
        return Vec::new();
    }

    let interval = frequency.interval_days(total_days);
    let count = (total_days / interval).max(1) as u64;

    (1..=count)
        .map(|i| Milestone {
            amount: ((target as u128 * i as u128) / count as u128) as u64,
            date: (start + Duration::days(interval * i as i64)).min(deadline),
            achieved: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn goal(target: u64, days: i64, frequency: SavingFrequency) -> Goal {
        let start = date(2024, 1, 1);
        Goal::create(
            GoalId::new(),
            AccountId::new(),
            "School fees",
            target,
            start,
            start + Duration::days(days),
            frequency,
        )
        .unwrap()
    }

    #[test]
    fn weekly_milestones_step_evenly_to_target() {
        let goal = goal(4_000, 28, SavingFrequency::Weekly);
        let amounts: Vec<u64> = goal.milestones().iter().map(|m| m.amount).collect();
        assert_eq!(amounts, vec![1_000, 2_000, 3_000, 4_000]);
        assert_eq!(goal.milestones()[0].date, date(2024, 1, 8));
        assert_eq!(goal.milestones()[3].date, date(2024, 1, 29));
    }

    #[test]
    fn once_yields_single_milestone_at_deadline() {
        let goal = goal(10_000, 90, SavingFrequency::Once);
        assert_eq!(goal.milestones().len(), 1);
        assert_eq!(goal.milestones()[0].amount, 10_000);
        assert_eq!(goal.milestones()[0].date, goal.deadline());
    }

    #[test]
    fn zero_length_goal_has_no_milestones() {
        let goal = goal(10_000, 0, SavingFrequency::Daily);
        assert!(goal.milestones().is_empty());
    }

    #[test]
    fn credits_mark_milestones_and_complete_goal() {
        let mut goal = goal(4_000, 28, SavingFrequency::Weekly);

        let reached = goal.credit(2_500).unwrap();
        assert_eq!(reached.len(), 2);
        assert_eq!(goal.progress_percentage(), dec!(62.50));
        assert!(goal.is_active());

        let reached = goal.credit(1_500).unwrap();
        assert_eq!(reached.len(), 2);
        assert!(goal.is_completed());
        assert!(!goal.is_active());
    }

    #[test]
    fn debit_cannot_overdraw_goal() {
        let mut goal = goal(4_000, 28, SavingFrequency::Weekly);
        goal.credit(100).unwrap();
        assert_eq!(
            goal.debit(101).unwrap_err(),
            DomainError::insufficient_funds(100, 101)
        );
    }

    #[test]
    fn deadline_before_start_is_rejected() {
        let start = date(2024, 6, 1);
        let err = Goal::create(
            GoalId::new(),
            AccountId::new(),
            "Car",
            1,
            start,
            date(2024, 5, 1),
            SavingFrequency::Monthly,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    proptest! {
        #[test]
        fn last_milestone_always_equals_target(target in 1u64..10_000_000, days in 1i64..800) {
            for frequency in [
                SavingFrequency::Daily,
                SavingFrequency::Weekly,
                SavingFrequency::Monthly,
                SavingFrequency::Once,
            ] {
                let goal = goal(target, days, frequency);
                let milestones = goal.milestones();
                prop_assert_eq!(milestones.last().map(|m| m.amount), Some(target));
                prop_assert!(milestones.windows(2).all(|w| w[0].amount <= w[1].amount));
            }
        }
    }
}
