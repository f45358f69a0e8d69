//! Ledger service: the explicit `validate → settle → audit → notify` pipeline.
//!
//! Every balance-affecting entry point runs the same ordered steps:
//!
//! 1. **validate**: business rules checked against copies of the referenced rows
//! 2. **persist / settle**: the store write (and, for completed transactions, settlement)
//! 3. **audit**: field diff rows, best-effort
//! 4. **notify**: ledger events published on the bus, best-effort
//!
//! Steps 3 and 4 run only after step 2 committed, and their failures are logged, never
//! propagated.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use sacco_core::{AccountId, DomainError, Entity, GoalId, InvestmentId, InvestmentTypeId, UserId};
use sacco_events::{EventBus, EventEnvelope};
use sacco_ledger::{
    Account, Dividend, DividendShare, EntityRef, Goal, Investment, InvestmentAccount, KycRecord,
    LedgerEvent, NewTransaction, PaymentMethod, ProviderRef, ProviderResult, SavingFrequency, Stake,
    Transaction, TransactionId, TransactionKind, TransactionStatus, UserInvestment, apportion,
};

use crate::audit_trail::{AuditSink, AuditTrail};
use crate::config::LedgerConfig;
use crate::settlement::{
    PostingFailure, Settlement, SettlementEngine, SettlementError, Transition, post,
};
use crate::store::{EntityKey, LedgerStore, LedgerStoreExt, LockedRows, Row, RowKind, StoreError};

/// Service-level error: everything a ledger entry point can report to its caller.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Insufficient funds, whether caught at validation or inside settlement.
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            Self::Domain(DomainError::InsufficientFunds { .. })
                | Self::Settlement(SettlementError::InsufficientFunds { .. })
        )
    }
}

/// Envelope type carried on the ledger bus.
pub type LedgerEnvelope = EventEnvelope<LedgerEvent>;

pub struct LedgerService<S, A, B> {
    store: S,
    engine: SettlementEngine<S>,
    audit: AuditTrail<A>,
    bus: B,
    config: LedgerConfig,
}

impl<S, A, B> LedgerService<S, A, B>
where
    S: LedgerStore + Clone,
    A: AuditSink,
    B: EventBus<LedgerEnvelope>,
{
    pub fn new(store: S, audit: A, bus: B, config: LedgerConfig) -> Self {
        Self {
            engine: SettlementEngine::new(store.clone(), config.minimum_shares_required),
            store,
            audit: AuditTrail::new(audit),
            bus,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn audit(&self) -> &AuditTrail<A> {
        &self.audit
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Onboard a verified member: opens the account and its investment account.
    #[instrument(skip(self, kyc), fields(owner = %kyc.user))]
    pub async fn open_account(
        &self,
        kyc: &KycRecord,
        now: DateTime<Utc>,
    ) -> Result<Account, LedgerError> {
        let already_open =
            || DomainError::conflict(format!("user {} already has an account", kyc.user));
        let existing: Vec<Account> = self.store.list_as(RowKind::Account).await?;
        if existing.iter().any(|a| a.owner() == kyc.user) {
            return Err(already_open().into());
        }

        // The store's owner index settles concurrent opens for the same user.
        let account = Account::open(AccountId::new(), kyc, now)?;
        match self.store.insert(Row::Account(account.clone())).await {
            Err(StoreError::Duplicate(_)) => return Err(already_open().into()),
            other => other?,
        }
        self.store
            .insert(Row::InvestmentAccount(InvestmentAccount::open(
                *account.id(),
                self.config.investment_limit,
            )))
            .await?;

        info!(
            account_id = %account.id(),
            account_number = account.account_number(),
            active = account.is_active(),
            "account opened"
        );
        Ok(account)
    }

    #[instrument(skip(self, name), fields(account_id = %account))]
    pub async fn create_goal(
        &self,
        account: AccountId,
        name: impl Into<String> + Send,
        target_amount: u64,
        start_date: NaiveDate,
        deadline: NaiveDate,
        frequency: SavingFrequency,
    ) -> Result<Goal, LedgerError> {
        self.store
            .load::<Account>(&EntityKey::Account(account))
            .await?;

        let goal = Goal::create(
            GoalId::new(),
            account,
            name,
            target_amount,
            start_date,
            deadline,
            frequency,
        )?;
        self.store.insert(Row::Goal(goal.clone())).await?;

        info!(goal_id = %goal.id(), milestones = goal.milestones().len(), "goal created");
        Ok(goal)
    }

    /// Validate, persist and (for in-house movements) settle a new transaction.
    ///
    /// Returns the transaction as last committed.
    #[instrument(skip(self, req), fields(kind = req.kind.transaction_type().as_str(), amount = req.amount))]
    pub async fn create_transaction(
        &self,
        mut req: NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        if req.payment_method != PaymentMethod::InHouse && req.expiry_date.is_none() {
            req = req.expiring_at(now + self.config.pending_expiry);
        }
        let tx = Transaction::create(req, now)?;

        self.validate(&tx, now).await?;
        self.store.insert(Row::Transaction(tx.clone())).await?;
        self.audit.record_creation(&tx, tx.initiated_by(), now).await;
        info!(
            transaction_id = %tx.id(),
            status = tx.status().as_str(),
            "transaction recorded"
        );

        if tx.is_settleable() {
            return self.settle(tx.id(), tx.initiated_by(), now).await;
        }
        Ok(tx)
    }

    /// Settle `id` and run the audit/notify steps for whatever it changed.
    ///
    /// Already-processed and not-yet-completed transactions are returned unchanged.
    pub async fn settle(
        &self,
        id: &TransactionId,
        by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        match self.engine.settle(id, now).await {
            Ok(Settlement::Applied { transition, events }) => {
                self.audit
                    .record_change(&transition.before, &transition.after, by, now)
                    .await;
                self.notify(events);
                Ok(transition.after)
            }
            Ok(Settlement::AlreadyProcessed | Settlement::NotSettleable { .. }) => Ok(self
                .store
                .load(&EntityKey::Transaction(id.clone()))
                .await?),
            Err(err) => {
                if let Some(failed) = err.failed_transition() {
                    self.audit
                        .record_change(&failed.before, &failed.after, by, now)
                        .await;
                    self.notify(vec![failed_event(failed, err.to_string(), now)]);
                }
                Err(err.into())
            }
        }
    }

    /// Apply a provider callback to the transaction it correlates with, then settle.
    ///
    /// A callback for a transaction that already reached a terminal status changes
    /// nothing; it re-runs settlement (a no-op once processed) and reports the status.
    #[instrument(skip(self, result), fields(result_code = result.result_code))]
    pub async fn apply_provider_update(
        &self,
        correlation_id: &str,
        result: &ProviderResult,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        let tx = self
            .store
            .find_by_correlation(correlation_id)
            .await?
            .ok_or_else(|| {
                DomainError::validation(format!("no transaction for correlation id {correlation_id}"))
            })?;

        if tx.status().is_terminal() {
            debug!(transaction_id = %tx.id(), status = tx.status().as_str(), "duplicate callback");
            return self.settle(tx.id(), None, now).await;
        }

        let key = EntityKey::Transaction(tx.id().clone());
        let result = result.clone();
        let transition = self
            .store
            .with_locked(&[key.clone()], move |rows| {
                resolve_locked(rows, &key, &result, now)
            })
            .await?;

        if transition.before == transition.after {
            // another callback resolved it first
            return self.settle(transition.after.id(), None, now).await;
        }

        self.audit
            .record_change(&transition.before, &transition.after, None, now)
            .await;

        match transition.after.status() {
            TransactionStatus::Completed => self.settle(transition.after.id(), None, now).await,
            _ => {
                let reason = transition
                    .after
                    .provider()
                    .result_desc
                    .clone()
                    .unwrap_or_else(|| "provider reported failure".to_string());
                warn!(
                    transaction_id = %transition.after.id(),
                    reason = %reason,
                    "transaction failed by provider"
                );
                self.notify(vec![failed_event(&transition, reason, now)]);
                Ok(transition.after)
            }
        }
    }

    /// Fail every unresolved transaction past its expiry date. Returns the ids failed.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<TransactionId>, LedgerError> {
        let stale: Vec<Transaction> = self
            .store
            .list_as::<Transaction>(RowKind::Transaction)
            .await?
            .into_iter()
            .filter(|tx| tx.is_expired(now))
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for tx in stale {
            let key = EntityKey::Transaction(tx.id().clone());
            let scope_key = key.clone();
            let transition = self
                .store
                .with_locked(&[key], move |rows| -> Result<_, LedgerError> {
                    let tx = rows.get_mut::<Transaction>(&scope_key)?;
                    // resolved between the scan and the lock
                    if !tx.is_expired(now) {
                        return Ok(None);
                    }
                    let before = tx.clone();
                    tx.fail(now)?;
                    Ok(Some(Transition {
                        before,
                        after: tx.clone(),
                    }))
                })
                .await?;

            if let Some(transition) = transition {
                self.audit
                    .record_change(&transition.before, &transition.after, None, now)
                    .await;
                self.notify(vec![failed_event(&transition, "expired".to_string(), now)]);
                expired.push(transition.after.id().clone());
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "stale transactions expired");
        }
        Ok(expired)
    }

    /// Store the correlation ids a provider issued on accepting `id`.
    pub async fn record_initiation(
        &self,
        id: &TransactionId,
        issued: ProviderRef,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        let transition = self
            .update_locked(id, move |tx| tx.attach_provider(issued, now))
            .await?;
        self.audit
            .record_change(&transition.before, &transition.after, None, now)
            .await;
        Ok(transition.after)
    }

    /// Fail an unresolved transaction, e.g. when the provider refused to start it.
    pub async fn fail_transaction(
        &self,
        id: &TransactionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction, LedgerError> {
        let transition = self.update_locked(id, move |tx| tx.fail(now)).await?;
        self.audit
            .record_change(&transition.before, &transition.after, None, now)
            .await;
        warn!(transaction_id = %id, reason, "transaction failed");
        self.notify(vec![failed_event(&transition, reason.to_string(), now)]);
        Ok(transition.after)
    }

    async fn update_locked<F>(&self, id: &TransactionId, change: F) -> Result<Transition, LedgerError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), DomainError> + Send + 'static,
    {
        let key = EntityKey::Transaction(id.clone());
        let scope_key = key.clone();
        self.store
            .with_locked(&[key], move |rows| -> Result<_, LedgerError> {
                let tx = rows.get_mut::<Transaction>(&scope_key)?;
                let before = tx.clone();
                change(tx)?;
                Ok(Transition {
                    before,
                    after: tx.clone(),
                })
            })
            .await
    }

    /// Total of the refunds recorded against `original` that have not failed.
    pub async fn refunded_amount(&self, original: &TransactionId) -> Result<u64, LedgerError> {
        Ok(self
            .store
            .list_as::<Transaction>(RowKind::Transaction)
            .await?
            .iter()
            .filter(|tx| tx.status() != TransactionStatus::Failed)
            .filter(|tx| {
                matches!(tx.kind(), TransactionKind::Refund { original: Some(id), .. } if id == original)
            })
            .map(Transaction::amount)
            .sum())
    }

    /// Record a member position in an investment, enforcing the investment limit.
    #[instrument(skip(self), fields(account_id = %account, investment_id = %investment))]
    pub async fn open_position(
        &self,
        account: AccountId,
        investment: InvestmentId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<UserInvestment, LedgerError> {
        let holder = EntityKey::InvestmentAccount(account);
        let product = EntityKey::Investment(investment);
        let keys = [holder.clone(), product.clone()];

        let position = self
            .store
            .with_locked(&keys, move |rows| -> Result<_, LedgerError> {
                let investment: Investment = rows.get(&product)?;
                let ia = rows.get_mut::<InvestmentAccount>(&holder)?;
                Ok(ia.add_position(&investment, amount, now)?.clone())
            })
            .await?;

        info!(amount, "investment position opened");
        Ok(position)
    }

    /// Apportion `pool` across every member's active stake in `investment_type` and
    /// record each member's dividend.
    #[instrument(skip(self), fields(investment_type = %investment_type))]
    pub async fn declare_dividend(
        &self,
        investment_type: InvestmentTypeId,
        pool: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DividendShare>, LedgerError> {
        let stakes: Vec<Stake> = self
            .store
            .list_as::<InvestmentAccount>(RowKind::InvestmentAccount)
            .await?
            .iter()
            .map(|ia| Stake {
                account: *ia.id(),
                invested: ia.stake_in(investment_type),
            })
            .filter(|stake| stake.invested > 0)
            .collect();

        let shares = apportion(pool, &stakes);
        for share in &shares {
            let key = EntityKey::InvestmentAccount(share.account);
            let scope_key = key.clone();
            let dividend = Dividend {
                investment_type,
                amount: share.amount,
                date_distributed: now,
                distributed: true,
            };
            self.store
                .with_locked(&[key], move |rows| -> Result<_, LedgerError> {
                    rows.get_mut::<InvestmentAccount>(&scope_key)?
                        .record_dividend(dividend);
                    Ok(())
                })
                .await?;
        }

        info!(pool, members = shares.len(), "dividend declared");
        Ok(shares)
    }

    /// Publish events; a bus failure is logged and dropped.
    pub(crate) fn notify(&self, events: Vec<LedgerEvent>) {
        for event in events {
            let event_type = sacco_events::Event::event_type(&event);
            if let Err(err) = self.bus.publish(EventEnvelope::wrap(event.subject(), event)) {
                warn!(event_type, error = ?err, "event publish failed");
            }
        }
    }

    /// Dry-run the postings on copies of the referenced rows.
    async fn validate(&self, tx: &Transaction, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut rows = Vec::new();
        for entity in tx.kind().references() {
            let row = self
                .store
                .get(&EntityKey::from(entity))
                .await?
                .ok_or_else(|| DomainError::validation(format!("missing reference {entity}")))?;
            rows.push(row);
        }
        let mut copies = LockedRows::from_rows(rows);

        if let Some(user) = tx.initiated_by() {
            self.authorize(user, tx, &copies).await?;
        }

        match post(&mut copies, tx, &self.engine.context(now)) {
            Ok(_) => Ok(()),
            Err(PostingFailure::Domain(err)) => Err(err.into()),
            Err(PostingFailure::Store(err)) => Err(err.into()),
        }
    }

    /// The initiating user must own the debited account or goal.
    async fn authorize(
        &self,
        user: UserId,
        tx: &Transaction,
        copies: &LockedRows,
    ) -> Result<(), LedgerError> {
        let owner_account = match tx.kind().debited() {
            Some(EntityRef::Account(id)) => id,
            Some(EntityRef::Goal(id)) => copies.get::<Goal>(&EntityKey::Goal(id))?.account(),
            _ => return Ok(()),
        };
        let account: Account = match copies.get(&EntityKey::Account(owner_account)) {
            Ok(account) => account,
            Err(_) => self.store.load(&EntityKey::Account(owner_account)).await?,
        };

        if account.owner() != user {
            warn!(transaction_id = %tx.id(), user = %user, "debit side not owned by initiator");
            return Err(DomainError::Unauthorized.into());
        }
        Ok(())
    }
}

/// Record the provider outcome and resolve the status under the transaction's lock.
fn resolve_locked(
    rows: &mut LockedRows,
    key: &EntityKey,
    result: &ProviderResult,
    now: DateTime<Utc>,
) -> Result<Transition, LedgerError> {
    let tx = rows.get_mut::<Transaction>(key)?;
    let before = tx.clone();
    if before.status().is_terminal() {
        return Ok(Transition {
            after: before.clone(),
            before,
        });
    }

    tx.record_provider_result(result, now)?;
    if result.is_success() && !tx.is_expired(now) {
        tx.complete(now)?;
    } else {
        tx.fail(now)?;
    }
    Ok(Transition {
        before,
        after: tx.clone(),
    })
}

fn failed_event(transition: &Transition, reason: String, at: DateTime<Utc>) -> LedgerEvent {
    LedgerEvent::TransactionFailed {
        transaction_id: transition.after.id().clone(),
        transaction_type: transition.after.transaction_type(),
        previous: transition.before.status(),
        reason,
        at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;
    use sacco_events::InMemoryEventBus;
    use sacco_ledger::{Endpoint, TransactionKind};

    use crate::audit_trail::InMemoryAuditSink;
    use crate::store::InMemoryLedgerStore;

    type Service =
        LedgerService<Arc<InMemoryLedgerStore>, Arc<InMemoryAuditSink>, Arc<InMemoryEventBus<LedgerEnvelope>>>;

    fn service() -> Service {
        LedgerService::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryAuditSink::new()),
            Arc::new(InMemoryEventBus::new()),
            LedgerConfig::default(),
        )
    }

    fn kyc(name: &str) -> KycRecord {
        KycRecord {
            user: UserId::new(),
            full_name: name.to_string(),
            id_number: "30112233".to_string(),
            confirmed: true,
            submitted_at: Utc::now(),
        }
    }

    async fn member_with(service: &Service, balance: u64) -> Account {
        let account = service.open_account(&kyc("Achieng Otieno"), Utc::now()).await.unwrap();
        if balance > 0 {
            service
                .create_transaction(
                    NewTransaction::new(
                        TransactionKind::Deposit {
                            account: *account.id(),
                        },
                        balance,
                        PaymentMethod::InHouse,
                    ),
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        account
    }

    async fn balance(service: &Service, id: AccountId) -> u64 {
        service
            .store()
            .load::<Account>(&EntityKey::Account(id))
            .await
            .unwrap()
            .balance()
    }

    #[tokio::test]
    async fn one_account_per_owner() {
        let service = service();
        let record = kyc("Wanjiru Kamau");
        service.open_account(&record, Utc::now()).await.unwrap();

        let err = service.open_account(&record, Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Conflict(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_opens_for_one_owner_leave_one_account() {
        let service = Arc::new(service());
        let record = kyc("Kiprono Langat");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = service.clone();
            let record = record.clone();
            handles.push(tokio::spawn(async move {
                service.open_account(&record, Utc::now()).await
            }));
        }
        let mut opened = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => opened += 1,
                Err(err) => assert!(matches!(err, LedgerError::Domain(DomainError::Conflict(_)))),
            }
        }

        assert_eq!(opened, 1);
        let accounts: Vec<Account> = service.store().list_as(RowKind::Account).await.unwrap();
        assert_eq!(accounts.len(), 1);
        let positions: Vec<InvestmentAccount> =
            service.store().list_as(RowKind::InvestmentAccount).await.unwrap();
        assert_eq!(positions.len(), 1);
    }

    #[tokio::test]
    async fn validation_rejects_before_anything_is_stored() {
        let service = service();
        let account = member_with(&service, 300).await;

        let err = service
            .create_transaction(
                NewTransaction::new(
                    TransactionKind::Withdraw {
                        account: *account.id(),
                    },
                    500,
                    PaymentMethod::InHouse,
                ),
                Utc::now(),
            )
            .await
            .unwrap_err();

        assert!(err.is_insufficient_funds());
        assert_eq!(balance(&service, *account.id()).await, 300);
        let stored: Vec<Transaction> = service.store().list_as(RowKind::Transaction).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn initiator_must_own_the_debited_account() {
        let service = service();
        let a = member_with(&service, 1_000).await;
        let b = member_with(&service, 0).await;

        let err = service
            .create_transaction(
                NewTransaction::new(
                    TransactionKind::Transfer {
                        from: Endpoint::Account(*a.id()),
                        to: Endpoint::Account(*b.id()),
                    },
                    100,
                    PaymentMethod::InHouse,
                )
                .initiated_by(b.owner()),
                Utc::now(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Domain(DomainError::Unauthorized)));
        assert_eq!(balance(&service, *a.id()).await, 1_000);
    }

    #[tokio::test]
    async fn external_deposit_waits_for_callback() {
        let service = service();
        let account = member_with(&service, 0).await;
        let subscription = service.bus().subscribe();

        let tx = service
            .create_transaction(
                NewTransaction::new(
                    TransactionKind::Deposit {
                        account: *account.id(),
                    },
                    250,
                    PaymentMethod::Mpesa,
                )
                .with_provider(ProviderRef {
                    checkout_request_id: Some("ws_CO_001".to_string()),
                    ..ProviderRef::default()
                }),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(tx.status(), TransactionStatus::Pending);
        assert_eq!(balance(&service, *account.id()).await, 0);

        let result = ProviderResult {
            result_code: 0,
            result_desc: "The service request is processed successfully.".to_string(),
            provider_transaction_id: Some("NLJ7RT61SV".to_string()),
            phone_number: Some("254708374149".to_string()),
            amount: None,
        };
        let settled = service
            .apply_provider_update("ws_CO_001", &result, Utc::now())
            .await
            .unwrap();

        assert!(settled.is_processed());
        assert_eq!(settled.provider().provider_transaction_id.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(balance(&service, *account.id()).await, 250);
        assert!(
            subscription
                .drain()
                .iter()
                .any(|e| e.event_type() == "ledger.transaction.settled")
        );
    }

    #[tokio::test]
    async fn sweep_fails_only_expired_transactions() {
        let service = service();
        let account = member_with(&service, 0).await;
        let now = Utc::now();

        let stale = service
            .create_transaction(
                NewTransaction::new(
                    TransactionKind::Deposit {
                        account: *account.id(),
                    },
                    100,
                    PaymentMethod::Mpesa,
                )
                .expiring_at(now - Duration::hours(1)),
                now - Duration::days(4),
            )
            .await
            .unwrap();
        let fresh = service
            .create_transaction(
                NewTransaction::new(
                    TransactionKind::Deposit {
                        account: *account.id(),
                    },
                    100,
                    PaymentMethod::Mpesa,
                ),
                now,
            )
            .await
            .unwrap();

        let expired = service.expire_stale(now).await.unwrap();
        assert_eq!(expired, vec![stale.id().clone()]);

        let fresh: Transaction = service
            .store()
            .load(&EntityKey::Transaction(fresh.id().clone()))
            .await
            .unwrap();
        assert_eq!(fresh.status(), TransactionStatus::Pending);
        assert!(service.expire_stale(now).await.unwrap().is_empty());
    }
}
