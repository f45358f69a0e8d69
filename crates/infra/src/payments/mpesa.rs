//! M-Pesa adapter.
//!
//! The HTTP client lives behind [`MpesaGateway`]; this module only decides which rail a
//! transaction uses, keeps the ledger informed and hands callbacks to settlement.
//!
//! ```text
//! initiate_payment
//!   → create pending transaction (validated)
//!   → stk_push (money in) | b2c_payment (money out)
//!       ├─ accepted → store correlation ids, status processing
//!       └─ refused  → transaction failed, ProviderError::Rail
//!
//! initiate_refund → refund transaction → reversal of the original payout
//!
//! handle_callback → CallbackPayload → apply_provider_update → settle
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use sacco_core::DomainError;
use sacco_events::EventBus;
use sacco_ledger::{
    NewTransaction, PaymentMethod, ProviderRef, Transaction, TransactionId, TransactionKind,
    TransactionStatus,
};

use super::callback::CallbackPayload;
use super::provider::{Payer, PaymentProvider, ProviderError};
use crate::audit_trail::AuditSink;
use crate::service::{LedgerEnvelope, LedgerError, LedgerService};
use crate::store::{EntityKey, LedgerStore, LedgerStoreExt};

/// Ids returned when the rail accepts a request.
///
/// B2C and reversal requests report their `ConversationID` as `merchant_request_id`; their
/// result callbacks carry it back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayAck {
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub transaction_id: Option<String>,
}

impl GatewayAck {
    fn into_provider_ref(self) -> ProviderRef {
        ProviderRef {
            checkout_request_id: self.checkout_request_id,
            merchant_request_id: self.merchant_request_id,
            provider_transaction_id: self.transaction_id,
            ..ProviderRef::default()
        }
    }
}

/// The M-Pesa API surface the adapter needs.
#[async_trait]
pub trait MpesaGateway: Send + Sync {
    /// Customer-to-business prompt on the payer's phone.
    async fn stk_push(
        &self,
        phone_number: &str,
        amount: u64,
        account_reference: &str,
        description: &str,
    ) -> Result<GatewayAck, ProviderError>;

    /// Business-to-customer payout.
    async fn b2c_payment(
        &self,
        phone_number: &str,
        amount: u64,
        remarks: &str,
        occasion: &str,
    ) -> Result<GatewayAck, ProviderError>;

    /// Reverse a completed payout, identified by its receipt.
    async fn reversal(
        &self,
        receipt: &str,
        amount: u64,
        remarks: &str,
    ) -> Result<GatewayAck, ProviderError>;
}

#[async_trait]
impl<G> MpesaGateway for Arc<G>
where
    G: MpesaGateway + ?Sized,
{
    async fn stk_push(
        &self,
        phone_number: &str,
        amount: u64,
        account_reference: &str,
        description: &str,
    ) -> Result<GatewayAck, ProviderError> {
        (**self)
            .stk_push(phone_number, amount, account_reference, description)
            .await
    }

    async fn b2c_payment(
        &self,
        phone_number: &str,
        amount: u64,
        remarks: &str,
        occasion: &str,
    ) -> Result<GatewayAck, ProviderError> {
        (**self)
            .b2c_payment(phone_number, amount, remarks, occasion)
            .await
    }

    async fn reversal(
        &self,
        receipt: &str,
        amount: u64,
        remarks: &str,
    ) -> Result<GatewayAck, ProviderError> {
        (**self).reversal(receipt, amount, remarks).await
    }
}

/// Which rail call starts a transaction.
#[derive(Debug, Copy, Clone)]
enum Request<'a> {
    StkPush,
    B2c { occasion: &'a str },
    Reversal { receipt: &'a str },
}

/// Normalise a Kenyan MSISDN to `2547XXXXXXXX` / `2541XXXXXXXX`.
pub fn normalize_phone(raw: &str) -> Result<String, ProviderError> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '+'))
        .collect();
    let national = digits
        .strip_prefix("254")
        .or_else(|| digits.strip_prefix('0'))
        .unwrap_or(&digits);

    let valid = national.len() == 9
        && national.starts_with(['7', '1'])
        && national.chars().all(|c| c.is_ascii_digit());
    if !valid {
        return Err(ProviderError::InvalidPhoneNumber(raw.to_string()));
    }
    Ok(format!("254{national}"))
}

pub struct MpesaProvider<G, S, A, B> {
    gateway: G,
    ledger: Arc<LedgerService<S, A, B>>,
}

impl<G, S, A, B> MpesaProvider<G, S, A, B>
where
    G: MpesaGateway,
    S: LedgerStore + Clone,
    A: AuditSink,
    B: EventBus<LedgerEnvelope>,
{
    pub fn new(gateway: G, ledger: Arc<LedgerService<S, A, B>>) -> Self {
        Self { gateway, ledger }
    }

    /// Start the rail request for a recorded transaction; a refusal fails it.
    async fn dispatch(
        &self,
        tx: Transaction,
        phone: &str,
        request: Request<'_>,
        now: DateTime<Utc>,
    ) -> Result<Transaction, ProviderError> {
        let ack = match request {
            Request::StkPush => {
                self.gateway
                    .stk_push(phone, tx.amount(), tx.id().as_str(), tx.description())
                    .await
            }
            Request::B2c { occasion } => {
                self.gateway
                    .b2c_payment(phone, tx.amount(), tx.description(), occasion)
                    .await
            }
            Request::Reversal { receipt } => {
                self.gateway
                    .reversal(receipt, tx.amount(), tx.description())
                    .await
            }
        };

        match ack {
            Ok(ack) => {
                let tx = self
                    .ledger
                    .record_initiation(tx.id(), ack.into_provider_ref(), now)
                    .await?;
                info!(transaction_id = %tx.id(), request = ?request, "m-pesa request accepted");
                Ok(tx)
            }
            Err(err) => {
                warn!(transaction_id = %tx.id(), error = %err, "m-pesa request refused");
                self.ledger
                    .fail_transaction(tx.id(), &err.to_string(), now)
                    .await?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<G, S, A, B> PaymentProvider for MpesaProvider<G, S, A, B>
where
    G: MpesaGateway,
    S: LedgerStore + Clone,
    A: AuditSink,
    B: EventBus<LedgerEnvelope>,
{
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Mpesa
    }

    #[instrument(skip(self, destination, description, payer), fields(kind = destination.transaction_type().as_str()))]
    async fn initiate_payment(
        &self,
        destination: TransactionKind,
        amount: u64,
        description: &str,
        payer: &Payer,
        now: DateTime<Utc>,
    ) -> Result<Transaction, ProviderError> {
        if let TransactionKind::Transfer { .. } = destination {
            return Err(ProviderError::NotExternal(
                destination.transaction_type().as_str(),
            ));
        }
        let phone = normalize_phone(&payer.phone_number)?;
        let outbound = destination.debited().is_some();

        let mut req = NewTransaction::new(destination, amount, PaymentMethod::Mpesa)
            .described(description)
            .with_provider(ProviderRef {
                phone_number: Some(phone.clone()),
                ..ProviderRef::default()
            });
        req.initiated_by = payer.user;

        let tx = self.ledger.create_transaction(req, now).await?;
        let request = if outbound {
            Request::B2c {
                occasion: "Withdrawal",
            }
        } else {
            Request::StkPush
        };
        self.dispatch(tx, &phone, request, now).await
    }

    #[instrument(skip(self, payload))]
    async fn handle_callback(
        &self,
        payload: &JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Transaction, ProviderError> {
        let callback = CallbackPayload::from_json(payload)?;

        for id in &callback.correlation_ids {
            if self.ledger.store().find_by_correlation(id).await.map_err(LedgerError::from)?.is_some() {
                return Ok(self
                    .ledger
                    .apply_provider_update(id, &callback.result, now)
                    .await?);
            }
        }

        warn!(ids = ?callback.correlation_ids, "callback matches no transaction");
        Err(ProviderError::UnknownCorrelation(callback.correlation_ids))
    }

    /// Refund a settled M-Pesa withdrawal: the payout is reversed on the rail and, once
    /// the reversal is confirmed, the refund credits the member account.
    #[instrument(skip(self, destination), fields(original = %original))]
    async fn initiate_refund(
        &self,
        original: &TransactionId,
        amount: u64,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction, ProviderError> {
        let phone = normalize_phone(destination)?;
        let paid: Transaction = self
            .ledger
            .store()
            .load(&EntityKey::Transaction(original.clone()))
            .await
            .map_err(LedgerError::from)?;

        let account = match paid.kind() {
            TransactionKind::Withdraw { account } if paid.payment_method() == PaymentMethod::Mpesa => {
                *account
            }
            other => return Err(ProviderError::NotExternal(other.transaction_type().as_str())),
        };
        if !paid.is_processed() {
            return Err(refusal(format!(
                "transaction {original} is not settled and cannot be refunded"
            )));
        }
        let already = self.ledger.refunded_amount(original).await?;
        if already.saturating_add(amount) > paid.amount() {
            return Err(refusal(format!(
                "refund of {amount} exceeds what is left of the original amount {} ({already} already refunded)",
                paid.amount()
            )));
        }
        let Some(receipt) = paid.provider().provider_transaction_id.clone() else {
            return Err(refusal(format!("transaction {original} has no provider receipt")));
        };

        let req = NewTransaction::new(
            TransactionKind::Refund {
                account,
                original: Some(original.clone()),
            },
            amount,
            PaymentMethod::Mpesa,
        )
        .described(format!("Refund for transaction {original}"))
        .with_provider(ProviderRef {
            phone_number: Some(phone.clone()),
            ..ProviderRef::default()
        });

        let tx = self.ledger.create_transaction(req, now).await?;

        // Concurrent requests each see the others' rows once inserted; whichever counts
        // past the original amount fails its own refund before touching the rail.
        let claimed = self.ledger.refunded_amount(original).await?;
        if claimed > paid.amount() {
            let reason = format!(
                "refunds of {claimed} would exceed the original amount {}",
                paid.amount()
            );
            self.ledger.fail_transaction(tx.id(), &reason, now).await?;
            return Err(refusal(reason));
        }

        self.dispatch(tx, &phone, Request::Reversal { receipt: &receipt }, now)
            .await
    }
}

fn refusal(msg: String) -> ProviderError {
    LedgerError::from(DomainError::validation(msg)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use sacco_core::{Entity, UserId};
    use sacco_events::InMemoryEventBus;
    use sacco_ledger::{Account, KycRecord};
    use serde_json::json;

    use crate::audit_trail::InMemoryAuditSink;
    use crate::config::LedgerConfig;
    use crate::store::InMemoryLedgerStore;

    #[derive(Default)]
    struct FakeGateway {
        refuse: bool,
        calls: Mutex<Vec<(&'static str, String, u64)>>,
    }

    #[async_trait]
    impl MpesaGateway for FakeGateway {
        async fn stk_push(
            &self,
            phone_number: &str,
            amount: u64,
            _account_reference: &str,
            _description: &str,
        ) -> Result<GatewayAck, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push(("stk", phone_number.to_string(), amount));
            if self.refuse {
                return Err(ProviderError::Rail("Invalid Access Token".to_string()));
            }
            Ok(GatewayAck {
                checkout_request_id: Some("ws_CO_191220191020363925".to_string()),
                merchant_request_id: Some("29115-34620561-1".to_string()),
                transaction_id: None,
            })
        }

        async fn b2c_payment(
            &self,
            phone_number: &str,
            amount: u64,
            _remarks: &str,
            _occasion: &str,
        ) -> Result<GatewayAck, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push(("b2c", phone_number.to_string(), amount));
            if self.refuse {
                return Err(ProviderError::Rail("Insufficient float".to_string()));
            }
            Ok(GatewayAck {
                merchant_request_id: Some("AG_20191219_00004e48cf7e3533f581".to_string()),
                ..GatewayAck::default()
            })
        }

        async fn reversal(
            &self,
            receipt: &str,
            amount: u64,
            _remarks: &str,
        ) -> Result<GatewayAck, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push(("reversal", receipt.to_string(), amount));
            Ok(GatewayAck {
                merchant_request_id: Some("AG_20191219_reversal".to_string()),
                ..GatewayAck::default()
            })
        }
    }

    type Store = Arc<InMemoryLedgerStore>;
    type Sink = Arc<InMemoryAuditSink>;
    type Bus = Arc<InMemoryEventBus<LedgerEnvelope>>;
    type Provider = MpesaProvider<Arc<FakeGateway>, Store, Sink, Bus>;

    async fn setup(refuse: bool) -> (Provider, Arc<FakeGateway>, Account) {
        let ledger = Arc::new(LedgerService::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryAuditSink::new()),
            Arc::new(InMemoryEventBus::new()),
            LedgerConfig::default(),
        ));
        let kyc = KycRecord {
            user: UserId::new(),
            full_name: "Mutua Musyoka".to_string(),
            id_number: "31415926".to_string(),
            confirmed: true,
            submitted_at: Utc::now(),
        };
        let account = ledger.open_account(&kyc, Utc::now()).await.unwrap();
        let gateway = Arc::new(FakeGateway {
            refuse,
            ..FakeGateway::default()
        });
        (MpesaProvider::new(gateway.clone(), ledger), gateway, account)
    }

    fn payer(account: &Account) -> Payer {
        Payer {
            user: Some(account.owner()),
            phone_number: "0708 374 149".to_string(),
        }
    }

    #[test]
    fn phone_numbers_normalise_to_international_form() {
        assert_eq!(normalize_phone("0708374149").unwrap(), "254708374149");
        assert_eq!(normalize_phone("+254 708-374-149").unwrap(), "254708374149");
        assert_eq!(normalize_phone("0110123456").unwrap(), "254110123456");
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("0808374149").is_err());
    }

    #[tokio::test]
    async fn deposit_goes_through_stk_and_settles_on_callback() {
        let (provider, gateway, account) = setup(false).await;

        let tx = provider
            .initiate_payment(
                TransactionKind::Deposit {
                    account: *account.id(),
                },
                1_500,
                "Monthly savings",
                &payer(&account),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(tx.status(), TransactionStatus::Processing);
        assert_eq!(
            gateway.calls.lock().unwrap().as_slice(),
            &[("stk", "254708374149".to_string(), 1_500)]
        );

        let callback = json!({
            "Body": { "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": { "Item": [
                    { "Name": "Amount", "Value": 1500 },
                    { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" }
                ]}
            }}
        });
        let settled = provider.handle_callback(&callback, Utc::now()).await.unwrap();

        assert!(settled.is_processed());
        let stored: Account = provider
            .ledger
            .store()
            .load(&EntityKey::Account(*account.id()))
            .await
            .unwrap();
        assert_eq!(stored.balance(), 1_500);
    }

    #[tokio::test]
    async fn refused_request_leaves_transaction_failed() {
        let (provider, _, account) = setup(true).await;

        let err = provider
            .initiate_payment(
                TransactionKind::Deposit {
                    account: *account.id(),
                },
                500,
                "Top up",
                &payer(&account),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rail(_)));

        let stored: Vec<Transaction> = provider
            .ledger
            .store()
            .list_as(crate::store::RowKind::Transaction)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status(), TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn withdrawal_is_validated_before_the_rail_is_called() {
        let (provider, gateway, account) = setup(false).await;

        let err = provider
            .initiate_payment(
                TransactionKind::Withdraw {
                    account: *account.id(),
                },
                500,
                "Cash out",
                &payer(&account),
                Utc::now(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Ledger(ref e) if e.is_insufficient_funds()));
        assert!(gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transfers_are_not_external() {
        let (provider, _, account) = setup(false).await;
        let err = provider
            .initiate_payment(
                TransactionKind::Transfer {
                    from: sacco_ledger::Endpoint::Account(*account.id()),
                    to: sacco_ledger::Endpoint::Account(sacco_core::AccountId::new()),
                },
                100,
                "Move",
                &payer(&account),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotExternal("transfer")));
    }

    #[tokio::test]
    async fn unknown_callback_ids_are_reported() {
        let (provider, _, _) = setup(false).await;
        let callback = json!({
            "Result": { "ResultCode": 0, "ResultDesc": "ok", "TransactionID": "UNKNOWN1" }
        });

        let err = provider.handle_callback(&callback, Utc::now()).await.unwrap_err();
        assert!(matches!(err, ProviderError::UnknownCorrelation(ids) if ids == vec!["UNKNOWN1".to_string()]));
    }

    #[tokio::test]
    async fn refund_reverses_a_settled_withdrawal() {
        let (provider, gateway, account) = setup(false).await;
        let ledger = provider.ledger.clone();
        ledger
            .create_transaction(
                NewTransaction::new(
                    TransactionKind::Deposit {
                        account: *account.id(),
                    },
                    1_000,
                    PaymentMethod::InHouse,
                ),
                Utc::now(),
            )
            .await
            .unwrap();

        let withdrawal = provider
            .initiate_payment(
                TransactionKind::Withdraw {
                    account: *account.id(),
                },
                400,
                "Cash out",
                &payer(&account),
                Utc::now(),
            )
            .await
            .unwrap();
        let payout = json!({ "Result": {
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "ConversationID": "AG_20191219_00004e48cf7e3533f581",
            "TransactionID": "NLJ41HAY6Q",
            "ResultParameters": { "ResultParameter": [
                { "Key": "TransactionReceipt", "Value": "NLJ41HAY6Q" },
                { "Key": "TransactionAmount", "Value": 400 }
            ]}
        }});
        provider.handle_callback(&payout, Utc::now()).await.unwrap();

        let refund = provider
            .initiate_refund(withdrawal.id(), 400, "0708374149", Utc::now())
            .await
            .unwrap();
        assert_eq!(refund.status(), TransactionStatus::Processing);
        assert!(
            gateway
                .calls
                .lock()
                .unwrap()
                .contains(&("reversal", "NLJ41HAY6Q".to_string(), 400))
        );

        let reversed = json!({ "Result": {
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "ConversationID": "AG_20191219_reversal",
            "TransactionID": "NLJ51REV0Q"
        }});
        let settled = provider.handle_callback(&reversed, Utc::now()).await.unwrap();
        assert!(settled.is_processed());

        let stored: Account = ledger
            .store()
            .load(&EntityKey::Account(*account.id()))
            .await
            .unwrap();
        assert_eq!(stored.balance(), 1_000);
    }

    /// Fund the account with 1000 in-house, then withdraw 400 over B2C and confirm it.
    async fn settled_withdrawal(provider: &Provider, account: &Account) -> Transaction {
        provider
            .ledger
            .create_transaction(
                NewTransaction::new(
                    TransactionKind::Deposit {
                        account: *account.id(),
                    },
                    1_000,
                    PaymentMethod::InHouse,
                ),
                Utc::now(),
            )
            .await
            .unwrap();
        let withdrawal = provider
            .initiate_payment(
                TransactionKind::Withdraw {
                    account: *account.id(),
                },
                400,
                "Cash out",
                &payer(account),
                Utc::now(),
            )
            .await
            .unwrap();
        let payout = json!({ "Result": {
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "ConversationID": "AG_20191219_00004e48cf7e3533f581",
            "TransactionID": "NLJ41HAY6Q",
            "ResultParameters": { "ResultParameter": [
                { "Key": "TransactionReceipt", "Value": "NLJ41HAY6Q" },
                { "Key": "TransactionAmount", "Value": 400 }
            ]}
        }});
        provider.handle_callback(&payout, Utc::now()).await.unwrap();
        withdrawal
    }

    fn reversals(gateway: &FakeGateway) -> usize {
        gateway
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(call, ..)| *call == "reversal")
            .count()
    }

    #[tokio::test]
    async fn refunds_never_add_up_past_the_withdrawal() {
        let (provider, gateway, account) = setup(false).await;
        let withdrawal = settled_withdrawal(&provider, &account).await;

        provider
            .initiate_refund(withdrawal.id(), 250, "0708374149", Utc::now())
            .await
            .unwrap();
        // the first refund is still unconfirmed, and it already counts
        let err = provider
            .initiate_refund(withdrawal.id(), 200, "0708374149", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Ledger(LedgerError::Domain(DomainError::Validation(_)))
        ));
        assert_eq!(reversals(&gateway), 1);

        let reversed = json!({ "Result": {
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "ConversationID": "AG_20191219_reversal",
            "TransactionID": "NLJ51REV0Q"
        }});
        provider.handle_callback(&reversed, Utc::now()).await.unwrap();

        provider
            .initiate_refund(withdrawal.id(), 150, "0708374149", Utc::now())
            .await
            .unwrap();
        assert!(
            provider
                .initiate_refund(withdrawal.id(), 1, "0708374149", Utc::now())
                .await
                .is_err()
        );
        assert!(
            provider
                .initiate_refund(withdrawal.id(), 400, "0708374149", Utc::now())
                .await
                .is_err()
        );

        assert_eq!(reversals(&gateway), 2);
        assert_eq!(provider.ledger.refunded_amount(withdrawal.id()).await.unwrap(), 400);
        let stored: Account = provider
            .ledger
            .store()
            .load(&EntityKey::Account(*account.id()))
            .await
            .unwrap();
        assert_eq!(stored.balance(), 850);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_full_refunds_reverse_at_most_once() {
        let (provider, gateway, account) = setup(false).await;
        let withdrawal = settled_withdrawal(&provider, &account).await;
        let provider = Arc::new(provider);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            let id = withdrawal.id().clone();
            handles.push(tokio::spawn(async move {
                provider
                    .initiate_refund(&id, 400, "0708374149", Utc::now())
                    .await
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }

        assert!(accepted <= 1);
        assert_eq!(reversals(&gateway), accepted);
        assert!(provider.ledger.refunded_amount(withdrawal.id()).await.unwrap() <= 400);
    }
}
