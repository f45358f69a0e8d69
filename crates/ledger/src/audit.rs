//! Field-level change log for transactions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sacco_core::UserId;

use crate::transaction::{Transaction, TransactionId, TransactionType};

/// Old value recorded for every field when a transaction is created.
pub const NOT_APPLICABLE: &str = "N/A";

/// One changed field of one transaction. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTransaction {
    pub id: Uuid,
    pub transaction_id: TransactionId,
    pub transaction_type: TransactionType,
    pub field_name: String,
    pub old_value: String,
    pub new_value: String,
    /// `None` when the change was system-initiated (callbacks, sweeps, settlement).
    pub updated_by: Option<UserId>,
    pub updated_at: DateTime<Utc>,
}

impl AuditTransaction {
    fn entry(
        tx: &Transaction,
        field: &str,
        old_value: String,
        new_value: String,
        by: Option<UserId>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            transaction_id: tx.id().clone(),
            transaction_type: tx.transaction_type(),
            field_name: field.to_string(),
            old_value,
            new_value,
            updated_by: by,
            updated_at: at,
        }
    }
}

/// One entry per field of a newly created transaction.
pub fn creation_entries(
    tx: &Transaction,
    by: Option<UserId>,
    at: DateTime<Utc>,
) -> Vec<AuditTransaction> {
    tx.audit_fields()
        .into_iter()
        .map(|(field, value)| {
            AuditTransaction::entry(tx, field, NOT_APPLICABLE.to_string(), value, by, at)
        })
        .collect()
}

/// One entry per field that differs between the persisted and the new state.
pub fn change_entries(
    before: &Transaction,
    after: &Transaction,
    by: Option<UserId>,
    at: DateTime<Utc>,
) -> Vec<AuditTransaction> {
    before
        .audit_fields()
        .into_iter()
        .zip(after.audit_fields())
        .filter(|((_, old), (_, new))| old != new)
        .map(|((field, old), (_, new))| AuditTransaction::entry(after, field, old, new, by, at))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{NewTransaction, PaymentMethod, TransactionKind};
    use sacco_core::AccountId;

    fn pending_deposit() -> Transaction {
        let req = NewTransaction::new(
            TransactionKind::Deposit {
                account: AccountId::new(),
            },
            2_500,
            PaymentMethod::Mpesa,
        );
        Transaction::create(req, Utc::now()).unwrap()
    }

    #[test]
    fn creation_records_every_field_as_new() {
        let tx = pending_deposit();
        let entries = creation_entries(&tx, None, Utc::now());

        assert_eq!(entries.len(), tx.audit_fields().len());
        assert!(entries.iter().all(|e| e.old_value == NOT_APPLICABLE));
        let amount = entries.iter().find(|e| e.field_name == "amount").unwrap();
        assert_eq!(amount.new_value, "2500");
    }

    #[test]
    fn update_records_only_changed_fields() {
        let before = pending_deposit();
        let mut after = before.clone();
        let user = UserId::new();
        after.complete(Utc::now()).unwrap();

        let entries = change_entries(&before, &after, Some(user), Utc::now());

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field_name, "status");
        assert_eq!(entries[0].old_value, "pending");
        assert_eq!(entries[0].new_value, "completed");
        assert_eq!(entries[0].updated_by, Some(user));
    }

    #[test]
    fn unchanged_transaction_produces_no_entries() {
        let tx = pending_deposit();
        assert!(change_entries(&tx, &tx, None, Utc::now()).is_empty());
    }
}
