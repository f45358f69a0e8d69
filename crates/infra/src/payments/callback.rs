//! Provider callback parsing.
//!
//! Two M-Pesa shapes arrive on the callback endpoint:
//!
//! - STK push (money in): `Body.stkCallback` with `CallbackMetadata.Item[] {Name, Value}`
//! - B2C (money out): `Result` with `ResultParameters.ResultParameter[] {Key, Value}`
//!
//! Metadata entries may be missing, reordered or carry no `Value`; only the result code
//! and at least one correlation id are required.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use sacco_ledger::ProviderResult;

use super::provider::ProviderError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallbackShape {
    StkPush,
    B2c,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallbackPayload {
    pub shape: CallbackShape,
    /// Candidate correlation ids, most specific first.
    pub correlation_ids: Vec<String>,
    pub result: ProviderResult,
    pub metadata: BTreeMap<String, JsonValue>,
}

impl CallbackPayload {
    pub fn from_json(body: &JsonValue) -> Result<Self, ProviderError> {
        if let Some(stk) = body.pointer("/Body/stkCallback") {
            return Self::from_stk(stk);
        }
        if let Some(result) = body.get("Result") {
            return Self::from_b2c(result);
        }
        Err(ProviderError::MalformedCallback(
            "expected Body.stkCallback or Result".to_string(),
        ))
    }

    fn from_stk(callback: &JsonValue) -> Result<Self, ProviderError> {
        let correlation_ids = ids(callback, &["CheckoutRequestID", "MerchantRequestID"])?;
        let metadata = collect(callback.pointer("/CallbackMetadata/Item"), "Name");
        let result_code = result_code(callback)?;

        let result = ProviderResult {
            result_code,
            result_desc: desc(callback),
            provider_transaction_id: metadata.get("MpesaReceiptNumber").and_then(text),
            phone_number: metadata.get("PhoneNumber").and_then(text),
            amount: success_amount(result_code, metadata.get("Amount")),
        };
        Ok(Self {
            shape: CallbackShape::StkPush,
            correlation_ids,
            result,
            metadata,
        })
    }

    fn from_b2c(callback: &JsonValue) -> Result<Self, ProviderError> {
        let correlation_ids = ids(
            callback,
            &["TransactionID", "ConversationID", "OriginatorConversationID"],
        )?;
        let metadata = collect(callback.pointer("/ResultParameters/ResultParameter"), "Key");
        let result_code = result_code(callback)?;

        // "254708374149 - John Doe"
        let phone_number = metadata
            .get("ReceiverPartyPublicName")
            .and_then(text)
            .and_then(|name| name.split(" - ").next().map(|p| p.trim().to_string()))
            .filter(|p| !p.is_empty());

        let result = ProviderResult {
            result_code,
            result_desc: desc(callback),
            provider_transaction_id: metadata
                .get("TransactionReceipt")
                .and_then(text)
                .or_else(|| callback.get("TransactionID").and_then(text)),
            phone_number,
            amount: success_amount(result_code, metadata.get("TransactionAmount")),
        };
        Ok(Self {
            shape: CallbackShape::B2c,
            correlation_ids,
            result,
            metadata,
        })
    }
}

fn ids(callback: &JsonValue, keys: &[&str]) -> Result<Vec<String>, ProviderError> {
    let found: Vec<String> = keys
        .iter()
        .filter_map(|key| callback.get(*key).and_then(text))
        .filter(|id| !id.is_empty())
        .collect();
    if found.is_empty() {
        return Err(ProviderError::MalformedCallback(format!(
            "missing correlation id (one of {})",
            keys.join(", ")
        )));
    }
    Ok(found)
}

fn result_code(callback: &JsonValue) -> Result<i64, ProviderError> {
    let raw = callback
        .get("ResultCode")
        .ok_or_else(|| ProviderError::MalformedCallback("missing ResultCode".to_string()))?;
    raw.as_i64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| ProviderError::MalformedCallback(format!("invalid ResultCode {raw}")))
}

fn desc(callback: &JsonValue) -> String {
    callback
        .get("ResultDesc")
        .and_then(text)
        .unwrap_or_default()
}

fn collect(items: Option<&JsonValue>, name_field: &str) -> BTreeMap<String, JsonValue> {
    items
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| {
            let name = item.get(name_field)?.as_str()?;
            let value = item.get("Value")?;
            Some((name.to_string(), value.clone()))
        })
        .collect()
}

fn text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Amounts are only trusted on success, and only when they are whole units.
fn success_amount(result_code: i64, value: Option<&JsonValue>) -> Option<u64> {
    if result_code != 0 {
        return None;
    }
    let value = value?;
    value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        })
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stk_success_reads_metadata_in_any_order() {
        let body = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "PhoneNumber", "Value": 254708374149u64 },
                            { "Name": "Balance" },
                            { "Name": "TransactionDate", "Value": 20191219102115u64 },
                            { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                            { "Name": "Amount", "Value": 1.00 }
                        ]
                    }
                }
            }
        });

        let payload = CallbackPayload::from_json(&body).unwrap();
        assert_eq!(payload.shape, CallbackShape::StkPush);
        assert_eq!(
            payload.correlation_ids,
            vec!["ws_CO_191220191020363925", "29115-34620561-1"]
        );
        assert!(payload.result.is_success());
        assert_eq!(payload.result.amount, Some(1));
        assert_eq!(
            payload.result.provider_transaction_id.as_deref(),
            Some("NLJ7RT61SV")
        );
        assert_eq!(payload.result.phone_number.as_deref(), Some("254708374149"));
        assert!(!payload.metadata.contains_key("Balance"));
    }

    #[test]
    fn stk_cancellation_has_no_metadata() {
        let body = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "8555-67195-1",
                    "CheckoutRequestID": "ws_CO_27072017151044001",
                    "ResultCode": 1032,
                    "ResultDesc": "[STK_CB - ]Request cancelled by user"
                }
            }
        });

        let payload = CallbackPayload::from_json(&body).unwrap();
        assert!(!payload.result.is_success());
        assert_eq!(payload.result.amount, None);
        assert_eq!(payload.result.result_desc, "[STK_CB - ]Request cancelled by user");
    }

    #[test]
    fn b2c_result_uses_keyed_parameters() {
        let body = json!({
            "Result": {
                "ResultType": 0,
                "ResultCode": "0",
                "ResultDesc": "The service request is processed successfully.",
                "OriginatorConversationID": "10571-7910404-1",
                "ConversationID": "AG_20191219_00004e48cf7e3533f581",
                "TransactionID": "NLJ41HAY6Q",
                "ResultParameters": {
                    "ResultParameter": [
                        { "Key": "TransactionAmount", "Value": 10 },
                        { "Key": "TransactionReceipt", "Value": "NLJ41HAY6Q" },
                        { "Key": "ReceiverPartyPublicName", "Value": "254708374149 - John Doe" },
                        { "Key": "TransactionCompletedDateTime", "Value": "19.12.2019 11:45:50" }
                    ]
                }
            }
        });

        let payload = CallbackPayload::from_json(&body).unwrap();
        assert_eq!(payload.shape, CallbackShape::B2c);
        assert_eq!(payload.correlation_ids[0], "NLJ41HAY6Q");
        assert_eq!(payload.result.result_code, 0);
        assert_eq!(payload.result.amount, Some(10));
        assert_eq!(payload.result.phone_number.as_deref(), Some("254708374149"));
    }

    #[test]
    fn payload_without_ids_or_code_is_malformed() {
        let no_ids = json!({ "Body": { "stkCallback": { "ResultCode": 0 } } });
        let no_code = json!({ "Result": { "TransactionID": "NLJ41HAY6Q" } });

        assert!(matches!(
            CallbackPayload::from_json(&no_ids),
            Err(ProviderError::MalformedCallback(_))
        ));
        assert!(matches!(
            CallbackPayload::from_json(&no_code),
            Err(ProviderError::MalformedCallback(_))
        ));
        assert!(CallbackPayload::from_json(&json!({})).is_err());
    }
}
