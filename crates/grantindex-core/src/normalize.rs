//! Event normalizer — converts raw chain-log records into canonical
//! [`DelegationEvent`] values.
//!
//! Pure, stateless, and strict: anything missing, mis-sized, or negative is
//! a [`NormalizeError`] and the record never enters the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NormalizeError;
use crate::types::{decode_hex, Address, BlockHash, DelegationEvent};

/// A raw delegation log record as delivered by the chain client.
///
/// `payload` carries the ABI-decoded event fields as JSON, the same shape
/// the contract emits: `delegator`, `delegate`, `delegationCounter`,
/// `oldExpiryDate`, `expiryDate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLogRecord {
    #[serde(rename = "hostChainId")]
    pub host_chain_id: u64,
    #[serde(rename = "contractAddress")]
    pub contract_address: String,
    #[serde(rename = "blockNumber")]
    pub block_number: u64,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionId")]
    pub transaction_id: Option<String>,
    pub payload: Value,
}

/// Normalize a raw log record into a canonical event.
pub fn normalize(raw: &RawLogRecord) -> Result<DelegationEvent, NormalizeError> {
    let contract_address = parse_address(&raw.contract_address, "contractAddress")?;
    let block_hash: BlockHash = raw
        .block_hash
        .parse()
        .map_err(|e: String| NormalizeError::new(format!("blockHash: {e}")))?;

    let transaction_id = match &raw.transaction_id {
        None => None,
        Some(s) => Some(
            decode_hex(s).ok_or_else(|| NormalizeError::new(format!("transactionId: invalid hex: {s}")))?,
        ),
    };

    let delegator = parse_address(payload_str(&raw.payload, "delegator")?, "delegator")?;
    let delegate = parse_address(payload_str(&raw.payload, "delegate")?, "delegate")?;
    let delegation_counter = payload_u64(&raw.payload, "delegationCounter")?;
    let old_expiry_date = payload_u64(&raw.payload, "oldExpiryDate")?;
    let expiry_date = payload_u64(&raw.payload, "expiryDate")?;

    Ok(DelegationEvent {
        delegator,
        delegate,
        contract_address,
        host_chain_id: raw.host_chain_id,
        delegation_counter,
        old_expiry_date,
        expiry_date,
        block_number: raw.block_number,
        block_hash,
        transaction_id,
    })
}

fn parse_address(s: &str, field: &str) -> Result<Address, NormalizeError> {
    s.parse()
        .map_err(|e: String| NormalizeError::new(format!("{field}: {e}")))
}

fn payload_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, NormalizeError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| NormalizeError::new(format!("{field}: missing or not a string")))
}

/// Read a non-negative integer payload field. ABI decoders emit small uints
/// as JSON numbers and wide ones as decimal strings; both are accepted.
fn payload_u64(payload: &Value, field: &str) -> Result<u64, NormalizeError> {
    let value = payload
        .get(field)
        .ok_or_else(|| NormalizeError::new(format!("{field}: missing")))?;
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| NormalizeError::new(format!("{field}: negative or non-integer: {n}"))),
        Value::String(s) => s
            .parse::<u64>()
            .map_err(|_| NormalizeError::new(format!("{field}: not a decimal integer: {s}"))),
        other => Err(NormalizeError::new(format!(
            "{field}: unexpected type: {other}"
        ))),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw() -> RawLogRecord {
        RawLogRecord {
            host_chain_id: 31337,
            contract_address: format!("0x{}", "33".repeat(20)),
            block_number: 100,
            block_hash: format!("0x{}", "aa".repeat(32)),
            transaction_id: Some("0xdeadbeef".into()),
            payload: json!({
                "delegator": format!("0x{}", "11".repeat(20)),
                "delegate": format!("0x{}", "22".repeat(20)),
                "delegationCounter": 1,
                "oldExpiryDate": 0,
                "expiryDate": "2000",
            }),
        }
    }

    #[test]
    fn normalize_well_formed_record() {
        let event = normalize(&raw()).unwrap();
        assert_eq!(event.host_chain_id, 31337);
        assert_eq!(event.delegation_counter, 1);
        assert_eq!(event.old_expiry_date, 0);
        assert_eq!(event.expiry_date, 2000); // decimal string accepted
        assert_eq!(event.transaction_id, Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert!(!event.is_revocation());
    }

    #[test]
    fn normalize_missing_payload_field() {
        let mut r = raw();
        r.payload.as_object_mut().unwrap().remove("delegationCounter");
        let err = normalize(&r).unwrap_err();
        assert!(err.reason.contains("delegationCounter"));
    }

    #[test]
    fn normalize_rejects_negative_counter() {
        let mut r = raw();
        r.payload["delegationCounter"] = json!(-1);
        assert!(normalize(&r).is_err());
    }

    #[test]
    fn normalize_rejects_short_address() {
        let mut r = raw();
        r.payload["delegator"] = json!("0x1122");
        let err = normalize(&r).unwrap_err();
        assert!(err.reason.contains("delegator"));
    }

    #[test]
    fn normalize_rejects_bad_block_hash() {
        let mut r = raw();
        r.block_hash = "0x1234".into();
        assert!(normalize(&r).is_err());
    }

    #[test]
    fn normalize_without_transaction_id() {
        let mut r = raw();
        r.transaction_id = None;
        let event = normalize(&r).unwrap();
        assert_eq!(event.transaction_id, None);
    }

    #[test]
    fn revocation_sentinel() {
        let mut r = raw();
        r.payload["expiryDate"] = json!(0);
        r.payload["oldExpiryDate"] = json!(2000);
        let event = normalize(&r).unwrap();
        assert!(event.is_revocation());
    }
}
