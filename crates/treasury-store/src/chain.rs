use crate::{StorageError, StorageResult};
use treasury_types::{TransactionAppend, TransactionRecord};

/// BLAKE3 over the previous hash, the sequence number and the record content.
pub fn compute_transaction_hash(
    tx: &TransactionAppend,
    previous_hash: Option<&str>,
    sequence: u64,
) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "kind": tx.kind.name(),
        "source": tx.source,
        "destination": tx.destination,
        "amount": tx.amount,
        "value": tx.value,
        "reference": tx.reference,
        "memo": tx.memo,
        "timestamp": tx.timestamp,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

/// Check linkage and hashes of records given in ascending sequence order.
pub fn verify_transaction_chain(records: &[TransactionRecord]) -> StorageResult<()> {
    let mut previous: Option<&TransactionRecord> = None;
    for record in records {
        let expected_previous = previous.map(|p| p.hash.as_str());
        if record.previous_hash.as_deref() != expected_previous {
            return Err(StorageError::InvariantViolation(format!(
                "transaction {} does not link to its predecessor",
                record.sequence
            )));
        }
        if let Some(prev) = previous {
            if record.sequence != prev.sequence + 1 {
                return Err(StorageError::InvariantViolation(format!(
                    "sequence gap between {} and {}",
                    prev.sequence, record.sequence
                )));
            }
        }
        let append = TransactionAppend {
            kind: record.kind,
            source: record.source.clone(),
            destination: record.destination.clone(),
            amount: record.amount.clone(),
            value: record.value,
            reference: record.reference.clone(),
            memo: record.memo.clone(),
            timestamp: record.timestamp,
        };
        let computed =
            compute_transaction_hash(&append, record.previous_hash.as_deref(), record.sequence)?;
        if computed != record.hash {
            return Err(StorageError::InvariantViolation(format!(
                "hash mismatch at sequence {}",
                record.sequence
            )));
        }
        previous = Some(record);
    }
    Ok(())
}
