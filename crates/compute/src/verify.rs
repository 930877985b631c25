//! Result verification for the three modes.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use weft_types::TaskResult;

use crate::error::ComputeError;

/// Hash mode: the carried hash must match the payload. When an
/// authoritative hash from the first accepted return exists, it must match
/// that too.
pub fn check_hash(result: &TaskResult, authoritative: Option<&str>) -> Result<(), ComputeError> {
    let actual = hex::encode(Sha256::digest(&result.result));
    if actual != result.result_hash {
        return Err(ComputeError::VerificationFailed(format!(
            "result hash mismatch for task {}",
            result.task_id
        )));
    }
    if let Some(expected) = authoritative {
        if actual != expected {
            return Err(ComputeError::VerificationFailed(format!(
                "task {} disagrees with authoritative hash",
                result.task_id
            )));
        }
    }
    Ok(())
}

/// Redundant mode: majority result among `results` by payload hash.
/// Returns the winning result; ties and empty input fail.
pub fn majority(results: Vec<TaskResult>) -> Result<TaskResult, ComputeError> {
    if results.is_empty() {
        return Err(ComputeError::VerificationFailed("no redundant results".into()));
    }
    let mut votes: HashMap<String, (usize, TaskResult)> = HashMap::new();
    let total = results.len();
    for result in results {
        let key = hex::encode(Sha256::digest(&result.result));
        let entry = votes.entry(key).or_insert((0, result));
        entry.0 += 1;
    }

    let (count, winner) = votes
        .into_values()
        .max_by_key(|(count, _)| *count)
        .expect("non-empty votes");
    if count * 2 > total {
        Ok(winner)
    } else {
        Err(ComputeError::VerificationFailed(format!(
            "no majority: best {count} of {total}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(payload: &[u8]) -> TaskResult {
        TaskResult::completed("t".into(), payload.to_vec(), 1, "w".into())
    }

    #[test]
    fn hash_mode_accepts_consistent_result() {
        let r = result(b"bytes");
        assert!(check_hash(&r, None).is_ok());
        assert!(check_hash(&r, Some(&r.result_hash.clone())).is_ok());
    }

    #[test]
    fn hash_mode_rejects_tampered_payload() {
        let mut r = result(b"bytes");
        r.result[0] ^= 1;
        assert!(matches!(
            check_hash(&r, None),
            Err(ComputeError::VerificationFailed(_))
        ));
    }

    #[test]
    fn hash_mode_rejects_authoritative_disagreement() {
        let r = result(b"bytes");
        let other = result(b"other");
        assert!(matches!(
            check_hash(&r, Some(&other.result_hash)),
            Err(ComputeError::VerificationFailed(_))
        ));
    }

    #[test]
    fn majority_two_of_three_wins() {
        let good = result(b"agreed");
        let results = vec![good.clone(), result(b"byzantine"), good.clone()];
        let winner = majority(results).unwrap();
        assert_eq!(winner.result, b"agreed");
    }

    #[test]
    fn majority_fails_on_three_way_split() {
        let results = vec![result(b"a"), result(b"b"), result(b"c")];
        assert!(matches!(
            majority(results),
            Err(ComputeError::VerificationFailed(_))
        ));
    }

    #[test]
    fn majority_of_one_is_itself() {
        let winner = majority(vec![result(b"solo")]).unwrap();
        assert_eq!(winner.result, b"solo");
    }
}
