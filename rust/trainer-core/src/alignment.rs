// rust/trainer-core/src/alignment.rs

//! Example id digests for the alignment handshake.
//!
//! Both parties hash their batch of example ids element-wise into
//! `[0, 2^31 - 1)`; the leader ships its digest and the follower compares it
//! against its own. The hash only has to be fast and identical on both sides.

use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::error::Result;
use crate::tensor::{Data, Value};

/// Exclusive upper bound of a digest bucket.
pub const HASH_BUCKETS: i64 = (1 << 31) - 1;

/// Hashes one example id into its bucket.
pub fn hash_example_id(id: &str) -> i64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(id.as_bytes());
    (hasher.finish() % HASH_BUCKETS as u64) as i64
}

/// Hashes a string tensor of example ids into an `Int64` tensor of the same shape.
pub fn digest(example_ids: &Value) -> Result<Value> {
    let buckets = example_ids
        .as_strings()?
        .iter()
        .map(|id| hash_example_id(id))
        .collect();
    Value::new(example_ids.shape().to_vec(), Data::Int64(buckets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic_and_in_range() {
        for id in ["a", "b", "c", "", "example-000123"] {
            let h = hash_example_id(id);
            assert_eq!(h, hash_example_id(id));
            assert!((0..HASH_BUCKETS).contains(&h));
        }
    }

    #[test]
    fn test_digest_preserves_shape() {
        let ids = Value::new(
            vec![2, 2],
            Data::String(vec!["a".into(), "b".into(), "c".into(), "d".into()]),
        )
        .unwrap();
        let d = digest(&ids).unwrap();
        assert_eq!(d.shape(), &[2, 2]);
        assert_eq!(d.as_i64().unwrap()[0], hash_example_id("a"));
    }

    #[test]
    fn test_digest_detects_divergent_batches() {
        let ours = digest(&Value::strings(["a", "b", "c"])).unwrap();
        let same = digest(&Value::strings(["a", "b", "c"])).unwrap();
        let theirs = digest(&Value::strings(["a", "b", "d"])).unwrap();
        assert_eq!(ours, same);
        assert_ne!(ours, theirs);
    }

    #[test]
    fn test_digest_rejects_non_string_ids() {
        assert!(digest(&Value::i64_vec(vec![1, 2])).is_err());
    }
}
