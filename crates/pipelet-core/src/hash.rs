//! Content fingerprints for value sets and error-flow identities (blake3).

use std::fmt;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{Identity, Key, Value};

/// A 32-byte blake3 digest, shown as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(v).map_err(|e| Error::Hash(e.to_string()))
}

/// Digest of the canonical JSON encoding of `v`.
pub fn hash_serde<T: Serialize>(v: &T) -> Result<Hash256> {
    Ok(Hash256(blake3::hash(&encode(v)?).into()))
}

/// Order-independent digest of a value set: values are sorted by identity
/// first, so two replicas holding the same entities agree on the digest.
pub fn state_digest<'a, I>(values: I, key: &Key) -> Result<Hash256>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut keyed: Vec<(Identity, &Value)> =
        values.into_iter().map(|v| (key.identity(v), v)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    let mut h = Hasher::new();
    for (_, v) in keyed {
        let bytes = encode(v)?;
        h.update(&(bytes.len() as u64).to_le_bytes());
        h.update(&bytes);
    }
    Ok(Hash256(h.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_ignores_order() {
        let a = Value::from_json(json!({"id": 1})).unwrap();
        let b = Value::from_json(json!({"id": 2})).unwrap();
        let key = Key::default();
        assert_eq!(
            state_digest([&a, &b], &key).unwrap(),
            state_digest([&b, &a], &key).unwrap()
        );
        assert_ne!(
            state_digest([&a], &key).unwrap(),
            state_digest([&a, &b], &key).unwrap()
        );
    }
}
