//! Envelope codec: wraps every transport payload in a `(header, object)`
//! pair so a receiver can assert it dequeued the message it expected.
//! See spec §4.2.

use crate::error::RtasError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Fixed ASCII header vocabulary used by the engine (spec §4.2, §6).
pub mod header {
    /// P0 → P1, the synced-PRNG seed.
    pub const RANDOM_SEED: &str = "random_seed";
    /// Generator → other owners, in `new_private`.
    pub const NEW_PRIVATE: &str = "new_private";
    /// Creator → others, in `new_public`.
    pub const NEW_PUBLIC: &str = "new_public";
    /// P2 → P0/P1, in `share` (Case B).
    pub const SHARE: &str = "share";
    /// Compute party → compute party, in `reveal_to` (Shared, target is compute).
    pub const ANOTHER_SHARE: &str = "another_share";
    /// P0 → P2, in `reveal_to` (Shared, target is P2).
    pub const SHARE_OF_P0: &str = "share_of_P0";
    /// P1 → P2, in `reveal_to` (Shared, target is P2).
    pub const SHARE_OF_P1: &str = "share_of_P1";
    /// Generator → target, in `reveal_to` (Private).
    pub const PRIVATE_VALUE: &str = "private_value";
    /// P2 → P0/P1, a batch of Beaver triples.
    pub const TRIPLES: &str = "triples";
    /// Compute party → compute party, the `(d_i, e_i)` pair in `product`.
    pub const X_U_AND_Y_V: &str = "X-U and Y-V";
}

/// `(header, object)` wrapper around every logical protocol message.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    header: String,
    object: T,
}

/// Serialize `object` under `header` into the bytes that will become one
/// transport frame.
pub fn encode<T: Serialize>(header: &str, object: &T) -> Result<Vec<u8>, RtasError> {
    let envelope = Envelope {
        header: header.to_string(),
        object,
    };
    bincode::serialize(&envelope).map_err(|e| RtasError::Envelope(e.to_string()))
}

/// Deserialize `bytes` as an envelope and assert its header matches
/// `expected_header`. Any deserialization failure or header mismatch is a
/// discipline-check [`RtasError::Envelope`], not a security property — it
/// catches message-ordering bugs at development time.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], expected_header: &str) -> Result<T, RtasError> {
    let envelope: Envelope<T> = bincode::deserialize(bytes)
        .map_err(|e| RtasError::Envelope(format!("malformed envelope: {e}")))?;
    if envelope.header != expected_header {
        return Err(RtasError::Envelope(format!(
            "expected header {expected_header:?} but got {:?}",
            envelope.header
        )));
    }
    Ok(envelope.object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_matching_header() {
        let bytes = encode("random_seed", &42u64).unwrap();
        let value: u64 = decode(&bytes, "random_seed").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn rejects_mismatched_header() {
        let bytes = encode(header::SHARE, &vec![1.0_f64, 2.0]).unwrap();
        let err = decode::<Vec<f64>>(&bytes, header::TRIPLES).unwrap_err();
        assert!(matches!(err, RtasError::Envelope(_)));
    }
}
