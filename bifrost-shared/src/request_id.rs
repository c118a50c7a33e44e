//! 128-bit request identifiers, minted by the server for every end-user
//! connection and threaded through every frame that refers to it.

use std::fmt;
use std::str::FromStr;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

/// Identifies one end-user↔target stream for the lifetime of the tunnel.
///
/// Represented on the wire as lowercase hex, the way the rest of the
/// control protocol prefers plain strings over binary blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; 16]);

impl RequestId {
    /// Generate a new random request id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        for b in &mut bytes {
            *b = fastrand::u8(..);
        }
        RequestId(bytes)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for RequestId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(RequestId(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hex() {
        let id = RequestId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(id, s.parse().unwrap());
    }

    #[test]
    fn distinct_on_each_generation() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b, "two generated ids collided by chance");
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!("not-hex".parse::<RequestId>().is_err());
        assert!("abcd".parse::<RequestId>().is_err(), "too short");
    }
}
