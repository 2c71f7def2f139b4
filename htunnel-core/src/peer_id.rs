use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier the signaling server assigns to every member of a room.
///
/// Ids are opaque to the tunnel; they are only compared, hashed and printed.
///
/// ```rust
/// use htunnel_core::PeerId;
///
/// let id: PeerId = "42".parse().unwrap();
/// assert_eq!(id, PeerId::new(42));
/// assert_eq!(id.to_string(), "42");
/// ```
#[repr(transparent)]
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
    /// The id used before the signaling server assigned one.
    pub const fn unspecified() -> Self {
        Self(0)
    }
    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<PeerId> for u64 {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(PeerId)
    }
}

#[cfg(test)]
mod tests {
    use super::PeerId;

    #[test]
    fn parse_and_print() {
        let id: PeerId = " 1234 ".parse().unwrap();
        assert_eq!(id.as_u64(), 1234);
        assert_eq!(id.to_string(), "1234");
        assert!("12a".parse::<PeerId>().is_err());
        assert!(PeerId::unspecified().is_unspecified());
    }

    #[test]
    fn serde_is_a_plain_number() {
        let id = PeerId::new(7);
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
        let back: PeerId = serde_json::from_str("7").unwrap();
        assert_eq!(back, id);
    }
}
