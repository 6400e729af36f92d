use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Registry key minted once per request at bind time.
///
/// Backed by a UUIDv7: time-ordered and unique for the life of the process,
/// so a token is never reused while an older request with the same key
/// could still be unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestToken(Uuid);

impl RequestToken {
    /// Generate a new unique request token
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_unique_and_time_ordered() {
        let tokens: Vec<RequestToken> = (0..1_000).map(|_| RequestToken::new()).collect();
        let unique: HashSet<_> = tokens.iter().copied().collect();
        assert_eq!(unique.len(), tokens.len());

        let mut sorted = tokens.clone();
        sorted.sort();
        assert_eq!(sorted, tokens);
    }
}
