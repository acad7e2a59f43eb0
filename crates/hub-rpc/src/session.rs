//! Bearer token validation

use std::collections::HashSet;

/// Decides whether a bearer token belongs to a live session
pub trait SessionValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Accepts a fixed set of tokens, typically from the daemon config
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashSet<String>,
}

impl StaticTokenValidator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl SessionValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_tokens() {
        let v = StaticTokenValidator::new(["s3cret", ""]);
        assert!(v.validate("s3cret"));
        assert!(!v.validate(""));
        assert!(!v.validate("guess"));
        assert!(StaticTokenValidator::new(Vec::<String>::new()).is_empty());
    }
}
