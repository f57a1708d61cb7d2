//! Secret values and secret generation.
//!
//! `Secret` prints as `********` through `Debug` and `Display` so it can sit inside
//! structs that get logged. The plain value is only reachable through `expose()`.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Generated secret length
pub const SECRET_LENGTH: usize = 24;

const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const DIGITS: &[u8] = b"23456789";
// No quotes, backslash or `$`: the value ends up inside SQL literals and config files.
const SYMBOLS: &[u8] = b"!#%+-=?@^_";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh random secret from the OS entropy source
    pub fn generate() -> Self {
        Self(generate_secret(SECRET_LENGTH))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(********)")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("********")
    }
}

/// Random string with at least one character from each class.
///
/// Lengths below 4 are raised to 4.
pub fn generate_secret(length: usize) -> String {
    let length = length.max(4);
    let classes = [UPPER, LOWER, DIGITS, SYMBOLS];
    let all: Vec<u8> = classes.iter().flat_map(|c| c.iter().copied()).collect();

    let mut rng = OsRng;
    let mut out: Vec<u8> = classes
        .iter()
        .map(|class| class[rng.gen_range(0..class.len())])
        .collect();
    while out.len() < length {
        out.push(all[rng.gen_range(0..all.len())]);
    }
    out.shuffle(&mut rng);

    out.into_iter().map(char::from).collect()
}

/// Character classes present in a candidate secret
pub fn character_classes(value: &str) -> usize {
    let bytes = value.as_bytes();
    [UPPER, LOWER, DIGITS, SYMBOLS]
        .iter()
        .filter(|class| bytes.iter().any(|b| class.contains(b)))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_secret_is_masked() {
        let s = Secret::new("hunter2hunter2");
        assert_eq!(format!("{}", s), "********");
        assert!(!format!("{:?}", s).contains("hunter2"));
        assert_eq!(s.expose(), "hunter2hunter2");
    }

    #[test]
    fn test_serializes_transparently() {
        let s = Secret::new("abc");
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_thousand_secrets_unique_and_mixed() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let s = generate_secret(SECRET_LENGTH);
            assert_eq!(s.len(), SECRET_LENGTH);
            assert_eq!(character_classes(&s), 4, "weak secret: {}", s);
            assert!(!s.contains('\'') && !s.contains('"') && !s.contains('$'));
            assert!(seen.insert(s));
        }
    }

    #[test]
    fn test_minimum_length() {
        assert_eq!(generate_secret(1).len(), 4);
    }
}
