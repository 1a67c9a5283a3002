//! Decoder for `{name=value}` parameter tokens embedded in free text.
//!
//! Marker names authored on a music timeline carry their gameplay metadata in
//! this form, e.g. `drop{lane=2}{speed=fast}`. Anything that does not form a
//! complete token is ignored.

use std::collections::hash_map::{self, Entry};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Result, SyncError};

const TOKEN_PATTERN: &str = r"\{(?P<name>[A-Za-z0-9]+)=(?P<value>[A-Za-z0-9]+)\}";

static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();

fn token_regex() -> &'static Regex {
    TOKEN_REGEX.get_or_init(|| Regex::new(TOKEN_PATTERN).expect("invalid regex pattern"))
}

/// Decoded `name -> value` pairs. Keys are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterMap {
    entries: HashMap<String, String>,
}

impl ParameterMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Parses the value stored under `key`. Returns `None` when the key is
    /// missing or the value does not parse as `T`.
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| value.parse().ok())
    }

    /// Whether a token named `key` was decoded.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of decoded tokens.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(name, value)` pairs in arbitrary order.
    pub fn iter(&self) -> hash_map::Iter<'_, String, String> {
        self.entries.iter()
    }

    fn insert_unique(&mut self, key: &str, value: &str) -> Result<()> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(SyncError::MalformedOrDuplicateKey {
                key: key.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(())
            }
        }
    }
}

impl<'a> IntoIterator for &'a ParameterMap {
    type Item = (&'a String, &'a String);
    type IntoIter = hash_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Extracts every complete `{name=value}` token from `input`.
///
/// Tokens are matched left to right without overlap. Partial tokens such as
/// `{a=1` or `{=1}` are skipped rather than reported. A key seen twice fails
/// with [`SyncError::MalformedOrDuplicateKey`].
pub fn decode(input: &str) -> Result<ParameterMap> {
    let mut params = ParameterMap::new();
    for captures in token_regex().captures_iter(input) {
        params.insert_unique(&captures["name"], &captures["value"])?;
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_empty_map() {
        let params = decode("").unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn decodes_consecutive_tokens() {
        let params = decode("{a=1}{b=2}").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get("b"), Some("2"));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let err = decode("{a=1}{a=2}").unwrap_err();
        match err {
            SyncError::MalformedOrDuplicateKey { key } => assert_eq!(key, "a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unterminated_token_is_ignored() {
        assert!(decode("{a=1").unwrap().is_empty());
    }

    #[test]
    fn tokens_embedded_in_text_are_found() {
        let params = decode("chorus {lane=2} then {speed=fast}!").unwrap();
        assert_eq!(params.get("lane"), Some("2"));
        assert_eq!(params.get("speed"), Some("fast"));
    }

    #[test]
    fn malformed_fragments_are_skipped() {
        let params = decode("{=1}{a=}{a-b=1}{{c=3}}{d = 4}").unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("c"), Some("3"));
    }

    #[test]
    fn decoding_is_repeatable() {
        let input = "intro{bar=4}{mood=calm}";
        assert_eq!(decode(input).unwrap(), decode(input).unwrap());
    }

    #[test]
    fn typed_lookup_parses_values() {
        let params = decode("{lane=2}{speed=fast}").unwrap();
        assert_eq!(params.parse::<u32>("lane"), Some(2));
        assert_eq!(params.parse::<u32>("speed"), None);
        assert_eq!(params.parse::<u32>("missing"), None);
    }

    #[test]
    fn serialises_as_plain_object() {
        let params = decode("{a=1}").unwrap();
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"a":"1"}"#);
    }
}
