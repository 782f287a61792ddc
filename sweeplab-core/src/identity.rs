//! Run identities: the canonical `path=value,path=value` encoding of a sweep
//! point.
//!
//! The encoding is a pure function of the `(path, value)` pairs: pairs are
//! sorted by path, values are rendered canonically and the characters the
//! encoding itself uses (`,` `=` `/` `%`) are percent-escaped. Two runs with
//! the same axis assignment always share an identity, and therefore a run
//! directory, no matter in which order the axes were declared or dispatched.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::path::ConfigPath;
use crate::value::Value;

/// The sweep-axis assignment of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunIdentity {
    pairs: Vec<(ConfigPath, Value)>,
    encoded: String,
}

impl RunIdentity {
    /// Build an identity; pairs are sorted by path.
    pub fn new(pairs: impl IntoIterator<Item = (ConfigPath, Value)>) -> Self {
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let encoded = encode_pairs(&pairs);
        Self { pairs, encoded }
    }

    /// Identity of the unswept base configuration.
    pub fn empty() -> Self {
        Self {
            pairs: Vec::new(),
            encoded: String::new(),
        }
    }

    pub fn pairs(&self) -> &[(ConfigPath, Value)] {
        &self.pairs
    }

    pub fn get(&self, path: &ConfigPath) -> Option<&Value> {
        self.pairs.iter().find(|(p, _)| p == path).map(|(_, v)| v)
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl Serialize for RunIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

/// Encode already-sorted pairs as `path1=value1,path2=value2`.
pub fn encode_pairs(pairs: &[(ConfigPath, Value)]) -> String {
    pairs
        .iter()
        .map(|(path, value)| format!("{path}={}", escape(&value.to_string())))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            ',' => out.push_str("%2C"),
            '/' => out.push_str("%2F"),
            '=' => out.push_str("%3D"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(path: &str, value: Value) -> (ConfigPath, Value) {
        (ConfigPath::parse(path).unwrap(), value)
    }

    #[test]
    fn sorted_regardless_of_input_order() {
        let a = RunIdentity::new(vec![
            pair("optimizer.rank", Value::Int(4)),
            pair("optimizer.learning_rate", Value::Float(0.001)),
        ]);
        let b = RunIdentity::new(vec![
            pair("optimizer.learning_rate", Value::Float(0.001)),
            pair("optimizer.rank", Value::Int(4)),
        ]);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "optimizer.learning_rate=0.001,optimizer.rank=4");
    }

    #[test]
    fn empty_identity_is_empty_string() {
        assert_eq!(RunIdentity::empty().as_str(), "");
        assert_eq!(RunIdentity::new(Vec::new()), RunIdentity::empty());
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let id = RunIdentity::new(vec![
            pair("task.name", Value::from("a,b=c/d%")),
            pair("engine.seeds", Value::List(vec![Value::Int(1), Value::Int(2)])),
        ]);
        assert_eq!(id.as_str(), "engine.seeds=[1%2C2],task.name=a%2Cb%3Dc%2Fd%25");
    }

    #[test]
    fn lookup_by_path() {
        let id = RunIdentity::new(vec![pair("engine.seed", Value::Int(3))]);
        let seed = ConfigPath::parse("engine.seed").unwrap();
        assert_eq!(id.get(&seed), Some(&Value::Int(3)));
    }
}
