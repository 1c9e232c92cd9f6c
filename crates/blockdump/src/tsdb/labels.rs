//! Sorted label sets identifying a series.

use crate::error::EngineResult;
use crate::tsdb::encoding::{put_string, ByteReader};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A label set, kept sorted by name with unique names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    /// Builds a label set, sorting by name. For a repeated name the first
    /// value after sorting is kept.
    pub fn new(mut pairs: Vec<(String, String)>) -> Self {
        pairs.sort();
        pairs.dedup_by(|next, kept| next.0 == kept.0);
        Self(pairs)
    }

    /// Builds a label set from string-like pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Returns the value of a label.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].1.as_str())
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// In-process hash used to look up series by label set.
    pub fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) -> EngineResult<()> {
        buf.extend_from_slice(&(self.0.len() as u16).to_le_bytes());
        for (name, value) in &self.0 {
            put_string(buf, name)?;
            put_string(buf, value)?;
        }
        Ok(())
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>) -> EngineResult<Self> {
        let count = reader.u16()? as usize;
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let name = reader.string()?;
            let value = reader.string()?;
            pairs.push((name, value));
        }
        Ok(Self::new(pairs))
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", name, value)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_deduplicated() {
        let labels = Labels::from_pairs([("job", "api"), ("__name__", "up"), ("job", "db")]);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("__name__"), Some("up"));
        assert_eq!(labels.get("job"), Some("api"));
        assert_eq!(labels.get("missing"), None);
        assert_eq!(labels.to_string(), r#"{__name__="up", job="api"}"#);
    }

    #[test]
    fn test_hash_ignores_input_order() {
        let a = Labels::from_pairs([("a", "1"), ("b", "2")]);
        let b = Labels::from_pairs([("b", "2"), ("a", "1")]);
        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn test_encode_decode() {
        let labels = Labels::from_pairs([("instance", "localhost:9090"), ("job", "prom")]);
        let mut buf = Vec::new();
        labels.encode_into(&mut buf).unwrap();
        let mut reader = ByteReader::new(&buf);
        assert_eq!(Labels::decode(&mut reader).unwrap(), labels);
        assert_eq!(reader.remaining(), 0);
    }
}
