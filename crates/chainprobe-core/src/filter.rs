//! Conjunctive attribute filters and the matcher that evaluates them.

use std::collections::BTreeMap;

use crate::record::EventRecord;

/// What a single filter key expects of the record's values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// Exact match against any one value stored under the key.
    Equals(String),
    /// Exact match of the value at `index` in the key's value sequence.
    At { index: usize, value: String },
}

impl Expectation {
    fn is_satisfied_by(&self, values: &[String]) -> bool {
        match self {
            Self::Equals(expected) => values.iter().any(|v| v == expected),
            Self::At { index, value } => values.get(*index).is_some_and(|v| v == value),
        }
    }
}

/// AND across keys; there is no OR and no negation.
///
/// ```
/// use chainprobe_core::{EventRecord, Filter};
///
/// let filter = Filter::new().equals("type", "packet").equals("status", "0");
/// let record = EventRecord::new()
///     .with_attribute("type", "packet")
///     .with_attribute("status", "0");
/// assert!(filter.matches(&record));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    criteria: BTreeMap<String, Expectation>,
}

impl Filter {
    /// The empty filter, which matches every record.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.criteria
            .insert(key.into(), Expectation::Equals(value.into()));
        self
    }

    pub fn at(mut self, key: impl Into<String>, index: usize, value: impl Into<String>) -> Self {
        self.criteria.insert(
            key.into(),
            Expectation::At {
                index,
                value: value.into(),
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn criteria(&self) -> impl Iterator<Item = (&str, &Expectation)> {
        self.criteria.iter().map(|(k, e)| (k.as_str(), e))
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        matches(self, record)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Filter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), |f, (k, v)| f.equals(k, v))
    }
}

/// `true` iff every key in `filter` is present in `record` and satisfied.
pub fn matches(filter: &Filter, record: &EventRecord) -> bool {
    filter.criteria.iter().all(|(key, expectation)| {
        record
            .attributes
            .get(key)
            .is_some_and(|values| expectation.is_satisfied_by(values))
    })
}
