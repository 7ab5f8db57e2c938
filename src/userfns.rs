//! Pluggable user map and reduce functions
//!
//! The coordination layer treats the actual data transformation as a
//! capability supplied by the embedding application. Both functions must be
//! pure and deterministic: recovery reruns them and expects identical
//! output.

use crate::error::CoordinatorError;
use serde::{Deserialize, Serialize};

/// A single key/value pair emitted by a map function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// User-supplied map function: one input file in, key/value pairs out.
///
/// Failures are signalled as [`CoordinatorError::TaskExecution`]; the
/// worker reports them and the scheduler reschedules the task.
pub trait MapFunction: Send + Sync {
    fn map(&self, file_name: &str, contents: &str) -> Result<Vec<KeyValue>, CoordinatorError>;
}

/// User-supplied reduce function: one key group in, one output value out.
///
/// The runtime writes `"<key> <value>\n"` to the partition output for each
/// group, one line per unique key. Failures are signalled as
/// [`CoordinatorError::TaskExecution`].
pub trait ReduceFunction: Send + Sync {
    fn reduce(&self, key: &str, values: &[String]) -> Result<String, CoordinatorError>;
}

/// The classic word-count pair, used as the built-in default.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCount;

impl MapFunction for WordCount {
    fn map(&self, _file_name: &str, contents: &str) -> Result<Vec<KeyValue>, CoordinatorError> {
        Ok(contents
            .split_whitespace()
            .map(|word| KeyValue::new(word, "1"))
            .collect())
    }
}

impl ReduceFunction for WordCount {
    fn reduce(&self, _key: &str, values: &[String]) -> Result<String, CoordinatorError> {
        Ok(values.len().to_string())
    }
}
