//! Result ordering and windowing.

use crate::matcher::Candidate;
use crate::value::{parse_date, Pointer};
use crate::{error::Result, Error};
use serde_json::Value;
use std::cmp::Ordering;

/// One parsed sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub key: String,
    pub descending: bool,
}

impl SortKey {
    /// Parse `key` or `-key`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (key, descending) = match raw.strip_prefix('-') {
            Some(key) => (key, true),
            None => (raw, false),
        };
        if key.is_empty() {
            return Err(Error::InvalidQuery(format!("invalid sort key '{raw}'")));
        }
        Ok(Self {
            key: key.to_string(),
            descending,
        })
    }
}

/// Rank of a value's kind. Values of different kinds order by rank, missing
/// and null values lowest.
fn kind_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(v) if parse_date(v).is_some() => 4,
        Some(v) if Pointer::from_value(v).is_some() => 5,
        Some(Value::Array(_)) => 6,
        Some(Value::Object(_)) => 7,
    }
}

/// Compare two values of the same comparable kind.
///
/// Numbers compare numerically, strings by code point, dates
/// chronologically and booleans with `false < true`. Any other pairing has no
/// order.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => Some(parse_date(a)?.cmp(&parse_date(b)?)),
    }
}

/// Total order used for sorting.
pub fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = kind_rank(a).cmp(&kind_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

/// Stable multi-key sort of `items`.
pub fn sort_candidates<T>(
    items: &mut [T],
    sort_keys: &[String],
    candidate: impl Fn(&T) -> &Candidate,
) -> Result<()> {
    let keys = sort_keys
        .iter()
        .map(|raw| SortKey::parse(raw))
        .collect::<Result<Vec<_>>>()?;
    if keys.is_empty() {
        return Ok(());
    }
    items.sort_by(|a, b| {
        let (a, b) = (candidate(a), candidate(b));
        for key in &keys {
            let ordering = compare_for_sort(
                a.value(&key.key).as_deref(),
                b.value(&key.key).as_deref(),
            );
            let ordering = if key.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

/// Apply `skip` then `limit`.
pub fn apply_window<T>(items: Vec<T>, skip: usize, limit: Option<usize>) -> Vec<T> {
    let rest = items.into_iter().skip(skip);
    match limit {
        Some(limit) => rest.take(limit).collect(),
        None => rest.collect(),
    }
}
