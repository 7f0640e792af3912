//! Live-query primitives: triggers, key selectors, update observers and the
//! row-diff engine.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::value::{Row, Value};

/// Predicate deciding whether a mutation can affect a query's result.
///
/// Arguments are `(new row, old row, was_deleted)`; inserts carry no old
/// row, deletions no new row.
pub type TriggerCondition = Box<dyn Fn(Option<&Row>, Option<&Row>, bool) -> bool + Send>;

/// A `(table, optional predicate)` pair directing when a mutation should
/// invalidate a query. Without a predicate, every mutation on the table
/// invalidates.
pub struct Trigger {
    pub table: String,
    pub condition: Option<TriggerCondition>,
}

impl Trigger {
    /// Invalidate on every mutation of `table`.
    pub fn on(table: impl Into<String>) -> Trigger {
        Trigger {
            table: table.into(),
            condition: None,
        }
    }

    /// Invalidate only when `condition` returns true for a mutation.
    pub fn when(
        table: impl Into<String>,
        condition: impl Fn(Option<&Row>, Option<&Row>, bool) -> bool + Send + 'static,
    ) -> Trigger {
        Trigger {
            table: table.into(),
            condition: Some(Box::new(condition)),
        }
    }
}

/// Maps a result row to the key the diff engine identifies it by.
///
/// Keys must be unique within one result set.
pub enum KeySelector {
    /// The row's position in the result sequence.
    Index,
    /// A tuple of the named columns, compared by value. Columns missing
    /// from a row key as NULL.
    Columns(Vec<String>),
    /// A user-supplied function from row to key value.
    Custom(Box<dyn Fn(&Row) -> Value + Send>),
}

impl KeySelector {
    pub fn columns<I, S>(names: I) -> KeySelector
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeySelector::Columns(names.into_iter().map(Into::into).collect())
    }

    fn key_of(&self, row: &Row, index: usize) -> RowKey {
        match self {
            KeySelector::Index => RowKey::Position(index),
            KeySelector::Columns(names) => RowKey::Values(
                names
                    .iter()
                    .map(|name| row.get(name).cloned().unwrap_or(Value::Null))
                    .collect(),
            ),
            KeySelector::Custom(f) => RowKey::Values(vec![f(row)]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Position(usize),
    Values(Vec<Value>),
}

/// Receives one live query's update and error events.
pub trait QueryObserver: Send {
    /// A re-execution produced a non-empty diff. `rows` is the full new
    /// result.
    fn on_update(&self, diff: &Diff, rows: &[Row]);

    /// The query's own re-execution failed; sibling queries are unaffected.
    fn on_error(&self, _error: &Error) {}
}

/// Row-level difference between the previously emitted result and a fresh
/// one.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    /// Rows whose key was absent from the old result, in new-result order.
    pub added: Vec<Row>,
    /// Rows whose key existed but whose values differ, in new-result order.
    pub changed: Vec<Row>,
    /// Old rows whose key is gone, in old-result order.
    pub removed: Vec<Row>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Compute the diff between `old` (absent on first execution) and `new`.
pub(crate) fn diff_results(
    old: Option<&[Row]>,
    new: &[Row],
    selector: &KeySelector,
) -> Result<Diff> {
    let mut new_keys = HashMap::with_capacity(new.len());
    for (index, row) in new.iter().enumerate() {
        if new_keys.insert(selector.key_of(row, index), index).is_some() {
            return Err(Error::DuplicateKey);
        }
    }

    let Some(old) = old else {
        return Ok(Diff {
            added: new.to_vec(),
            ..Diff::default()
        });
    };

    let mut old_keys = HashMap::with_capacity(old.len());
    for (index, row) in old.iter().enumerate() {
        old_keys.insert(selector.key_of(row, index), index);
    }

    let mut diff = Diff::default();
    for (index, row) in new.iter().enumerate() {
        match old_keys.get(&selector.key_of(row, index)) {
            None => diff.added.push(row.clone()),
            Some(&old_index) => {
                if old[old_index] != *row {
                    diff.changed.push(row.clone());
                }
            }
        }
    }
    for (index, row) in old.iter().enumerate() {
        if !new_keys.contains_key(&selector.key_of(row, index)) {
            diff.removed.push(row.clone());
        }
    }
    Ok(diff)
}
