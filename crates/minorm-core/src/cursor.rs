//! Buffered, forward-only result cursors.
//!
//! A cursor holds every row of the completed statement and hands them out
//! once, in order. Fetching from an exhausted
//! cursor returns nothing rather than failing. The view is fixed by the
//! first fetch: a cursor that has produced a row can no longer be turned
//! into a [`MappingCursor`].

use crate::error::{Error, Result, StateErrorKind};
use crate::row::{ColumnInfo, Row};
use crate::value::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// A row type a cursor can carry.
pub trait ResultRow: Sized {
    /// One element of the row (a value, or for entity rows an instance).
    type Item;

    /// Element lookup by column label.
    fn item(&self, label: &str) -> Option<&Self::Item>;

    /// Move the first element out.
    fn into_first(self) -> Option<Self::Item>;
}

impl ResultRow for Row {
    type Item = Value;

    fn item(&self, label: &str) -> Option<&Value> {
        self.get_by_name(label)
    }

    fn into_first(self) -> Option<Value> {
        self.into_values().into_iter().next()
    }
}

/// Buffered rows plus exhaustion tracking, shared by all cursor views.
#[derive(Debug)]
pub struct RowBuffer<T> {
    pending: VecDeque<T>,
    started: bool,
}

impl<T> RowBuffer<T> {
    fn new(rows: impl IntoIterator<Item = T>) -> Self {
        Self {
            pending: rows.into_iter().collect(),
            started: false,
        }
    }

    fn map<U>(self, f: impl FnMut(T) -> U) -> RowBuffer<U> {
        RowBuffer {
            pending: self.pending.into_iter().map(f).collect(),
            started: self.started,
        }
    }
}

/// Fetch operations common to every cursor view.
pub trait Fetch {
    type Output;

    #[doc(hidden)]
    fn buffer(&mut self) -> &mut RowBuffer<Self::Output>;

    /// Next row, or `None` once exhausted.
    fn fetch_one(&mut self) -> Option<Self::Output> {
        let buf = self.buffer();
        buf.started = true;
        buf.pending.pop_front()
    }

    /// Up to `n` further rows.
    fn fetch_many(&mut self, n: usize) -> Vec<Self::Output> {
        let buf = self.buffer();
        buf.started = true;
        let n = n.min(buf.pending.len());
        buf.pending.drain(..n).collect()
    }

    /// Drain every remaining row.
    fn all(&mut self) -> Vec<Self::Output> {
        let buf = self.buffer();
        buf.started = true;
        buf.pending.drain(..).collect()
    }

    /// First remaining row; the rest are discarded.
    fn first(&mut self) -> Option<Self::Output> {
        let mut rows = self.all().into_iter();
        rows.next()
    }

    /// Exactly one remaining row.
    #[allow(clippy::result_large_err)]
    fn one(&mut self) -> Result<Self::Output> {
        self.one_or_none()?.ok_or_else(|| {
            Error::state(StateErrorKind::ResultShape, "expected exactly one row, found none")
        })
    }

    /// At most one remaining row.
    #[allow(clippy::result_large_err)]
    fn one_or_none(&mut self) -> Result<Option<Self::Output>> {
        let mut rows = self.all();
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(Error::state(
                StateErrorKind::ResultShape,
                format!("expected at most one row, found {}", n),
            )),
        }
    }
}

/// Execution metadata carried alongside the rows.
#[derive(Debug, Clone, Default)]
struct Summary {
    columns: Arc<ColumnInfo>,
    rowcount: u64,
    inserted_primary_key: Option<Vec<Value>>,
    last_insert_id: Option<i64>,
}

/// Result of one statement execution in row view.
#[derive(Debug)]
pub struct Cursor<R = Row> {
    rows: RowBuffer<R>,
    summary: Summary,
}

impl Cursor<Row> {
    /// A cursor over rows sharing `columns`.
    pub fn from_values(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let columns = Arc::new(ColumnInfo::new(columns));
        let rows = rows
            .into_iter()
            .map(|values| Row::with_columns(Arc::clone(&columns), values))
            .collect::<Vec<_>>();
        Self {
            rows: RowBuffer::new(rows),
            summary: Summary {
                columns,
                ..Summary::default()
            },
        }
    }

    /// Narrow to the first column value.
    pub fn scalar(mut self) -> Option<Value> {
        self.first().and_then(ResultRow::into_first)
    }
}

impl<R: ResultRow> Cursor<R> {
    pub fn new(columns: Arc<ColumnInfo>, rows: Vec<R>) -> Self {
        Self {
            rows: RowBuffer::new(rows),
            summary: Summary {
                columns,
                ..Summary::default()
            },
        }
    }

    /// A cursor with no rows and no columns.
    pub fn empty() -> Self {
        Self::new(Arc::new(ColumnInfo::default()), Vec::new())
    }

    #[must_use]
    pub fn with_rowcount(mut self, rowcount: u64) -> Self {
        self.summary.rowcount = rowcount;
        self
    }

    #[must_use]
    pub fn with_inserted_primary_key(mut self, key: Option<Vec<Value>>) -> Self {
        self.summary.inserted_primary_key = key;
        self
    }

    #[must_use]
    pub fn with_last_insert_id(mut self, id: Option<i64>) -> Self {
        self.summary.last_insert_id = id;
        self
    }

    /// Rows affected by the statement (summed over a batch).
    pub fn rowcount(&self) -> u64 {
        self.summary.rowcount
    }

    pub fn columns(&self) -> &[String] {
        self.summary.columns.names()
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.summary.columns)
    }

    /// Primary key of the row a single-row insert created.
    pub fn inserted_primary_key(&self) -> Option<&[Value]> {
        self.summary.inserted_primary_key.as_deref()
    }

    pub fn last_insert_id(&self) -> Option<i64> {
        self.summary.last_insert_id
    }

    /// Rows not yet fetched.
    pub fn remaining(&self) -> usize {
        self.rows.pending.len()
    }

    /// Each row narrowed to its first element.
    ///
    /// For entity rows that element is the instance, not its first field.
    pub fn scalars(self) -> ScalarCursor<R::Item> {
        ScalarCursor {
            rows: self.rows.map(|r| r.into_first()),
        }
    }

    /// Switch to mapping view (label lookup only).
    ///
    /// Fails once a row has been fetched in row view.
    #[allow(clippy::result_large_err)]
    pub fn mappings(self) -> Result<MappingCursor<R>> {
        if self.rows.started {
            return Err(Error::state(
                StateErrorKind::ViewMode,
                "cursor view mode cannot change after the first fetch",
            ));
        }
        let columns = Arc::clone(&self.summary.columns);
        Ok(MappingCursor {
            rows: self.rows.map(|row| RowMapping {
                row,
                columns: Arc::clone(&columns),
            }),
        })
    }

    /// Convert every row, keeping the execution metadata.
    #[allow(clippy::result_large_err)]
    pub fn try_map<U: ResultRow>(
        self,
        columns: Arc<ColumnInfo>,
        f: impl FnMut(R) -> Result<U>,
    ) -> Result<Cursor<U>> {
        let rows = self.rows.pending.into_iter().map(f).collect::<Result<Vec<U>>>()?;
        Ok(Cursor {
            rows: RowBuffer::new(rows),
            summary: Summary {
                columns,
                ..self.summary
            },
        })
    }
}

impl<R> Fetch for Cursor<R> {
    type Output = R;

    fn buffer(&mut self) -> &mut RowBuffer<R> {
        &mut self.rows
    }
}

/// Consumes the remaining rows.
impl<R> IntoIterator for Cursor<R> {
    type Item = R;
    type IntoIter = std::collections::vec_deque::IntoIter<R>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.pending.into_iter()
    }
}

/// Cursor over the first element of each row.
///
/// Rows without any element yield nothing for that position.
#[derive(Debug)]
pub struct ScalarCursor<T> {
    rows: RowBuffer<Option<T>>,
}

impl<T> ScalarCursor<T> {
    pub fn fetch_one(&mut self) -> Option<T> {
        self.rows.started = true;
        while let Some(item) = self.rows.pending.pop_front() {
            if item.is_some() {
                return item;
            }
        }
        None
    }

    pub fn all(&mut self) -> Vec<T> {
        self.rows.started = true;
        self.rows.pending.drain(..).flatten().collect()
    }

    pub fn first(&mut self) -> Option<T> {
        self.all().into_iter().next()
    }

    #[allow(clippy::result_large_err)]
    pub fn one(&mut self) -> Result<T> {
        let mut items = self.all();
        if items.len() == 1 {
            Ok(items.remove(0))
        } else {
            Err(Error::state(
                StateErrorKind::ResultShape,
                format!("expected exactly one row, found {}", items.len()),
            ))
        }
    }
}

impl<T> Iterator for ScalarCursor<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.fetch_one()
    }
}

/// A row in mapping view: lookup by label only.
#[derive(Debug, Clone)]
pub struct RowMapping<R> {
    row: R,
    columns: Arc<ColumnInfo>,
}

impl<R: ResultRow> RowMapping<R> {
    pub fn get(&self, label: &str) -> Option<&R::Item> {
        self.row.item(label)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn contains_key(&self, label: &str) -> bool {
        self.columns.index_of(label).is_some()
    }
}

/// Cursor in mapping view.
#[derive(Debug)]
pub struct MappingCursor<R> {
    rows: RowBuffer<RowMapping<R>>,
}

impl<R> Fetch for MappingCursor<R> {
    type Output = RowMapping<R>;

    fn buffer(&mut self) -> &mut RowBuffer<RowMapping<R>> {
        &mut self.rows
    }
}

impl<R> IntoIterator for MappingCursor<R> {
    type Item = RowMapping<R>;
    type IntoIter = std::collections::vec_deque::IntoIter<RowMapping<R>>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.pending.into_iter()
    }
}
