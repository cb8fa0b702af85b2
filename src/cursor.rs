/// Cursors
///
/// A `Cursor` is a positioned, filterable, ordered view over the rows of one
/// relation, owned by one session. It carries a record buffer holding the
/// values of the current row (or of a row about to be written), the image of
/// the row as last read (`x_rec`), and the scan state: per-column
/// constraints, an optional lookup chain, an ordering and an offset/row-count
/// window.
///
/// Scans are planned from the declared indexes. An order matching the
/// primary key (ascending or fully descending) walks the primary key map,
/// seeking straight to the rows pinned by exact constraints on leading key
/// columns; an order matching a declared index walks that index; any other
/// order collects the visible rows and sorts them. Primary key columns not
/// named in the order are always appended ascending, so every order is
/// total.
///
/// Navigation is relative to the *buffer*: `next()` moves to the first
/// visible row sorting after the buffer's values. Failed moves return
/// `false` and leave buffer and position untouched.
///
/// Writes (`insert`, `update`, `delete`) validate the buffer against the
/// schema, run the relation's hooks and keep every dependent materialized
/// view in step with the table: either the row and all views change, or
/// nothing does.
///
/// # Examples
///
/// ```
/// use livecursor::{Catalog, Column, ColumnType, ColumnValue, Database, Schema};
///
/// let catalog = Catalog::new().relation(Schema::new(
///     "people",
///     vec![
///         Column::new("id", ColumnType::Int, false),
///         Column::new("name", ColumnType::text(), false),
///     ],
///     &["id"],
/// ));
/// let db = Database::new(catalog)?;
/// let session = db.session();
///
/// let mut people = session.cursor("people")?;
/// for (id, name) in [(1, "Ann"), (2, "Bob"), (3, "Cy")] {
///     people.set_value("id", id)?;
///     people.set_value("name", name)?;
///     people.insert()?;
/// }
///
/// people.set_filter("id", ">1")?;
/// assert_eq!(people.count(), 2);
/// assert!(people.first());
/// assert_eq!(people.value("name")?, &ColumnValue::from("Bob"));
/// assert!(people.next());
/// assert!(!people.next());
/// assert_eq!(people.as_csv_line(), "3,Cy");
/// # Ok::<(), livecursor::CursorError>(())
/// ```

use crate::changeset::{IncrementalView, TableChange};
use crate::column::{ColumnDefault, ColumnValue};
use crate::database::{Database, Session};
use crate::error::{CursorError, Result};
use crate::filter::{parse_filter, ColumnFilter};
use crate::lookup::{FieldsLookup, LookupConstraint};
use crate::table::{format_key, Key, Schema, StoredRow, Table};
use crate::trigger::TriggerType;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

// ============================================================================
// Ordering
// ============================================================================

/// Sort order for a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending order (smallest first, NULL before everything)
    Ascending,
    /// Descending order (largest first)
    Descending,
}

/// A single sort key specifying a column and order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Column name to sort by
    pub column: String,
    /// Sort order (ascending or descending)
    pub order: SortOrder,
}

impl SortKey {
    pub fn ascending(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(column: impl Into<String>) -> Self {
        SortKey {
            column: column.into(),
            order: SortOrder::Descending,
        }
    }

    /// Parse `"column"`, `"column ASC"` or `"column DESC"`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split_whitespace();
        let column = parts
            .next()
            .ok_or_else(|| CursorError::InvalidOrder("empty order column".to_string()))?;
        let order = match parts.next() {
            None => SortOrder::Ascending,
            Some(dir) if dir.eq_ignore_ascii_case("asc") => SortOrder::Ascending,
            Some(dir) if dir.eq_ignore_ascii_case("desc") => SortOrder::Descending,
            Some(dir) => {
                return Err(CursorError::InvalidOrder(format!(
                    "unknown direction '{}' in '{}'",
                    dir, text
                )))
            }
        };
        if parts.next().is_some() {
            return Err(CursorError::InvalidOrder(format!("cannot parse '{}'", text)));
        }
        Ok(SortKey {
            column: column.to_string(),
            order,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedKey {
    position: usize,
    descending: bool,
}

/// Resolve sort keys to column positions and append the primary key columns
/// the keys do not mention.
fn resolve_order(schema: &Schema, keys: &[SortKey]) -> Result<Vec<ResolvedKey>> {
    let mut resolved: Vec<ResolvedKey> = Vec::with_capacity(keys.len() + schema.primary_key.len());
    for key in keys {
        let position = schema.require_column(&key.column)?;
        if resolved.iter().any(|r| r.position == position) {
            return Err(CursorError::InvalidOrder(format!(
                "column '{}' is ordered twice",
                key.column
            )));
        }
        resolved.push(ResolvedKey {
            position,
            descending: key.order == SortOrder::Descending,
        });
    }
    for position in schema.primary_key_positions() {
        if !resolved.iter().any(|r| r.position == position) {
            resolved.push(ResolvedKey {
                position,
                descending: false,
            });
        }
    }
    Ok(resolved)
}

fn compare_rows(order: &[ResolvedKey], a: &[ColumnValue], b: &[ColumnValue]) -> Ordering {
    for key in order {
        let cmp = a[key.position].cmp(&b[key.position]);
        let cmp = if key.descending { cmp.reverse() } else { cmp };
        if cmp != Ordering::Equal {
            return cmp;
        }
    }
    Ordering::Equal
}

/// Offset/row-count window; a row count of 0 means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Window {
    offset: usize,
    row_count: usize,
}

impl Window {
    fn apply(self, rows: Vec<StoredRow>) -> Vec<StoredRow> {
        if self == Window::default() {
            return rows;
        }
        let take = if self.row_count == 0 {
            usize::MAX
        } else {
            self.row_count
        };
        rows.into_iter().skip(self.offset).take(take).collect()
    }

    fn clamp(self, total: usize) -> usize {
        let remaining = total.saturating_sub(self.offset);
        if self.row_count == 0 {
            remaining
        } else {
            remaining.min(self.row_count)
        }
    }
}

// ============================================================================
// Visibility and scans
// ============================================================================

/// Constraints and lookup of one cursor, shared with the lookups that read
/// through it.
#[derive(Default)]
pub(crate) struct FilterState {
    filters: BTreeMap<usize, ColumnFilter>,
    lookup: Option<FieldsLookup>,
}

/// A snapshot of everything deciding whether a row is visible
pub(crate) struct Visibility {
    filters: Vec<(usize, ColumnFilter)>,
    lookups: Vec<LookupConstraint>,
}

impl Visibility {
    pub(crate) fn accepts(&self, row: &[ColumnValue]) -> bool {
        self.filters.iter().all(|(p, f)| f.matches(&row[*p]))
            && self.lookups.iter().all(|l| l.accepts(row))
    }

    /// Values pinned by exact constraints on the leading primary key columns.
    fn key_prefix(&self, schema: &Schema) -> Key {
        let mut prefix = Key::new();
        for position in schema.primary_key_positions() {
            let pinned = self
                .filters
                .iter()
                .find(|(p, _)| *p == position)
                .and_then(|(_, f)| f.exact_value())
                .filter(|v| schema.columns[position].column_type.is_native(v));
            match pinned {
                Some(value) => prefix.push(value.clone()),
                None => break,
            }
        }
        prefix
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ScanPlan {
    PrimaryKey { prefix: Key, reverse: bool },
    Index { index: usize, reverse: bool },
    Sort,
}

impl ScanPlan {
    fn choose(schema: &Schema, order: &[ResolvedKey], visibility: &Visibility) -> ScanPlan {
        let positions: Vec<usize> = order.iter().map(|k| k.position).collect();
        let ascending = order.iter().all(|k| !k.descending);
        let descending = order.iter().all(|k| k.descending);
        if !ascending && !descending {
            return ScanPlan::Sort;
        }
        let pk = schema.primary_key_positions();
        if positions == pk {
            return ScanPlan::PrimaryKey {
                prefix: visibility.key_prefix(schema),
                reverse: descending,
            };
        }
        for (i, index) in schema.indices.iter().enumerate() {
            let mut expected: Vec<usize> = index
                .columns
                .iter()
                .filter_map(|c| schema.column_index(c))
                .collect();
            let extra: Vec<usize> = pk.iter().copied().filter(|p| !expected.contains(p)).collect();
            expected.extend(extra);
            if positions == expected {
                return ScanPlan::Index {
                    index: i,
                    reverse: descending,
                };
            }
        }
        ScanPlan::Sort
    }
}

/// The parts of a cursor a scan needs. Lookups keep one of these per
/// auxiliary cursor so they always see its current constraints.
#[derive(Clone)]
pub(crate) struct RowSource {
    pub(crate) schema: Arc<Schema>,
    pub(crate) table: Arc<RwLock<Table>>,
    pub(crate) state: Rc<RefCell<FilterState>>,
    pub(crate) session: u64,
}

impl RowSource {
    pub(crate) fn same_cursor(&self, other: &RowSource) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Whether scanning this source reads through `other`.
    pub(crate) fn depends_on(&self, other: &RowSource) -> bool {
        self.same_cursor(other)
            || self
                .state
                .borrow()
                .lookup
                .as_ref()
                .map_or(false, |lookup| lookup.depends_on(other))
    }

    /// Check that `auxiliary` may serve a lookup on this source.
    pub(crate) fn check_lookup_partner(&self, auxiliary: &RowSource) -> Result<()> {
        if self.session != auxiliary.session {
            return Err(CursorError::ForeignSession);
        }
        if auxiliary.depends_on(self) {
            return Err(CursorError::InvalidLookup(format!(
                "cursor over '{}' cannot look up rows through itself",
                self.schema.name
            )));
        }
        Ok(())
    }

    /// Evaluate the constraints and the lookup chain. Auxiliary cursors are
    /// scanned here, before the caller locks its own table.
    pub(crate) fn visibility(&self) -> Visibility {
        let state = self.state.borrow();
        Visibility {
            filters: state
                .filters
                .iter()
                .map(|(p, f)| (*p, f.clone()))
                .collect(),
            lookups: state
                .lookup
                .as_ref()
                .map(FieldsLookup::compile)
                .unwrap_or_default(),
        }
    }

    /// Distinct tuples of the given columns over the visible rows, ignoring
    /// any window. Tuples containing NULL never match and are left out.
    pub(crate) fn visible_projection(&self, positions: &[usize]) -> HashSet<Key> {
        let visibility = self.visibility();
        let table = self.table.read();
        table
            .rows()
            .filter(|(_, row)| visibility.accepts(&row.values))
            .map(|(_, row)| positions.iter().map(|&p| row.values[p].clone()).collect::<Key>())
            .filter(|tuple| !tuple.iter().any(ColumnValue::is_null))
            .collect()
    }

    pub(crate) fn count_visible(&self) -> usize {
        let visibility = self.visibility();
        let prefix = visibility.key_prefix(&self.schema);
        let table = self.table.read();
        table
            .rows_with_prefix(&prefix)
            .filter(|(_, row)| visibility.accepts(&row.values))
            .count()
    }

    /// Visible rows in `order`, restricted to `window`.
    pub(crate) fn scan(&self, order: &[ResolvedKey], window: Window) -> Vec<StoredRow> {
        let visibility = self.visibility();
        let plan = ScanPlan::choose(&self.schema, order, &visibility);
        log::trace!("scan '{}' using {:?}", self.schema.name, plan);

        let table = self.table.read();
        let visible = |row: &&StoredRow| visibility.accepts(&row.values);
        let rows = match plan {
            ScanPlan::PrimaryKey { prefix, reverse } => {
                let mut rows: Vec<StoredRow> = table
                    .rows_with_prefix(&prefix)
                    .map(|(_, row)| row)
                    .filter(visible)
                    .cloned()
                    .collect();
                if reverse {
                    rows.reverse();
                }
                rows
            }
            ScanPlan::Index { index, reverse } => {
                let mut keys: Vec<Key> = table.keys_by_index(index).collect();
                if reverse {
                    keys.reverse();
                }
                keys.iter()
                    .filter_map(|key| table.get(key))
                    .filter(visible)
                    .cloned()
                    .collect()
            }
            ScanPlan::Sort => {
                let mut rows: Vec<StoredRow> =
                    table.rows().map(|(_, row)| row).filter(visible).cloned().collect();
                rows.sort_by(|a, b| compare_rows(order, &a.values, &b.values));
                rows
            }
        };
        window.apply(rows)
    }
}

// ============================================================================
// Row views
// ============================================================================

/// One row produced by [`Cursor::iterate`]
#[derive(Debug, Clone, PartialEq)]
pub struct RowView {
    schema: Arc<Schema>,
    values: Vec<ColumnValue>,
}

impl RowView {
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.schema.column_index(column).map(|p| &self.values[p])
    }

    pub fn values(&self) -> &[ColumnValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<ColumnValue> {
        self.values
    }

    pub fn as_csv_line(&self) -> String {
        csv_line(&self.values)
    }
}

/// Lazy iterator over a cursor's rows. The scan runs on the first call to
/// `next`; later changes to the cursor do not affect an iterator that has
/// started.
pub struct RowIter {
    source: RowSource,
    order: Vec<ResolvedKey>,
    window: Window,
    rows: Option<std::vec::IntoIter<StoredRow>>,
}

impl Iterator for RowIter {
    type Item = RowView;

    fn next(&mut self) -> Option<RowView> {
        let source = &self.source;
        let order = &self.order;
        let window = self.window;
        let rows = self
            .rows
            .get_or_insert_with(|| source.scan(order, window).into_iter());
        rows.next().map(|row| RowView {
            schema: Arc::clone(&source.schema),
            values: row.values,
        })
    }
}

fn csv_line(values: &[ColumnValue]) -> String {
    values
        .iter()
        .map(ColumnValue::to_csv_field)
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Cursor
// ============================================================================

pub struct Cursor {
    db: Arc<Database>,
    session: u64,
    schema: Arc<Schema>,
    table: Arc<RwLock<Table>>,
    state: Rc<RefCell<FilterState>>,
    order: Vec<SortKey>,
    resolved: Vec<ResolvedKey>,
    window: Window,
    buffer: Vec<ColumnValue>,
    x_rec: Option<Vec<ColumnValue>>,
    version: Option<u64>,
    /// Primary key of the row last read, written or deleted; `next` and
    /// `previous` move on from it
    loaded_key: Option<Key>,
}

impl Cursor {
    pub(crate) fn new(db: Arc<Database>, session: u64, relation: &str) -> Result<Self> {
        let table = db.relation(relation)?;
        let schema = Arc::clone(table.read().schema());
        let resolved = resolve_order(&schema, &[])?;
        Ok(Cursor {
            db,
            session,
            buffer: vec![ColumnValue::Null; schema.len()],
            schema,
            table,
            state: Rc::new(RefCell::new(FilterState::default())),
            order: Vec::new(),
            resolved,
            window: Window::default(),
            x_rec: None,
            version: None,
            loaded_key: None,
        })
    }

    pub fn relation_name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// A handle on the session this cursor belongs to, e.g. for opening
    /// further cursors from a hook.
    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.db), self.session)
    }

    pub(crate) fn source(&self) -> RowSource {
        RowSource {
            schema: Arc::clone(&self.schema),
            table: Arc::clone(&self.table),
            state: Rc::clone(&self.state),
            session: self.session,
        }
    }

    // ========================================================================
    // Constraints
    // ========================================================================

    /// Restrict the cursor to rows whose `column` equals `value`. A NULL
    /// value selects rows where the column is null. Replaces any earlier
    /// constraint on the column.
    pub fn set_range(&mut self, column: &str, value: impl Into<ColumnValue>) -> Result<()> {
        let (position, value) = self.constraint_value(column, value.into())?;
        self.state
            .borrow_mut()
            .filters
            .insert(position, ColumnFilter::Single(value));
        Ok(())
    }

    /// Restrict `column` to the inclusive range `from..=to`.
    pub fn set_range_between(
        &mut self,
        column: &str,
        from: impl Into<ColumnValue>,
        to: impl Into<ColumnValue>,
    ) -> Result<()> {
        let (position, from) = self.constraint_value(column, from.into())?;
        let (_, to) = self.constraint_value(column, to.into())?;
        self.state
            .borrow_mut()
            .filters
            .insert(position, ColumnFilter::Range(from, to));
        Ok(())
    }

    /// Restrict `column` with a filter expression such as `>5`, `1..10`,
    /// `'abc'%` or `!null`.
    pub fn set_filter(&mut self, column: &str, filter: &str) -> Result<()> {
        let position = self.schema.require_column(column)?;
        let expr = parse_filter(&self.schema.columns[position], filter)?;
        self.state.borrow_mut().filters.insert(
            position,
            ColumnFilter::Expression {
                text: filter.to_string(),
                expr,
            },
        );
        Ok(())
    }

    pub fn clear_range(&mut self, column: &str) -> Result<()> {
        let position = self.schema.require_column(column)?;
        self.state.borrow_mut().filters.remove(&position);
        Ok(())
    }

    fn constraint_value(&self, column: &str, value: ColumnValue) -> Result<(usize, ColumnValue)> {
        let position = self.schema.require_column(column)?;
        let column_type = self.schema.columns[position].column_type;
        if !column_type.accepts(&value) {
            return Err(CursorError::TypeMismatch {
                column: column.to_string(),
                expected: column_type.to_string(),
                found: value.type_name().to_string(),
            });
        }
        Ok((position, column_type.normalize(value)))
    }

    /// Drop constraints, lookup, order and window. The buffer is kept.
    pub fn reset(&mut self) {
        {
            let mut state = self.state.borrow_mut();
            state.filters.clear();
            state.lookup = None;
        }
        self.order.clear();
        self.resolved = self
            .schema
            .primary_key_positions()
            .into_iter()
            .map(|position| ResolvedKey {
                position,
                descending: false,
            })
            .collect();
        self.window = Window::default();
    }

    /// `reset` plus an emptied buffer.
    pub fn clear(&mut self) {
        self.reset();
        self.clear_buffer(true);
    }

    /// Copy constraints, lookup and window from another cursor over the
    /// same relation. The lookup chain is copied, so extending it through
    /// either cursor later leaves the other alone.
    pub fn copy_filters_from(&mut self, other: &Cursor) -> Result<()> {
        self.check_same_relation(other)?;
        let source = self.source();
        let (filters, lookup) = {
            let state = other.state.borrow();
            let lookup = state.lookup.as_ref().map(|lookup| lookup.copy_for(&source));
            (state.filters.clone(), lookup)
        };
        if let Some(lookup) = &lookup {
            if lookup.depends_on(&source) {
                return Err(CursorError::InvalidLookup(format!(
                    "cursor over '{}' cannot look up rows through itself",
                    self.schema.name
                )));
            }
        }
        let mut state = self.state.borrow_mut();
        state.filters = filters;
        state.lookup = lookup;
        self.window = other.window;
        Ok(())
    }

    pub fn copy_order_from(&mut self, other: &Cursor) -> Result<()> {
        self.check_same_relation(other)?;
        self.order = other.order.clone();
        self.resolved = other.resolved.clone();
        Ok(())
    }

    fn check_same_relation(&self, other: &Cursor) -> Result<()> {
        if self.session != other.session {
            return Err(CursorError::ForeignSession);
        }
        if self.schema.name != other.schema.name {
            return Err(CursorError::RelationMismatch {
                expected: self.schema.name.clone(),
                found: other.schema.name.clone(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Install a new, empty lookup against `auxiliary` and return it for
    /// adding column pairs. Replaces any lookup installed before.
    pub fn set_in(&mut self, auxiliary: &Cursor) -> Result<FieldsLookup> {
        let source = self.source();
        source.check_lookup_partner(&auxiliary.source())?;
        let lookup = FieldsLookup::new(source, auxiliary.source());
        self.state.borrow_mut().lookup = Some(lookup.clone());
        Ok(lookup)
    }

    /// Install a lookup built for this cursor.
    pub fn set_in_lookup(&mut self, lookup: FieldsLookup) -> Result<()> {
        let source = self.source();
        if !lookup.targets(&source) {
            return Err(CursorError::InvalidLookup(format!(
                "lookup on '{}' was built for another cursor",
                lookup.target_relation()
            )));
        }
        if lookup.depends_on(&source) {
            return Err(CursorError::InvalidLookup(format!(
                "cursor over '{}' cannot look up rows through itself",
                self.schema.name
            )));
        }
        self.state.borrow_mut().lookup = Some(lookup);
        Ok(())
    }

    pub fn clear_lookup(&mut self) {
        self.state.borrow_mut().lookup = None;
    }

    pub fn lookup(&self) -> Option<FieldsLookup> {
        self.state.borrow().lookup.clone()
    }

    // ========================================================================
    // Order and window
    // ========================================================================

    /// Order by `"column [ASC|DESC]"` entries. An empty list restores
    /// primary key order.
    pub fn order_by(&mut self, columns: &[&str]) -> Result<()> {
        let keys = columns
            .iter()
            .map(|c| SortKey::parse(c))
            .collect::<Result<Vec<_>>>()?;
        self.order_by_keys(keys)
    }

    pub fn order_by_keys(&mut self, keys: Vec<SortKey>) -> Result<()> {
        self.resolved = resolve_order(&self.schema, &keys)?;
        self.order = keys;
        Ok(())
    }

    pub fn order(&self) -> &[SortKey] {
        &self.order
    }

    /// Skip `offset` rows and return at most `row_count` (0 for all).
    pub fn limit(&mut self, offset: usize, row_count: usize) {
        self.window = Window { offset, row_count };
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    fn ordered_rows(&self) -> Vec<StoredRow> {
        self.source().scan(&self.resolved, self.window)
    }

    fn load(&mut self, row: StoredRow) {
        self.loaded_key = Some(self.schema.key_of(&row.values));
        self.version = Some(row.version);
        self.buffer = row.values.clone();
        self.x_rec = Some(row.values);
    }

    pub fn first(&mut self) -> bool {
        match self.ordered_rows().into_iter().next() {
            Some(row) => {
                self.load(row);
                true
            }
            None => false,
        }
    }

    pub fn last(&mut self) -> bool {
        match self.ordered_rows().pop() {
            Some(row) => {
                self.load(row);
                true
            }
            None => false,
        }
    }

    /// Move to the row after the buffer. Without a current row this is
    /// `first()`.
    pub fn next(&mut self) -> bool {
        self.step(true, 1)
    }

    /// Move to the row before the buffer. Without a current row this is
    /// `last()`.
    pub fn previous(&mut self) -> bool {
        self.step(false, 1)
    }

    fn step(&mut self, forward: bool, offset: usize) -> bool {
        let rows = self.ordered_rows();
        let target = if self.loaded_key.is_none() {
            if forward {
                offset.checked_sub(1)
            } else {
                rows.len().checked_sub(offset)
            }
        } else if forward {
            let after = rows.partition_point(|row| {
                compare_rows(&self.resolved, &row.values, &self.buffer) != Ordering::Greater
            });
            after.checked_add(offset - 1)
        } else {
            let before = rows.partition_point(|row| {
                compare_rows(&self.resolved, &row.values, &self.buffer) == Ordering::Less
            });
            before.checked_sub(offset)
        };
        log::trace!(
            "step {} by {} on '{}' to {:?} of {}",
            if forward { "forward" } else { "back" },
            offset,
            self.schema.name,
            target,
            rows.len()
        );
        match target.and_then(|i| rows.into_iter().nth(i)) {
            Some(row) => {
                self.load(row);
                true
            }
            None => false,
        }
    }

    /// Reload the visible row whose primary key equals the buffer's.
    fn seek_current(&mut self) -> bool {
        let key = self.schema.key_of(&self.buffer);
        let found = self
            .ordered_rows()
            .into_iter()
            .find(|row| self.schema.key_of(&row.values) == key);
        match found {
            Some(row) => {
                self.load(row);
                true
            }
            None => false,
        }
    }

    /// Move `offset` rows in `direction` (`'>'` forward, `'<'` back), or
    /// re-read the current row with `'='` or an offset of 0. Returns `false`
    /// and stays put when fewer than `offset` rows are available.
    pub fn navigate_by(&mut self, direction: char, offset: usize) -> Result<bool> {
        match direction {
            '>' | '<' | '=' if offset == 0 => Ok(self.seek_current()),
            '>' => Ok(self.step(true, offset)),
            '<' => Ok(self.step(false, offset)),
            '=' => Ok(self.seek_current()),
            other => Err(CursorError::InvalidNavigation(format!(
                "unknown direction '{}'",
                other
            ))),
        }
    }

    /// Try each command character in turn until one moves the cursor:
    /// `-` first, `+` last, `>` next, `<` previous, `=` current.
    pub fn navigate(&mut self, command: &str) -> Result<bool> {
        if command.is_empty() {
            return Err(CursorError::InvalidNavigation("empty command".to_string()));
        }
        if let Some(bad) = command.chars().find(|c| !"-+<>=".contains(*c)) {
            return Err(CursorError::InvalidNavigation(format!(
                "unknown command '{}' in '{}'",
                bad, command
            )));
        }
        for c in command.chars() {
            let moved = match c {
                '-' => self.first(),
                '+' => self.last(),
                '>' => self.next(),
                '<' => self.previous(),
                _ => self.seek_current(),
            };
            if moved {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Number of visible rows, window applied.
    pub fn count(&self) -> usize {
        self.window.clamp(self.source().count_visible())
    }

    /// Number of visible rows sorting before the buffer.
    pub fn position(&self) -> usize {
        self.ordered_rows().partition_point(|row| {
            compare_rows(&self.resolved, &row.values, &self.buffer) == Ordering::Less
        })
    }

    /// Lazily iterate the visible rows in order. The buffer does not move.
    pub fn iterate(&self) -> RowIter {
        RowIter {
            source: self.source(),
            order: self.resolved.clone(),
            window: self.window,
            rows: None,
        }
    }

    // ========================================================================
    // Primary key access
    // ========================================================================

    /// Read the row with this primary key, ignoring constraints.
    pub fn get(&mut self, key: &[ColumnValue]) -> Result<()> {
        if self.try_get(key)? {
            Ok(())
        } else {
            Err(CursorError::NotFound {
                relation: self.schema.name.clone(),
                key: format_key(key),
            })
        }
    }

    pub fn try_get(&mut self, key: &[ColumnValue]) -> Result<bool> {
        let positions = self.schema.primary_key_positions();
        if key.len() != positions.len() {
            return Err(CursorError::InvalidKey(format!(
                "relation '{}' has a primary key of {} columns, got {} values",
                self.schema.name,
                positions.len(),
                key.len()
            )));
        }
        let key = positions
            .iter()
            .zip(key)
            .map(|(&p, v)| self.schema.columns[p].coerce(v.clone()))
            .collect::<Result<Key>>()?;
        Ok(self.fetch(&key))
    }

    /// Re-read the row whose primary key is in the buffer.
    pub fn try_get_current(&mut self) -> Result<bool> {
        let key = self.buffer_key()?;
        Ok(self.fetch(&key))
    }

    fn fetch(&mut self, key: &[ColumnValue]) -> bool {
        let row = self.table.read().get(key).cloned();
        match row {
            Some(row) => {
                self.load(row);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Buffer
    // ========================================================================

    /// Set a buffer field. Non-null values are checked against the column
    /// right away; nullability is checked when the row is written.
    pub fn set_value(&mut self, column: &str, value: impl Into<ColumnValue>) -> Result<()> {
        let position = self.schema.require_column(column)?;
        let value = value.into();
        self.buffer[position] = if value.is_null() {
            ColumnValue::Null
        } else {
            self.schema.columns[position].coerce(value)?
        };
        Ok(())
    }

    pub fn value(&self, column: &str) -> Result<&ColumnValue> {
        let position = self.schema.require_column(column)?;
        Ok(&self.buffer[position])
    }

    pub fn values(&self) -> &[ColumnValue] {
        &self.buffer
    }

    /// The row as last read or written.
    pub fn x_rec(&self) -> Option<&[ColumnValue]> {
        self.x_rec.as_deref()
    }

    /// Record version of the row as last read or written.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Null every buffer field, or every non-key field when `with_keys` is
    /// false.
    pub fn clear_buffer(&mut self, with_keys: bool) {
        for (position, value) in self.buffer.iter_mut().enumerate() {
            if with_keys || !self.schema.is_primary_key_column(position) {
                *value = ColumnValue::Null;
            }
        }
        if with_keys {
            self.loaded_key = None;
            self.version = None;
            self.x_rec = None;
        }
    }

    /// Copy same-named fields of comparable type from another cursor's
    /// buffer.
    pub fn copy_fields_from(&mut self, other: &Cursor) {
        for (position, column) in self.schema.columns.iter().enumerate() {
            if let Some(from) = other.schema.column_index(&column.name) {
                if column
                    .column_type
                    .is_comparable_with(&other.schema.columns[from].column_type)
                {
                    self.buffer[position] = other.buffer[from].clone();
                }
            }
        }
    }

    /// The buffer as one CSV line in column order.
    pub fn as_csv_line(&self) -> String {
        csv_line(&self.buffer)
    }

    /// A header line plus one line per visible row.
    pub fn to_csv(&self) -> String {
        let mut out = self.schema.column_names().join(",");
        out.push('\n');
        for row in self.ordered_rows() {
            out.push_str(&csv_line(&row.values));
            out.push('\n');
        }
        out
    }

    fn buffer_key(&self) -> Result<Key> {
        self.schema
            .primary_key_positions()
            .into_iter()
            .map(|p| self.schema.columns[p].coerce(self.buffer[p].clone()))
            .collect()
    }

    fn coerced_buffer(&self) -> Result<Vec<ColumnValue>> {
        self.schema
            .columns
            .iter()
            .zip(&self.buffer)
            .map(|(column, value)| column.coerce(value.clone()))
            .collect()
    }

    fn apply_defaults(&mut self) -> Result<()> {
        for (position, column) in self.schema.columns.iter().enumerate() {
            if !self.buffer[position].is_null() {
                continue;
            }
            let value = match &column.default {
                None => continue,
                Some(ColumnDefault::Value(text)) => {
                    column.column_type.parse_literal(text).ok_or_else(|| {
                        CursorError::InvalidCatalog(format!(
                            "default '{}' of column '{}' is not a valid {}",
                            text, column.name, column.column_type
                        ))
                    })?
                }
                Some(ColumnDefault::NextVal(sequence)) => {
                    ColumnValue::Int(self.db.sequence(sequence)?.next_value()?)
                }
            };
            self.buffer[position] = value;
        }
        Ok(())
    }

    fn remember(&mut self, values: Vec<ColumnValue>, version: Option<u64>) {
        self.loaded_key = Some(self.schema.key_of(&values));
        self.version = version;
        self.buffer = values.clone();
        self.x_rec = Some(values);
    }

    // ========================================================================
    // Writes
    // ========================================================================

    fn check_writable(&self) -> Result<()> {
        if self.schema.is_read_only() {
            return Err(CursorError::ReadOnly(self.schema.name.clone()));
        }
        Ok(())
    }

    fn fire(&mut self, trigger: TriggerType) -> Result<()> {
        let db = Arc::clone(&self.db);
        db.triggers().fire(self, trigger)
    }

    /// Apply a change to the table and every dependent view, or to none of
    /// them. View state is locked before the table and released last.
    fn write_through<F>(&self, prepare: F) -> Result<Option<(TableChange, Option<u64>)>>
    where
        F: FnOnce(&Table) -> Result<Option<TableChange>>,
    {
        let views = self.db.dependent_views(&self.schema.name);
        let mut states: Vec<_> = views.iter().map(|view| view.lock()).collect();

        let mut table = self.table.write();
        let change = match prepare(&table)? {
            Some(change) => change,
            None => return Ok(None),
        };
        let deltas = states
            .iter()
            .map(|state| state.prepare(&change))
            .collect::<Result<Vec<_>>>()?;
        table.apply_change(&change);
        let version = table.get(change.key()).map(|row| row.version);
        drop(table);

        log::debug!(
            "{} {} in '{}'",
            match change {
                TableChange::RowInserted { .. } => "inserted",
                TableChange::RowUpdated { .. } => "updated",
                TableChange::RowDeleted { .. } => "deleted",
            },
            format_key(change.key()),
            self.schema.name
        );
        for (state, delta) in states.iter_mut().zip(deltas) {
            state.commit(delta);
        }
        Ok(Some((change, version)))
    }

    /// Insert the buffer as a new row. Pre-insert hooks run first, then
    /// column defaults fill null fields.
    pub fn insert(&mut self) -> Result<()> {
        self.check_writable()?;
        self.fire(TriggerType::PreInsert)?;
        self.write_insert()?;
        self.fire(TriggerType::PostInsert)
    }

    /// Like `insert`, returning `false` when the primary key is taken.
    pub fn try_insert(&mut self) -> Result<bool> {
        self.check_writable()?;
        self.fire(TriggerType::PreInsert)?;
        match self.write_insert() {
            Ok(()) => {}
            Err(CursorError::DuplicateKey { .. }) => return Ok(false),
            Err(err) => return Err(err),
        }
        self.fire(TriggerType::PostInsert)?;
        Ok(true)
    }

    fn write_insert(&mut self) -> Result<()> {
        self.apply_defaults()?;
        let values = self.coerced_buffer()?;
        let row = values.clone();
        if let Some((_, version)) =
            self.write_through(move |table| table.prepare_insert(row).map(Some))?
        {
            self.remember(values, version);
        }
        Ok(())
    }

    /// Write the buffer over the stored row with the same primary key.
    ///
    /// On versioned relations the update fails with `VersionConflict` when
    /// the row changed since this cursor read it. Writing a row identical to
    /// the stored one changes nothing and skips the post-update hooks.
    pub fn update(&mut self) -> Result<()> {
        self.check_writable()?;
        self.fire(TriggerType::PreUpdate)?;
        if self.write_update()? {
            self.fire(TriggerType::PostUpdate)?;
        }
        Ok(())
    }

    /// Like `update`, returning `false` when no row has the buffer's key.
    /// Pre-update hooks run either way.
    pub fn try_update(&mut self) -> Result<bool> {
        self.check_writable()?;
        self.fire(TriggerType::PreUpdate)?;
        match self.write_update() {
            Ok(true) => self.fire(TriggerType::PostUpdate)?,
            Ok(false) => {}
            Err(CursorError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    fn write_update(&mut self) -> Result<bool> {
        let values = self.coerced_buffer()?;
        let key = self.schema.key_of(&values);
        let expected = if self.loaded_key.as_ref() == Some(&key) {
            self.version
        } else {
            None
        };
        let row = values.clone();
        match self.write_through(move |table| table.prepare_update(row, expected))? {
            Some((_, version)) => {
                self.remember(values, version);
                Ok(true)
            }
            None => {
                self.buffer = values;
                Ok(false)
            }
        }
    }

    /// Delete the row whose primary key is in the buffer.
    pub fn delete(&mut self) -> Result<()> {
        self.check_writable()?;
        self.fire(TriggerType::PreDelete)?;
        let key = self.buffer_key()?;
        if let Some((change, _)) = self.write_through(|table| table.prepare_delete(&key).map(Some))? {
            self.x_rec = change.old_row().map(<[ColumnValue]>::to_vec);
        }
        self.version = None;
        self.fire(TriggerType::PostDelete)
    }

    /// Delete every visible row, window ignored, one by one with hooks.
    /// Returns the number of rows deleted.
    pub fn delete_all(&mut self) -> Result<usize> {
        self.check_writable()?;
        let keys: Vec<Key> = self
            .source()
            .scan(&self.resolved, Window::default())
            .into_iter()
            .map(|row| self.schema.key_of(&row.values))
            .collect();
        let mut deleted = 0;
        for key in keys {
            if !self.fetch(&key) {
                continue;
            }
            self.delete()?;
            deleted += 1;
        }
        log::debug!("deleted {} rows from '{}'", deleted, self.schema.name);
        Ok(deleted)
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        write!(
            f,
            "Cursor {{ relation: '{}', session: {}, filters: {}, lookup: {}, order: {:?}, buffer: {} }}",
            self.schema.name,
            self.session,
            state.filters.len(),
            state.lookup.is_some(),
            self.order,
            format_key(&self.buffer)
        )
    }
}
