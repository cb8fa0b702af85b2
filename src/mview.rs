/// Materialized aggregate views
///
/// A materialized view groups the rows of a source table by a key tuple and
/// keeps SUM, COUNT, MIN and MAX aggregates per group. It never rescans the
/// source on writes: every insert, update or delete of a source row is turned
/// into a delta over the affected groups.
///
/// - Insert: the row's group is created on first use (SUM 0, COUNT 0,
///   MIN/MAX null) and the row's values are added.
/// - Delete: the row's values are retracted. MIN/MAX come from an ordered
///   multiset per group, so retracting the current extremum is cheap.
/// - Update: the old image is retracted and the new image added, moving the
///   row between groups when its key changed.
///
/// Groups stay in place when their last row goes away, unless the view was
/// declared with `drop_empty_groups`. `rebuild()` re-derives every group from
/// the source and drops groups without rows.
///
/// The view's rows live in a read-only backing table whose primary key is the
/// group key, so they can be read with an ordinary cursor.

use crate::changeset::{IncrementalView, TableChange};
use crate::column::{Column, ColumnType, ColumnValue};
use crate::error::{CursorError, Result};
use crate::table::{format_key, Key, RelationKind, Schema, Table};
use chrono::{NaiveTime, TimeZone, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Transformation applied to a source value before grouping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyTransform {
    #[default]
    None,
    /// Zero the time of day; zoned timestamps are truncated in UTC
    TruncateToDay,
}

impl KeyTransform {
    pub fn apply(self, value: &ColumnValue) -> ColumnValue {
        match (self, value) {
            (KeyTransform::TruncateToDay, ColumnValue::DateTime(dt)) => {
                ColumnValue::DateTime(dt.date().and_time(NaiveTime::MIN))
            }
            (KeyTransform::TruncateToDay, ColumnValue::ZonedDateTime(dt)) => {
                let midnight = dt.date_naive().and_time(NaiveTime::MIN);
                ColumnValue::ZonedDateTime(Utc.from_utc_datetime(&midnight))
            }
            _ => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupColumn {
    /// Column name in the view
    pub name: String,
    /// Column of the source table
    pub source: String,
    #[serde(default)]
    pub transform: KeyTransform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum Aggregate {
    Sum { name: String, source: String },
    Count { name: String },
    Min { name: String, source: String },
    Max { name: String, source: String },
}

impl Aggregate {
    pub fn name(&self) -> &str {
        match self {
            Aggregate::Sum { name, .. }
            | Aggregate::Count { name }
            | Aggregate::Min { name, .. }
            | Aggregate::Max { name, .. } => name,
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Aggregate::Sum { source, .. }
            | Aggregate::Min { source, .. }
            | Aggregate::Max { source, .. } => Some(source),
            Aggregate::Count { .. } => None,
        }
    }
}

/// Declaration of a materialized view.
///
/// # Examples
///
/// ```
/// use livecursor::MaterializedViewDef;
///
/// let def = MaterializedViewDef::new("sales_by_day", "sales")
///     .group_by_day("day", "sold_at")
///     .sum("total", "amount")
///     .count("orders");
/// assert_eq!(def.group_by.len(), 1);
/// assert_eq!(def.aggregates.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedViewDef {
    pub name: String,
    pub source: String,
    pub group_by: Vec<GroupColumn>,
    pub aggregates: Vec<Aggregate>,
    #[serde(default)]
    pub drop_empty_groups: bool,
}

impl MaterializedViewDef {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        MaterializedViewDef {
            name: name.into(),
            source: source.into(),
            group_by: Vec::new(),
            aggregates: Vec::new(),
            drop_empty_groups: false,
        }
    }

    pub fn group_by(mut self, name: &str, source: &str) -> Self {
        self.group_by.push(GroupColumn {
            name: name.to_string(),
            source: source.to_string(),
            transform: KeyTransform::None,
        });
        self
    }

    pub fn group_by_day(mut self, name: &str, source: &str) -> Self {
        self.group_by.push(GroupColumn {
            name: name.to_string(),
            source: source.to_string(),
            transform: KeyTransform::TruncateToDay,
        });
        self
    }

    pub fn sum(mut self, name: &str, source: &str) -> Self {
        self.aggregates.push(Aggregate::Sum {
            name: name.to_string(),
            source: source.to_string(),
        });
        self
    }

    pub fn count(mut self, name: &str) -> Self {
        self.aggregates.push(Aggregate::Count {
            name: name.to_string(),
        });
        self
    }

    pub fn min(mut self, name: &str, source: &str) -> Self {
        self.aggregates.push(Aggregate::Min {
            name: name.to_string(),
            source: source.to_string(),
        });
        self
    }

    pub fn max(mut self, name: &str, source: &str) -> Self {
        self.aggregates.push(Aggregate::Max {
            name: name.to_string(),
            source: source.to_string(),
        });
        self
    }

    pub fn drop_empty_groups(mut self, drop: bool) -> Self {
        self.drop_empty_groups = drop;
        self
    }

    /// Schema of the backing table: group columns (the primary key) followed
    /// by one column per aggregate.
    pub fn backing_schema(&self, source: &Schema) -> Result<Schema> {
        let invalid = |reason: String| {
            CursorError::InvalidCatalog(format!("materialized view '{}': {}", self.name, reason))
        };
        let source_column = |name: &str| {
            source
                .column(name)
                .ok_or_else(|| invalid(format!("unknown source column '{}'", name)))
        };
        if self.group_by.is_empty() {
            return Err(invalid("no group by columns".to_string()));
        }

        let mut columns = Vec::new();
        let mut names = HashSet::new();
        for group in &self.group_by {
            let column = source_column(&group.source)?;
            if group.transform == KeyTransform::TruncateToDay
                && !matches!(column.column_type, ColumnType::DateTime | ColumnType::ZonedDateTime)
            {
                return Err(invalid(format!("'{}' is not a date-time column", group.source)));
            }
            columns.push(Column::new(group.name.clone(), column.column_type, column.nullable));
        }
        for aggregate in &self.aggregates {
            let column = match aggregate {
                Aggregate::Count { name } => Column::new(name.clone(), ColumnType::Int, false),
                Aggregate::Sum { name, source } => {
                    let column_type = match source_column(source)?.column_type {
                        ColumnType::Decimal { scale, .. } => ColumnType::decimal(crate::column::MAX_DECIMAL_PRECISION, scale),
                        t if t.is_numeric() => t,
                        t => return Err(invalid(format!("cannot sum '{}' of type {}", source, t))),
                    };
                    Column::new(name.clone(), column_type, false)
                }
                Aggregate::Min { name, source } | Aggregate::Max { name, source } => {
                    let column_type = source_column(source)?.column_type;
                    if column_type == ColumnType::Blob {
                        return Err(invalid(format!("cannot compare '{}' of type BLOB", source)));
                    }
                    Column::new(name.clone(), column_type, true)
                }
            };
            columns.push(column);
        }
        for column in &columns {
            if !names.insert(column.name.clone()) {
                return Err(invalid(format!("duplicate column '{}'", column.name)));
            }
        }

        let key: Vec<&str> = self.group_by.iter().map(|g| g.name.as_str()).collect();
        Ok(Schema::new(self.name.clone(), columns, &key).with_kind(RelationKind::MaterializedView))
    }
}

/// Running state of one aggregate within one group
#[derive(Debug, Clone, PartialEq)]
enum AggregateState {
    Sum { total: ColumnValue, contributing: u64 },
    Count { rows: u64 },
    Extremum { max: bool, values: BTreeMap<ColumnValue, u64> },
}

impl AggregateState {
    fn initial(aggregate: &Aggregate, source_type: Option<ColumnType>) -> Self {
        match aggregate {
            Aggregate::Sum { .. } => {
                let total = match source_type {
                    Some(ColumnType::Float) => ColumnValue::Float(0.0),
                    Some(ColumnType::Decimal { scale, .. }) => {
                        ColumnValue::Decimal(Decimal::new(0, scale))
                    }
                    _ => ColumnValue::Int(0),
                };
                AggregateState::Sum { total, contributing: 0 }
            }
            Aggregate::Count { .. } => AggregateState::Count { rows: 0 },
            Aggregate::Min { .. } => AggregateState::Extremum { max: false, values: BTreeMap::new() },
            Aggregate::Max { .. } => AggregateState::Extremum { max: true, values: BTreeMap::new() },
        }
    }

    fn add(&mut self, value: &ColumnValue) -> Result<()> {
        match self {
            AggregateState::Sum { total, contributing } => {
                if !value.is_null() {
                    *total = add_values(total, value, false)?;
                    *contributing += 1;
                }
            }
            AggregateState::Count { rows } => *rows += 1,
            AggregateState::Extremum { values, .. } => {
                if !value.is_null() {
                    *values.entry(value.clone()).or_insert(0) += 1;
                }
            }
        }
        Ok(())
    }

    fn retract(&mut self, value: &ColumnValue) -> Result<()> {
        match self {
            AggregateState::Sum { total, contributing } => {
                if !value.is_null() {
                    *total = add_values(total, value, true)?;
                    *contributing = contributing.saturating_sub(1);
                }
            }
            AggregateState::Count { rows } => *rows = rows.saturating_sub(1),
            AggregateState::Extremum { values, .. } => {
                if let Some(n) = values.get_mut(value) {
                    *n -= 1;
                    if *n == 0 {
                        values.remove(value);
                    }
                }
            }
        }
        Ok(())
    }

    fn value(&self) -> ColumnValue {
        match self {
            AggregateState::Sum { total, .. } => total.clone(),
            AggregateState::Count { rows } => ColumnValue::Int(*rows as i64),
            AggregateState::Extremum { max: false, values } => {
                values.keys().next().cloned().unwrap_or(ColumnValue::Null)
            }
            AggregateState::Extremum { max: true, values } => {
                values.keys().next_back().cloned().unwrap_or(ColumnValue::Null)
            }
        }
    }
}

fn add_values(total: &ColumnValue, value: &ColumnValue, subtract: bool) -> Result<ColumnValue> {
    let overflow = || CursorError::Overflow(format!("sum of {} and {}", total, value));
    match (total, value) {
        (ColumnValue::Int(a), ColumnValue::Int(b)) => {
            let result = if subtract { a.checked_sub(*b) } else { a.checked_add(*b) };
            result.map(ColumnValue::Int).ok_or_else(overflow)
        }
        (ColumnValue::Decimal(a), ColumnValue::Decimal(b)) => {
            let result = if subtract { a.checked_sub(*b) } else { a.checked_add(*b) };
            result.map(ColumnValue::Decimal).ok_or_else(overflow)
        }
        (ColumnValue::Float(a), ColumnValue::Float(b)) => {
            Ok(ColumnValue::Float(if subtract { a - b } else { a + b }))
        }
        _ => Err(CursorError::TypeMismatch {
            column: "sum".to_string(),
            expected: total.type_name().to_string(),
            found: value.type_name().to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Group {
    key: Key,
    /// Source rows currently mapped to this group
    rows: u64,
    aggregates: Vec<AggregateState>,
}

/// New state of every group touched by one source change; `None` removes
/// the group.
#[derive(Debug)]
pub struct GroupDelta {
    groups: Vec<(Key, Option<Group>)>,
}

impl GroupDelta {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// A live materialized view over one source table
pub struct MaterializedView {
    def: MaterializedViewDef,
    source: Arc<RwLock<Table>>,
    backing: Arc<RwLock<Table>>,
    group_positions: Vec<(usize, KeyTransform)>,
    /// Source position of each aggregate's column (`None` for COUNT)
    value_positions: Vec<Option<usize>>,
    template: Vec<AggregateState>,
    /// Group arena, indexed through `slots`
    groups: Vec<Option<Group>>,
    slots: HashMap<Key, usize>,
    free: Vec<usize>,
}

impl MaterializedView {
    /// Create an empty view. `backing` must have been built from
    /// `def.backing_schema(source schema)`.
    pub fn new(
        def: MaterializedViewDef,
        source: Arc<RwLock<Table>>,
        backing: Arc<RwLock<Table>>,
    ) -> Result<Self> {
        let source_schema = Arc::clone(source.read().schema());
        let group_positions = def
            .group_by
            .iter()
            .map(|g| Ok((source_schema.require_column(&g.source)?, g.transform)))
            .collect::<Result<Vec<_>>>()?;
        let value_positions = def
            .aggregates
            .iter()
            .map(|a| a.source().map(|s| source_schema.require_column(s)).transpose())
            .collect::<Result<Vec<_>>>()?;
        let template = def
            .aggregates
            .iter()
            .zip(&value_positions)
            .map(|(a, p)| AggregateState::initial(a, p.map(|p| source_schema.columns[p].column_type)))
            .collect();
        Ok(MaterializedView {
            def,
            source,
            backing,
            group_positions,
            value_positions,
            template,
            groups: Vec::new(),
            slots: HashMap::new(),
            free: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn source_name(&self) -> &str {
        &self.def.source
    }

    pub fn definition(&self) -> &MaterializedViewDef {
        &self.def
    }

    pub fn backing(&self) -> &Arc<RwLock<Table>> {
        &self.backing
    }

    /// Number of groups currently held
    pub fn group_count(&self) -> usize {
        self.slots.len()
    }

    /// Source rows currently contributing to the group with this key
    pub fn contributing_rows(&self, key: &[ColumnValue]) -> Option<u64> {
        self.group(key).map(|g| g.rows)
    }

    fn group(&self, key: &[ColumnValue]) -> Option<&Group> {
        self.slots
            .get(key)
            .and_then(|&slot| self.groups[slot].as_ref())
    }

    fn group_key(&self, row: &[ColumnValue]) -> Key {
        self.group_positions
            .iter()
            .map(|&(p, transform)| transform.apply(&row[p]))
            .collect()
    }

    fn backing_row(group: &Group) -> Vec<ColumnValue> {
        let mut row = group.key.clone();
        row.extend(group.aggregates.iter().map(AggregateState::value));
        row
    }

    fn touch<'a>(&self, touched: &'a mut Vec<(Key, Option<Group>)>, key: Key) -> &'a mut Option<Group> {
        let at = match touched.iter().position(|(k, _)| *k == key) {
            Some(at) => at,
            None => {
                let current = self.group(&key).cloned();
                touched.push((key, current));
                touched.len() - 1
            }
        };
        &mut touched[at].1
    }

    fn add_row(&self, touched: &mut Vec<(Key, Option<Group>)>, row: &[ColumnValue]) -> Result<()> {
        let key = self.group_key(row);
        let template = &self.template;
        let group = self.touch(touched, key.clone()).get_or_insert_with(|| Group {
            key,
            rows: 0,
            aggregates: template.clone(),
        });
        group.rows += 1;
        for (state, position) in group.aggregates.iter_mut().zip(&self.value_positions) {
            state.add(position.map_or(&ColumnValue::Null, |p| &row[p]))?;
        }
        Ok(())
    }

    fn retract_row(&self, touched: &mut Vec<(Key, Option<Group>)>, row: &[ColumnValue]) -> Result<()> {
        let key = self.group_key(row);
        let drop_empty = self.def.drop_empty_groups;
        let slot = self.touch(touched, key.clone());
        let group = match slot.as_mut() {
            Some(group) => group,
            None => {
                log::warn!(
                    "materialized view '{}' has no group {} for a retracted row",
                    self.def.name,
                    format_key(&key)
                );
                return Ok(());
            }
        };
        group.rows = group.rows.saturating_sub(1);
        for (state, position) in group.aggregates.iter_mut().zip(&self.value_positions) {
            state.retract(position.map_or(&ColumnValue::Null, |p| &row[p]))?;
        }
        if drop_empty && group.rows == 0 {
            *slot = None;
        }
        Ok(())
    }

    fn store(&mut self, key: Key, group: Option<Group>) {
        let mut backing = self.backing.write();
        match group {
            Some(group) => {
                let data = Self::backing_row(&group);
                match self.slots.get(&key) {
                    Some(&slot) => self.groups[slot] = Some(group),
                    None => {
                        let slot = match self.free.pop() {
                            Some(slot) => {
                                self.groups[slot] = Some(group);
                                slot
                            }
                            None => {
                                self.groups.push(Some(group));
                                self.groups.len() - 1
                            }
                        };
                        self.slots.insert(key.clone(), slot);
                    }
                }
                backing.apply_change(&TableChange::RowInserted { key, data });
            }
            None => {
                if let Some(slot) = self.slots.remove(&key) {
                    self.groups[slot] = None;
                    self.free.push(slot);
                }
                if let Some(stored) = backing.get(&key) {
                    let data = stored.values.clone();
                    backing.apply_change(&TableChange::RowDeleted { key, data });
                }
            }
        }
    }
}

impl IncrementalView for MaterializedView {
    type Delta = GroupDelta;

    fn prepare(&self, change: &TableChange) -> Result<GroupDelta> {
        let mut touched = Vec::new();
        if let Some(old) = change.old_row() {
            self.retract_row(&mut touched, old)?;
        }
        if let Some(new) = change.new_row() {
            self.add_row(&mut touched, new)?;
        }
        touched.retain(|(key, group)| group.as_ref() != self.group(key));
        Ok(GroupDelta { groups: touched })
    }

    fn commit(&mut self, delta: GroupDelta) {
        for (key, group) in delta.groups {
            log::debug!(
                "materialized view '{}': group {} {}",
                self.def.name,
                format_key(&key),
                if group.is_some() { "updated" } else { "removed" }
            );
            self.store(key, group);
        }
    }

    fn rebuild(&mut self) -> Result<()> {
        let rows: Vec<Vec<ColumnValue>> = self
            .source
            .read()
            .rows()
            .map(|(_, stored)| stored.values.clone())
            .collect();

        let mut touched = Vec::new();
        let empty = MaterializedView {
            def: self.def.clone(),
            source: Arc::clone(&self.source),
            backing: Arc::clone(&self.backing),
            group_positions: self.group_positions.clone(),
            value_positions: self.value_positions.clone(),
            template: self.template.clone(),
            groups: Vec::new(),
            slots: HashMap::new(),
            free: Vec::new(),
        };
        for row in &rows {
            empty.add_row(&mut touched, row)?;
        }

        self.groups.clear();
        self.slots.clear();
        self.free.clear();
        self.backing.write().truncate();
        for (key, group) in touched {
            self.store(key, group);
        }
        log::info!(
            "materialized view '{}' rebuilt from {} rows into {} groups",
            self.def.name,
            rows.len(),
            self.slots.len()
        );
        Ok(())
    }
}

impl std::fmt::Debug for MaterializedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MaterializedView {{ name: '{}', source: '{}', groups: {} }}",
            self.def.name,
            self.def.source,
            self.slots.len()
        )
    }
}
