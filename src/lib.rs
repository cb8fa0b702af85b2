//! LiveCursor - Record Navigation over Live Relations
//!
//! Ordered, filterable cursors over in-memory relations, index-checked
//! lookups between cursors, materialized aggregate views maintained on every
//! write, and sequence generators feeding column defaults.
//!
//! Everything starts from a [`Catalog`] declaring relations, sequences and
//! materialized views. A [`Database`] opened from it hands out [`Session`]s,
//! and sessions hand out [`Cursor`]s.

pub mod changeset;
pub mod column;
pub mod error;
pub mod filter;
pub mod table;
pub mod sequence;
pub mod trigger;
pub mod mview;
pub mod lookup;
pub mod cursor;
pub mod catalog;
pub mod database;

pub use catalog::Catalog;
pub use changeset::{IncrementalView, TableChange};
pub use column::{Column, ColumnDefault, ColumnType, ColumnValue};
pub use cursor::{Cursor, RowIter, RowView, SortKey, SortOrder};
pub use database::{Database, Session};
pub use error::{CursorError, ErrorKind, Result};
pub use filter::ColumnFilter;
pub use lookup::FieldsLookup;
pub use mview::{Aggregate, GroupColumn, KeyTransform, MaterializedView, MaterializedViewDef};
pub use sequence::{Sequence, SequenceDef};
pub use table::{Index, Key, RelationKind, Schema, StoredRow, Table};
pub use trigger::{Hook, TriggerRegistry, TriggerType};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Arc;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn int(name: &str) -> Column {
        Column::new(name, ColumnType::Int, true)
    }

    fn serial(name: &str, sequence: &str) -> Column {
        Column::new(name, ColumnType::Int, false)
            .with_default(ColumnDefault::NextVal(sequence.to_string()))
    }

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2000, 8, day)
            .unwrap()
            .and_hms_opt(h, m, 32)
            .unwrap()
    }

    fn dec(text: &str) -> ColumnValue {
        ColumnValue::Decimal(Decimal::from_str(text).unwrap())
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    fn filter_catalog() -> Catalog {
        Catalog::new()
            .sequence(SequenceDef::new("a_ids"))
            .sequence(SequenceDef::new("b_ids"))
            .sequence(SequenceDef::new("g_ids"))
            .relation(
                Schema::new(
                    "a_filter",
                    vec![
                        serial("id", "a_ids"),
                        Column::new("date", ColumnType::DateTime, true),
                        int("number1"),
                        int("number2"),
                        int("no_index_a"),
                    ],
                    &["id"],
                )
                .with_index("idx_a", &["date", "number1", "number2"]),
            )
            .relation(
                Schema::new(
                    "b_filter",
                    vec![
                        serial("id", "b_ids"),
                        Column::new("created", ColumnType::DateTime, true),
                        int("numb1"),
                        int("numb2"),
                        int("no_index_b"),
                    ],
                    &["id"],
                )
                .with_index("idx_b", &["created", "numb1", "numb2"]),
            )
            .relation(
                Schema::new(
                    "g_filter",
                    vec![
                        serial("id", "g_ids"),
                        Column::new("create_date", ColumnType::DateTime, true),
                        int("num1"),
                        int("num2"),
                    ],
                    &["id"],
                )
                .with_index("idx_g", &["create_date", "num1", "num2"]),
            )
            .relation(Schema::new("c_filter", vec![Column::new("id", ColumnType::Int, false)], &["id"]))
            .relation(Schema::new("d_filter", vec![Column::new("id", ColumnType::Int, false)], &["id"]))
            .relation(Schema::new(
                "e_filter",
                vec![
                    Column::new("id", ColumnType::Int, false),
                    Column::new("number", ColumnType::Int, false),
                    Column::new("str", ColumnType::varchar(2), false),
                ],
                &["id", "number", "str"],
            ))
            .relation(Schema::new(
                "f_filter",
                vec![
                    Column::new("id", ColumnType::Int, false),
                    Column::new("numb", ColumnType::Int, false),
                ],
                &["id", "numb"],
            ))
            .relation(Schema::new("h_filter", vec![Column::new("id", ColumnType::Int, false)], &["id"]))
            .relation(
                Schema::new(
                    "i_filter",
                    vec![
                        Column::new("id", ColumnType::Int, false),
                        Column::new("h_filter_id", ColumnType::Int, false),
                    ],
                    &["id", "h_filter_id"],
                )
                .with_index("idx_i", &["h_filter_id"]),
            )
    }

    /// Rows shared by the range-on-auxiliary scenarios.
    fn fill_a_and_b(session: &Session) {
        let mut a = session.cursor("a_filter").unwrap();
        for (date, n1, n2) in [
            (at(5, 10, 5), Some(5), -10),
            (at(5, 10, 5), Some(6), -20),
            (at(5, 10, 5), Some(1), -20),
            (at(6, 10, 5), None, -30),
        ] {
            a.clear();
            a.set_value("date", date).unwrap();
            a.set_value("number1", n1).unwrap();
            a.set_value("number2", n2).unwrap();
            a.insert().unwrap();
        }
        let mut b = session.cursor("b_filter").unwrap();
        for (n1, n2) in [(6, -40), (5, -40), (1, -41)] {
            b.clear();
            b.set_value("created", at(5, 10, 5)).unwrap();
            b.set_value("numb1", n1).unwrap();
            b.set_value("numb2", n2).unwrap();
            b.insert().unwrap();
        }
    }

    #[test]
    fn test_lookup_on_simple_keys() {
        init_logging();
        let db = Database::new(filter_catalog()).unwrap();
        let session = db.session();
        let mut c = session.cursor("c_filter").unwrap();
        let mut d = session.cursor("d_filter").unwrap();
        for id in [1, 2, 3] {
            c.set_value("id", id).unwrap();
            c.insert().unwrap();
        }
        for id in [1, 3] {
            d.set_value("id", id).unwrap();
            d.insert().unwrap();
        }

        c.set_in(&d).unwrap().add("id", "id").unwrap();
        assert_eq!(c.count(), 2);
    }

    #[test]
    fn test_lookup_on_composite_keys() {
        init_logging();
        let db = Database::new(filter_catalog()).unwrap();
        let session = db.session();
        let mut e = session.cursor("e_filter").unwrap();
        let mut f = session.cursor("f_filter").unwrap();
        for (number, s) in [(1, "A"), (1, "B"), (3, "B")] {
            e.set_value("id", 1).unwrap();
            e.set_value("number", number).unwrap();
            e.set_value("str", s).unwrap();
            e.insert().unwrap();
        }
        f.set_value("id", 1).unwrap();
        f.set_value("numb", 1).unwrap();
        f.insert().unwrap();

        let lookup = e.set_in(&f).unwrap();
        lookup.add("id", "id").unwrap();
        assert_eq!(e.count(), 3);
        lookup.add("number", "numb").unwrap();
        assert_eq!(e.count(), 2);
        assert_eq!(lookup.len(), 2);
    }

    #[test]
    fn test_lookup_through_secondary_index_alignment() {
        init_logging();
        let db = Database::new(filter_catalog()).unwrap();
        let session = db.session();
        let mut h = session.cursor("h_filter").unwrap();
        let mut i = session.cursor("i_filter").unwrap();
        for id in [1, 2] {
            h.set_value("id", id).unwrap();
            h.insert().unwrap();
        }
        i.set_value("id", 1).unwrap();
        i.set_value("h_filter_id", 2).unwrap();
        i.insert().unwrap();

        // h_filter_id is second in the primary key but first in idx_i
        h.set_in(&i).unwrap().add("id", "h_filter_id").unwrap();
        assert_eq!(h.count(), 1);
        assert!(h.first());
        assert_eq!(h.value("id").unwrap(), &ColumnValue::Int(2));
    }

    #[test]
    fn test_lookup_on_index_prefixes() {
        init_logging();
        let db = Database::new(filter_catalog()).unwrap();
        let session = db.session();
        fill_a_and_b(&session);
        let mut a = session.cursor("a_filter").unwrap();
        let b = session.cursor("b_filter").unwrap();

        a.set_in(&b).unwrap().add("date", "created").unwrap();
        assert_eq!(a.count(), 3);
        a.set_in(&b)
            .unwrap()
            .add("date", "created")
            .unwrap()
            .add("number1", "numb1")
            .unwrap();
        assert_eq!(a.count(), 3);
        a.set_in(&b)
            .unwrap()
            .add("date", "created")
            .unwrap()
            .add("number1", "numb1")
            .unwrap()
            .add("number2", "numb2")
            .unwrap();
        assert_eq!(a.count(), 0);
    }

    #[test]
    fn test_lookup_reevaluates_auxiliary_filters() {
        init_logging();
        let db = Database::new(filter_catalog()).unwrap();
        let session = db.session();
        fill_a_and_b(&session);
        let mut a = session.cursor("a_filter").unwrap();
        let mut b = session.cursor("b_filter").unwrap();

        a.set_in(&b)
            .unwrap()
            .add("date", "created")
            .unwrap()
            .add("number1", "numb1")
            .unwrap();
        assert_eq!(a.count(), 3);

        b.set_range("numb2", -40).unwrap();
        assert_eq!(a.count(), 2);
        assert!(a.first());
        assert_eq!(a.value("number1").unwrap(), &ColumnValue::Int(5));
        assert!(a.navigate(">").unwrap());
        assert_eq!(a.value("number1").unwrap(), &ColumnValue::Int(6));
        assert!(!a.navigate(">").unwrap());

        // constraints on the target compose with the lookup
        a.set_range("number1", 5).unwrap();
        assert_eq!(a.count(), 1);

        b.clear_range("numb2").unwrap();
        a.clear_range("number1").unwrap();
        assert_eq!(a.count(), 3);
    }

    #[test]
    fn test_chained_lookups() {
        init_logging();
        let db = Database::new(filter_catalog()).unwrap();
        let session = db.session();
        fill_a_and_b(&session);
        let mut g = session.cursor("g_filter").unwrap();
        for (n1, n2) in [(5, -30), (6, -40), (1, -41), (1, -42)] {
            g.clear();
            g.set_value("create_date", at(5, 10, 5)).unwrap();
            g.set_value("num1", n1).unwrap();
            g.set_value("num2", n2).unwrap();
            g.insert().unwrap();
        }
        g.clear();

        let mut a = session.cursor("a_filter").unwrap();
        let mut b = session.cursor("b_filter").unwrap();
        let lookup = a.set_in(&b).unwrap();
        lookup.add("date", "created").unwrap().add("number1", "numb1").unwrap();
        lookup
            .and(&g)
            .unwrap()
            .add("date", "create_date")
            .unwrap()
            .add("number1", "num1")
            .unwrap();
        assert_eq!(a.count(), 3);

        b.set_range("numb2", -40).unwrap();
        assert_eq!(a.count(), 2);

        g.set_range("num2", -30).unwrap();
        assert_eq!(a.count(), 1);
        assert!(a.first());
        assert_eq!(a.value("number1").unwrap(), &ColumnValue::Int(5));
    }

    #[test]
    fn test_lookup_validation() {
        init_logging();
        let db = Database::new(filter_catalog()).unwrap();
        let session = db.session();
        let mut a = session.cursor("a_filter").unwrap();
        let b = session.cursor("b_filter").unwrap();
        let lookup = a.set_in(&b).unwrap();

        for (t, x) in [("missing", "created"), ("date", "missing"), ("missing", "missing")] {
            let err = lookup.add(t, x).unwrap_err();
            assert!(matches!(err, CursorError::UnknownColumn { .. }));
            assert_eq!(err.kind(), ErrorKind::Definition);
        }
        assert!(matches!(
            lookup.add("date", "numb1"),
            Err(CursorError::TypeMismatch { .. })
        ));
        assert!(matches!(
            lookup.add("no_index_a", "numb1"),
            Err(CursorError::UnindexedLookup { .. })
        ));
        assert!(matches!(
            lookup.add("number1", "no_index_b"),
            Err(CursorError::UnindexedLookup { .. })
        ));
        // number1 and numb2 sit in an index but begin none
        assert!(matches!(
            lookup.add("number1", "numb2"),
            Err(CursorError::UnindexedLookup { ref relation, .. }) if relation == "a_filter"
        ));
        assert!(matches!(
            lookup.add("date", "numb2"),
            Err(CursorError::UnindexedLookup { ref relation, .. }) if relation == "b_filter"
        ));
        // every failure left the lookup empty
        assert!(lookup.is_empty());

        lookup.add("date", "created").unwrap();
        assert!(lookup.add("number2", "numb2").is_err());
        assert_eq!(lookup.target_columns(), vec!["date".to_string()]);
        // a lookup column that exists after successful pairs is still checked
        assert!(matches!(
            lookup.add("missing", "numb1"),
            Err(CursorError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_lookup_columns_must_lead_an_index() {
        init_logging();
        let relation = |name: &str, columns: [&str; 2]| {
            Schema::new(
                name,
                vec![
                    Column::new("id", ColumnType::Int, false),
                    int(columns[0]),
                    int(columns[1]),
                ],
                &["id"],
            )
        };
        let catalog = Catalog::new()
            .relation(relation("pa", ["x", "y"]).with_index("ia", &["x", "y"]))
            .relation(relation("pb", ["p", "q"]).with_index("ib", &["p", "q"]))
            .relation(
                relation("pc", ["p", "q"])
                    .with_index("ic", &["p"])
                    .with_index("iqp", &["q", "p"]),
            );
        let db = Database::new(catalog).unwrap();
        let session = db.session();
        let mut pa = session.cursor("pa").unwrap();
        let pb = session.cursor("pb").unwrap();
        let pc = session.cursor("pc").unwrap();

        let lookup = pa.set_in(&pb).unwrap();
        let err = lookup.add("y", "p").unwrap_err();
        assert!(matches!(err, CursorError::UnindexedLookup { ref relation, .. } if relation == "pa"));
        assert_eq!(err.kind(), ErrorKind::Definition);
        assert!(matches!(
            lookup.add("x", "q"),
            Err(CursorError::UnindexedLookup { ref relation, .. }) if relation == "pb"
        ));
        lookup.add("x", "p").unwrap().add("y", "q").unwrap();

        // both sides lead an index, but in different orders
        let lookup = pa.set_in(&pc).unwrap();
        lookup.add("x", "p").unwrap();
        assert!(matches!(
            lookup.add("y", "q"),
            Err(CursorError::LookupIndexMismatch { .. })
        ));
        assert_eq!(lookup.len(), 1);
    }

    #[test]
    fn test_lookup_cycles_and_sessions() {
        init_logging();
        let db = Database::new(filter_catalog()).unwrap();
        let session = db.session();
        let mut c = session.cursor("c_filter").unwrap();
        let mut d = session.cursor("d_filter").unwrap();
        c.set_in(&d).unwrap().add("id", "id").unwrap();
        assert!(matches!(d.set_in(&c), Err(CursorError::InvalidLookup(_))));

        let foreign = db.session().cursor("d_filter").unwrap();
        assert!(matches!(c.set_in(&foreign), Err(CursorError::ForeignSession)));

        let stray = d.set_in(&foreign);
        assert!(stray.is_err());
        let lookup = c.lookup().unwrap();
        assert!(matches!(d.set_in_lookup(lookup), Err(CursorError::InvalidLookup(_))));
    }

    // ========================================================================
    // Materialized views
    // ========================================================================

    fn view_catalog(drop_empty_groups: bool) -> Catalog {
        Catalog::new()
            .sequence(SequenceDef::new("t_ids"))
            .relation(
                Schema::new(
                    "table1",
                    vec![
                        serial("id", "t_ids"),
                        int("numb"),
                        Column::new("var", ColumnType::varchar(2), false),
                    ],
                    &["id"],
                )
                .with_index("idx_numb", &["numb"]),
            )
            .materialized_view(
                MaterializedViewDef::new("mview1", "table1")
                    .group_by("var", "var")
                    .sum("s", "numb")
                    .count("c")
                    .drop_empty_groups(drop_empty_groups),
            )
    }

    fn add(table: &mut Cursor, numb: i64, var: &str) {
        table.clear();
        table.set_value("numb", numb).unwrap();
        table.set_value("var", var).unwrap();
        table.insert().unwrap();
    }

    fn sum_and_count(view: &Cursor) -> (i64, i64) {
        (
            view.value("s").unwrap().as_i64().unwrap(),
            view.value("c").unwrap().as_i64().unwrap(),
        )
    }

    #[test]
    fn test_view_insert_and_delete_all() {
        init_logging();
        let db = Database::new(view_catalog(true)).unwrap();
        let session = db.session();
        let mut table = session.cursor("table1").unwrap();
        let mut view = session.cursor("mview1").unwrap();

        for numb in [5, 2, 0, -1] {
            add(&mut table, numb, "A");
        }
        assert_eq!(view.count(), 1);
        add(&mut table, 20, "B");
        add(&mut table, 11, "B");
        assert_eq!(view.count(), 2);

        view.get(&["A".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (6, 4));
        view.get(&["B".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (31, 2));

        view.set_range("var", "A").unwrap();
        assert_eq!(view.count(), 1);
        assert!(view.first());
        assert_eq!(sum_and_count(&view), (6, 4));

        table.clear();
        assert_eq!(table.delete_all().unwrap(), 6);
        view.reset();
        assert_eq!(view.count(), 0);
    }

    #[test]
    fn test_view_update() {
        init_logging();
        let db = Database::new(view_catalog(false)).unwrap();
        let session = db.session();
        let mut table = session.cursor("table1").unwrap();
        let mut view = session.cursor("mview1").unwrap();

        add(&mut table, 5, "A");
        add(&mut table, 2, "A");
        view.get(&["A".into()]).unwrap();
        assert_eq!(sum_and_count(&view).0, 7);
        add(&mut table, 20, "B");
        add(&mut table, 11, "B");

        table.clear();
        table.set_range("numb", 2).unwrap();
        assert!(table.first());
        table.set_value("numb", 4).unwrap();
        table.update().unwrap();

        table.set_range("numb", 11).unwrap();
        assert!(table.first());
        table.set_value("numb", 15).unwrap();
        table.update().unwrap();

        assert_eq!(view.count(), 2);
        view.get(&["A".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (9, 2));
        view.get(&["B".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (35, 2));
    }

    #[test]
    fn test_view_keeps_zero_sum_groups() {
        init_logging();
        let db = Database::new(view_catalog(false)).unwrap();
        let session = db.session();
        let mut table = session.cursor("table1").unwrap();
        let mut view = session.cursor("mview1").unwrap();

        add(&mut table, 5, "A");
        let first_id = table.value("id").unwrap().clone();
        add(&mut table, 2, "A");
        view.get(&["A".into()]).unwrap();
        assert_eq!(sum_and_count(&view).0, 7);

        table.clear();
        table.set_range("numb", 2).unwrap();
        assert!(table.first());
        table.set_value("numb", -5).unwrap();
        table.update().unwrap();
        view.get(&["A".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (0, 2));

        add(&mut table, 5, "A");
        view.get(&["A".into()]).unwrap();
        assert_eq!(sum_and_count(&view).0, 5);

        table.clear();
        table.get(&[first_id]).unwrap();
        table.set_value("var", "B").unwrap();
        table.update().unwrap();
        view.get(&["A".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (0, 2));
        view.get(&["B".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (5, 1));

        // emptying a group keeps it, distinct from an absent group
        table.reset();
        table.set_range("var", "B").unwrap();
        table.delete_all().unwrap();
        view.get(&["B".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (0, 0));
        assert!(matches!(
            view.get(&["Z".into()]),
            Err(CursorError::NotFound { .. })
        ));

        db.rebuild_view("mview1").unwrap();
        assert!(!view.try_get(&["B".into()]).unwrap());
        view.get(&["A".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (0, 2));
    }

    #[test]
    fn test_view_on_two_columns() {
        init_logging();
        let catalog = Catalog::new()
            .sequence(SequenceDef::new("t4_ids"))
            .relation(Schema::new(
                "table4",
                vec![
                    serial("id", "t4_ids"),
                    Column::new("var1", ColumnType::varchar(2), false),
                    Column::new("var2", ColumnType::varchar(2), false),
                    int("numb"),
                ],
                &["id"],
            ))
            .materialized_view(
                MaterializedViewDef::new("mview5", "table4")
                    .group_by("var1", "var1")
                    .group_by("var2", "var2")
                    .sum("s", "numb"),
            );
        let db = Database::new(catalog).unwrap();
        let session = db.session();
        let mut table = session.cursor("table4").unwrap();
        let mut view = session.cursor("mview5").unwrap();
        assert_eq!(view.count(), 0);

        table.set_value("var1", "A").unwrap();
        table.set_value("var2", "B").unwrap();
        table.set_value("numb", 3).unwrap();
        table.insert().unwrap();
        table.set_value("id", ColumnValue::Null).unwrap();
        table.set_value("numb", 2).unwrap();
        table.insert().unwrap();
        assert_eq!(view.count(), 1);
        view.get(&["A".into(), "B".into()]).unwrap();
        assert_eq!(view.value("s").unwrap(), &ColumnValue::Int(5));

        table.set_value("id", ColumnValue::Null).unwrap();
        table.set_value("var2", "C").unwrap();
        table.set_value("numb", 4).unwrap();
        table.insert().unwrap();
        view.get(&["A".into(), "C".into()]).unwrap();
        assert_eq!(view.value("s").unwrap(), &ColumnValue::Int(4));
        assert!(view.try_get_current().unwrap());
        assert_eq!(view.value("s").unwrap(), &ColumnValue::Int(4));
    }

    #[test]
    fn test_view_date_rounding() {
        init_logging();
        let catalog = Catalog::new()
            .sequence(SequenceDef::new("t3_ids"))
            .relation(Schema::new(
                "table3",
                vec![
                    serial("id", "t3_ids"),
                    int("numb"),
                    Column::new("date", ColumnType::DateTime, false),
                ],
                &["id"],
            ))
            .materialized_view(
                MaterializedViewDef::new("mview4", "table3")
                    .group_by_day("date", "date")
                    .sum("s", "numb"),
            );
        let db = Database::new(catalog).unwrap();
        let session = db.session();
        let mut table = session.cursor("table3").unwrap();
        let mut view = session.cursor("mview4").unwrap();

        for (numb, date) in [(5, at(5, 10, 5)), (2, at(5, 22, 5)), (5, at(6, 10, 5))] {
            table.clear();
            table.set_value("numb", numb).unwrap();
            table.set_value("date", date).unwrap();
            table.insert().unwrap();
        }

        assert_eq!(view.count(), 2);
        let day = |d: u32| ColumnValue::DateTime(NaiveDate::from_ymd_opt(2000, 8, d).unwrap().and_hms_opt(0, 0, 0).unwrap());
        view.get(&[day(5)]).unwrap();
        assert_eq!(view.value("s").unwrap(), &ColumnValue::Int(7));
        view.get(&[day(6)]).unwrap();
        assert_eq!(view.value("s").unwrap(), &ColumnValue::Int(5));
    }

    #[test]
    fn test_view_day_rounding_of_zoned_timestamps_is_utc() {
        init_logging();
        let catalog = Catalog::new()
            .relation(Schema::new(
                "events",
                vec![
                    Column::new("id", ColumnType::Int, false),
                    Column::new("at", ColumnType::ZonedDateTime, false),
                ],
                &["id"],
            ))
            .materialized_view(
                MaterializedViewDef::new("per_day", "events")
                    .group_by_day("day", "at")
                    .count("n"),
            );
        let db = Database::new(catalog).unwrap();
        let session = db.session();
        let mut events = session.cursor("events").unwrap();
        let moscow = FixedOffset::east_opt(3 * 3600).unwrap();
        // 01:00 and 23:00 local are on different UTC days
        for (id, hour) in [(1, 1), (2, 23), (3, 4)] {
            events.set_value("id", id).unwrap();
            events
                .set_value("at", ColumnValue::zoned(moscow.with_ymd_and_hms(2000, 8, 5, hour, 0, 0).unwrap()))
                .unwrap();
            events.insert().unwrap();
        }

        let per_day = session.cursor("per_day").unwrap();
        let counts: Vec<(String, i64)> = per_day
            .iterate()
            .map(|row| {
                (
                    row.get("day").unwrap().to_string(),
                    row.get("n").and_then(ColumnValue::as_i64).unwrap(),
                )
            })
            .collect();
        assert_eq!(
            counts,
            vec![
                ("2000-08-04 00:00:00+00:00".to_string(), 1),
                ("2000-08-05 00:00:00+00:00".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_view_sum_of_decimals() {
        init_logging();
        let catalog = Catalog::new()
            .sequence(SequenceDef::new("t5_ids"))
            .relation(Schema::new(
                "table5",
                vec![
                    serial("id", "t5_ids"),
                    Column::new("f1", ColumnType::decimal(4, 2), false)
                        .with_default(ColumnDefault::Value("24.01".to_string())),
                    Column::new("f2", ColumnType::decimal(5, 4), false)
                        .with_default(ColumnDefault::Value("1.0001".to_string())),
                ],
                &["id"],
            ))
            .materialized_view(
                MaterializedViewDef::new("mview6", "table5")
                    .group_by("f1", "f1")
                    .sum("s1", "f1")
                    .sum("s2", "f2"),
            );
        let db = Database::new(catalog).unwrap();
        let session = db.session();
        let mut t = session.cursor("table5").unwrap();
        t.insert().unwrap();
        t.clear();
        t.insert().unwrap();
        t.clear();
        t.set_value("f1", dec("24.02")).unwrap();
        t.insert().unwrap();

        let mut mv = session.cursor("mview6").unwrap();
        assert!(mv.first());
        assert_eq!(mv.as_csv_line(), "24.01,48.02,2.0002");
        assert!(mv.next());
        assert_eq!(mv.as_csv_line(), "24.02,24.02,1.0001");
        assert!(!mv.next());
    }

    #[test]
    fn test_failed_view_maintenance_rolls_back_the_write() {
        init_logging();
        let db = Database::new(view_catalog(false)).unwrap();
        let session = db.session();
        let mut table = session.cursor("table1").unwrap();
        add(&mut table, i64::MAX, "A");

        table.clear();
        table.set_value("numb", 1).unwrap();
        table.set_value("var", "A").unwrap();
        let err = table.insert().unwrap_err();
        assert!(matches!(err, CursorError::Overflow(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);

        table.reset();
        assert_eq!(table.count(), 1);
        let mut view = session.cursor("mview1").unwrap();
        view.get(&["A".into()]).unwrap();
        assert_eq!(sum_and_count(&view), (i64::MAX, 1));
    }

    // ========================================================================
    // Writes, hooks, sequences
    // ========================================================================

    fn cost_catalog() -> Catalog {
        Catalog::new()
            .sequence(SequenceDef::new("cost_ids").start(10).increment(10))
            .relation(
                Schema::new(
                    "costs",
                    vec![
                        serial("id", "cost_ids"),
                        Column::new("cost", ColumnType::decimal(4, 2), true),
                        Column::new("note", ColumnType::text(), true),
                    ],
                    &["id"],
                )
                .with_versioning(true),
            )
            .relation(Schema::new(
                "audit",
                vec![
                    Column::new("id", ColumnType::Int, false),
                    Column::new("message", ColumnType::text(), false),
                ],
                &["id"],
            ))
    }

    #[test]
    fn test_decimal_columns_round_and_reject() {
        init_logging();
        let db = Database::new(cost_catalog()).unwrap();
        let mut costs = db.session().cursor("costs").unwrap();
        costs.set_value("cost", dec("5.289")).unwrap();
        costs.insert().unwrap();
        assert_eq!(costs.value("id").unwrap(), &ColumnValue::Int(10));

        costs.clear_buffer(true);
        costs.get(&[ColumnValue::Int(10)]).unwrap();
        assert_eq!(costs.value("cost").unwrap().to_string(), "5.29");

        let err = costs.set_value("cost", dec("123.2")).unwrap_err();
        assert!(matches!(err, CursorError::DecimalOverflow { .. }));
        assert_eq!(costs.value("cost").unwrap().to_string(), "5.29");
    }

    #[test]
    fn test_version_conflict() {
        init_logging();
        let db = Database::new(cost_catalog()).unwrap();
        let session = db.session();
        let mut first = session.cursor("costs").unwrap();
        first.insert().unwrap();

        let mut second = session.cursor("costs").unwrap();
        second.get(&[ColumnValue::Int(10)]).unwrap();

        first.set_value("note", "one").unwrap();
        first.update().unwrap();
        assert_eq!(first.version(), Some(2));

        second.set_value("note", "two").unwrap();
        let err = second.update().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Record (10) in relation 'costs' has been already modified"
        );
        assert_eq!(err.kind(), ErrorKind::Conflict);

        assert!(second.try_get_current().unwrap());
        second.set_value("note", "two").unwrap();
        second.update().unwrap();
        assert_eq!(second.version(), Some(3));
    }

    #[test]
    fn test_hooks_run_in_order_around_writes() {
        init_logging();
        let db = Database::new(cost_catalog()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (trigger, tag) in [
            (TriggerType::PreInsert, "pre-insert 1"),
            (TriggerType::PreInsert, "pre-insert 2"),
            (TriggerType::PostInsert, "post-insert"),
            (TriggerType::PreUpdate, "pre-update"),
            (TriggerType::PostUpdate, "post-update"),
            (TriggerType::PreDelete, "pre-delete"),
            (TriggerType::PostDelete, "post-delete"),
        ] {
            let log = Arc::clone(&log);
            db.register_trigger("costs", trigger, move |cursor: &mut Cursor| {
                log.lock().push(format!("{} {}", tag, cursor.value("note")?));
                Ok(())
            })
            .unwrap();
        }
        // a pre-insert hook may change the buffer
        db.register_trigger("costs", TriggerType::PreInsert, |cursor: &mut Cursor| {
            cursor.set_value("note", "stamped")
        })
        .unwrap();
        // hooks may write elsewhere through the cursor's session
        db.register_trigger("costs", TriggerType::PostDelete, |cursor: &mut Cursor| {
            let mut audit = cursor.session().cursor("audit")?;
            audit.set_value("id", cursor.x_rec().map_or(ColumnValue::Null, |row| row[0].clone()))?;
            audit.set_value("message", "deleted")?;
            audit.insert()
        })
        .unwrap();

        let session = db.session();
        let mut costs = session.cursor("costs").unwrap();
        costs.insert().unwrap();
        assert_eq!(costs.value("note").unwrap(), &ColumnValue::from("stamped"));
        costs.set_value("note", "edited").unwrap();
        costs.update().unwrap();
        costs.delete().unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "pre-insert 1 NULL",
                "pre-insert 2 NULL",
                "post-insert stamped",
                "pre-update edited",
                "post-update edited",
                "pre-delete edited",
                "post-delete edited",
            ]
        );
        let mut audit = session.cursor("audit").unwrap();
        audit.get(&[ColumnValue::Int(10)]).unwrap();
        assert_eq!(audit.value("message").unwrap(), &ColumnValue::from("deleted"));
    }

    #[test]
    fn test_failing_pre_hook_aborts_the_write() {
        init_logging();
        let db = Database::new(cost_catalog()).unwrap();
        db.register_trigger("costs", TriggerType::PreInsert, |cursor: &mut Cursor| {
            if cursor.value("note")?.is_null() {
                return Err(CursorError::Hook("note is required".to_string()));
            }
            Ok(())
        })
        .unwrap();
        let mut costs = db.session().cursor("costs").unwrap();
        assert!(matches!(costs.insert(), Err(CursorError::Hook(_))));
        assert_eq!(costs.count(), 0);
        // the default was never drawn
        assert_eq!(db.sequence("cost_ids").unwrap().current_value(), None);

        costs.set_value("note", "ok").unwrap();
        costs.insert().unwrap();
        assert_eq!(costs.count(), 1);
    }

    #[test]
    fn test_exhausted_sequence_fails_insert() {
        init_logging();
        let catalog = Catalog::new()
            .sequence(SequenceDef::new("tiny").start(1).max_value(2))
            .relation(Schema::new("t", vec![serial("id", "tiny")], &["id"]));
        let db = Database::new(catalog).unwrap();
        let mut t = db.session().cursor("t").unwrap();
        t.insert().unwrap();
        t.clear();
        t.insert().unwrap();
        t.clear();
        assert!(matches!(t.insert(), Err(CursorError::SequenceExhausted(_))));
        assert_eq!(t.count(), 2);
    }

    #[test]
    fn test_catalog_from_json_drives_a_database() {
        init_logging();
        let db = Database::from_json(
            r#"{
                "sequences": [{"name": "ids", "start": 1}],
                "relations": [{
                    "name": "notes",
                    "columns": [
                        {"name": "id", "type": "int", "nullable": false, "default": {"next_val": "ids"}},
                        {"name": "body", "type": "string", "max_length": 20}
                    ],
                    "primary_key": ["id"]
                }]
            }"#,
        )
        .unwrap();
        let mut notes = db.session().cursor("notes").unwrap();
        notes.set_value("body", "a, b").unwrap();
        notes.insert().unwrap();
        notes.clear_buffer(false);
        notes.set_value("id", ColumnValue::Null).unwrap();
        notes.set_value("body", "say \"x\"").unwrap();
        notes.insert().unwrap();
        assert_eq!(notes.to_csv(), "id,body\n1,\"a, b\"\n2,\"say \"\"x\"\"\"\n");
    }
}
