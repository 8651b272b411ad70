//! Relational unwinding of nested JSON records. A record flattens into a row
//! on its root table; nested mappings flatten into the same row under
//! `__`-joined paths; lists synthesize child tables linked by row ids. The
//! walk feeds every newly observed column through the schema update API and
//! reports the accumulated evolution next to the rows.

use schema::inference::value_data_type;
use schema::names::{join_path, normalize_identifier, shorten_identifier, PATH_SEPARATOR};
use schema::{uniq_id, Column, ColumnHint, DataType, Schema, SchemaError, SchemaUpdate, Table};
use serde_json::{Map, Value};

/// Row id assigned to every emitted row.
pub const ROW_ID_COLUMN: &str = "_dlt_id";
/// Owning row id carried by child rows.
pub const PARENT_ID_COLUMN: &str = "_dlt_parent_id";
/// Zero-based position carried by rows that originate from a list.
pub const LIST_IDX_COLUMN: &str = "_dlt_list_idx";
/// Payload column of child rows produced by lists of scalars.
pub const VALUE_COLUMN: &str = "value";

/// One emitted row: the table it lands in, the parent table for child rows,
/// and the flat column mapping.
#[derive(Debug, Clone)]
pub struct NormalizedRow {
    pub table: String,
    pub parent_table: Option<String>,
    pub row: Map<String, Value>,
}

/// Flattens `record` into rows rooted at `root_table`, evolving `schema` as
/// new columns are observed. Emission order is deterministic: a parent row
/// precedes its children, siblings keep insertion order, lists keep
/// positional order.
///
/// Non-mapping inputs are wrapped as `{"v": ...}`.
pub fn normalize_record(
    schema: &mut Schema,
    record: Value,
    root_table: &str,
    max_identifier_length: usize,
) -> Result<(Vec<NormalizedRow>, SchemaUpdate), SchemaError> {
    let object = match record {
        Value::Object(object) => object,
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("v".to_string(), other);
            wrapped
        }
    };

    let mut walker = Walker {
        schema,
        update: SchemaUpdate::new(),
        rows: Vec::new(),
        max_identifier_length,
    };
    let table = normalize_identifier(root_table)?;
    walker.walk_object(&table, None, None, object)?;
    Ok((walker.rows, walker.update))
}

/// Serializes a nested value as canonical JSON: object keys sorted, list
/// order preserved.
pub fn to_canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

struct Walker<'a> {
    schema: &'a mut Schema,
    update: SchemaUpdate,
    rows: Vec<NormalizedRow>,
    max_identifier_length: usize,
}

/// Link from a child row to its owner.
struct ParentLink<'a> {
    table: &'a str,
    row_id: &'a str,
}

impl<'a> Walker<'a> {
    /// Emits one row for `object`, then recurses into its deferred lists.
    fn walk_object(
        &mut self,
        table: &str,
        parent: Option<ParentLink<'_>>,
        list_idx: Option<usize>,
        object: Map<String, Value>,
    ) -> Result<(), SchemaError> {
        let row_id = uniq_id();
        let mut row = Map::new();
        let mut new_columns = Vec::new();
        let mut lists = Vec::new();

        self.flatten(table, &mut row, &mut new_columns, "", object, &mut lists)?;
        self.add_system_columns(table, &mut row, &mut new_columns, &row_id, &parent, list_idx);
        self.apply_update(table, parent.as_ref().map(|p| p.table), new_columns)?;

        self.rows.push(NormalizedRow {
            table: table.to_string(),
            parent_table: parent.as_ref().map(|p| p.table.to_string()),
            row,
        });

        for (path, items) in lists {
            let child_table = shorten_identifier(
                &format!("{}{}{}", table, PATH_SEPARATOR, path),
                self.max_identifier_length,
            );
            for (idx, item) in items.into_iter().enumerate() {
                let link = ParentLink {
                    table,
                    row_id: &row_id,
                };
                match item {
                    Value::Object(child) => {
                        self.walk_object(&child_table, Some(link), Some(idx), child)?
                    }
                    scalar => self.walk_scalar_item(&child_table, link, idx, scalar)?,
                }
            }
        }
        Ok(())
    }

    /// Flattens one nesting level into the current row. Lists are deferred
    /// so the parent row is emitted before any child rows.
    fn flatten(
        &mut self,
        table: &str,
        row: &mut Map<String, Value>,
        new_columns: &mut Vec<Column>,
        prefix: &str,
        object: Map<String, Value>,
        lists: &mut Vec<(String, Vec<Value>)>,
    ) -> Result<(), SchemaError> {
        for (key, value) in object {
            let path = join_path(prefix, &normalize_identifier(&key)?);
            if !self.schema.filter_row(table, &path) {
                continue;
            }
            match value {
                Value::Object(nested) if !self.is_pinned_complex(table, &path) => {
                    self.flatten(table, row, new_columns, &path, nested, lists)?;
                }
                Value::Array(items) if !self.is_pinned_complex(table, &path) => {
                    lists.push((path, items));
                }
                leaf => self.add_leaf(table, row, new_columns, &path, leaf)?,
            }
        }
        Ok(())
    }

    /// A list element that is not a mapping becomes a child row whose only
    /// payload is the `value` column.
    fn walk_scalar_item(
        &mut self,
        child_table: &str,
        parent: ParentLink<'_>,
        idx: usize,
        value: Value,
    ) -> Result<(), SchemaError> {
        let row_id = uniq_id();
        let mut row = Map::new();
        let mut new_columns = Vec::new();

        self.add_leaf(child_table, &mut row, &mut new_columns, VALUE_COLUMN, value)?;
        self.add_system_columns(
            child_table,
            &mut row,
            &mut new_columns,
            &row_id,
            &Some(ParentLink {
                table: parent.table,
                row_id: parent.row_id,
            }),
            Some(idx),
        );
        self.apply_update(child_table, Some(parent.table), new_columns)?;

        self.rows.push(NormalizedRow {
            table: child_table.to_string(),
            parent_table: Some(parent.table.to_string()),
            row,
        });
        Ok(())
    }

    /// Lands a leaf value on the row, inferring or checking its column type.
    /// Complex leaves are carried as canonical JSON text.
    fn add_leaf(
        &mut self,
        table: &str,
        row: &mut Map<String, Value>,
        new_columns: &mut Vec<Column>,
        path: &str,
        value: Value,
    ) -> Result<(), SchemaError> {
        let column_name = shorten_identifier(path, self.max_identifier_length);
        let Some(observed) = self.schema.infer_column_type(path, &value) else {
            // Null carries no type: it lands on known columns and is dropped
            // for unknown ones.
            if self.column_exists(table, &column_name) {
                row.insert(column_name, Value::Null);
            }
            return Ok(());
        };

        if self.column_exists(table, &column_name) {
            if let Err(err) = self.schema.check_compatible(table, &column_name, observed) {
                // A detection may disagree with an established plain type;
                // fall back to the base value class before giving up.
                match value_data_type(&value) {
                    Some(base) if base != observed => {
                        self.schema.check_compatible(table, &column_name, base)?;
                    }
                    _ => return Err(err),
                }
            }
        } else {
            let column = self.schema.new_column(&column_name, path, observed);
            new_columns.push(column);
        }

        let stored = match value {
            nested @ (Value::Object(_) | Value::Array(_)) => {
                Value::String(to_canonical_json(&nested))
            }
            scalar => scalar,
        };
        row.insert(column_name, stored);
        Ok(())
    }

    fn add_system_columns(
        &mut self,
        table: &str,
        row: &mut Map<String, Value>,
        new_columns: &mut Vec<Column>,
        row_id: &str,
        parent: &Option<ParentLink<'_>>,
        list_idx: Option<usize>,
    ) {
        if !self.column_exists(table, ROW_ID_COLUMN) {
            new_columns.push(
                Column::new(ROW_ID_COLUMN, DataType::Text)
                    .not_null()
                    .with_hint(ColumnHint::Unique),
            );
        }
        row.insert(ROW_ID_COLUMN.to_string(), Value::String(row_id.to_string()));

        if let Some(parent) = parent {
            if !self.column_exists(table, PARENT_ID_COLUMN) {
                new_columns.push(
                    Column::new(PARENT_ID_COLUMN, DataType::Text)
                        .not_null()
                        .with_hint(ColumnHint::ForeignKey),
                );
            }
            row.insert(
                PARENT_ID_COLUMN.to_string(),
                Value::String(parent.row_id.to_string()),
            );
        }
        if let Some(idx) = list_idx {
            if !self.column_exists(table, LIST_IDX_COLUMN) {
                new_columns.push(Column::new(LIST_IDX_COLUMN, DataType::Bigint).not_null());
            }
            row.insert(LIST_IDX_COLUMN.to_string(), Value::from(idx));
        }
    }

    /// Pushes observed columns through the schema and records the applied
    /// diff for the package's schema-update sentinel.
    fn apply_update(
        &mut self,
        table: &str,
        parent_table: Option<&str>,
        new_columns: Vec<Column>,
    ) -> Result<(), SchemaError> {
        if new_columns.is_empty() && self.schema.table(table).is_some() {
            return Ok(());
        }
        let mut partial = Table::new(table);
        partial.parent = parent_table.map(str::to_string);
        for column in new_columns {
            partial.push_column(column);
        }
        if let Some(diff) = self.schema.update_schema(partial)? {
            self.update.entry(table.to_string()).or_default().push(diff);
        }
        Ok(())
    }

    fn column_exists(&self, table: &str, column: &str) -> bool {
        self.schema
            .table(table)
            .map_or(false, |t| t.columns.contains_key(column))
    }

    /// A nested value stops unwinding when the schema already pins the path
    /// to `complex`, either through an existing column or a preferred type.
    fn is_pinned_complex(&self, table: &str, path: &str) -> bool {
        let column_name = shorten_identifier(path, self.max_identifier_length);
        let existing = self
            .schema
            .table(table)
            .and_then(|t| t.columns.get(&column_name))
            .map(|c| c.data_type);
        match existing {
            Some(data_type) => data_type == DataType::Complex,
            None => self.schema.preferred_type(path) == Some(DataType::Complex),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use schema::{RowFilters, SchemaSettings, WriteDisposition};
    use serde_json::json;

    fn normalize(
        schema: &mut Schema,
        record: Value,
        table: &str,
    ) -> (Vec<NormalizedRow>, SchemaUpdate) {
        normalize_record(schema, record, table, 127).unwrap()
    }

    #[test]
    fn flat_record_produces_one_row() {
        let mut schema = Schema::new("event").unwrap();
        let (rows, update) = normalize(
            &mut schema,
            json!({"id": 1, "ev": "click", "ts": 1_690_000_000}),
            "events",
        );

        assert_eq!(1, rows.len());
        let row = &rows[0];
        assert_eq!("events", row.table);
        assert_eq!(None, row.parent_table);
        assert_eq!(json!(1), row.row["id"]);
        assert_eq!(json!("click"), row.row["ev"]);
        assert!(row.row[ROW_ID_COLUMN].is_string());

        let table = schema.table("events").unwrap();
        assert_eq!(DataType::Bigint, table.columns["id"].data_type);
        assert_eq!(DataType::Text, table.columns["ev"].data_type);
        assert_eq!(DataType::Timestamp, table.columns["ts"].data_type);
        assert_eq!(DataType::Text, table.columns[ROW_ID_COLUMN].data_type);

        assert_eq!(1, update.len());
        assert_eq!(4, update["events"][0].columns.len());
    }

    #[test]
    fn second_pass_over_the_same_shape_is_a_noop() {
        let mut schema = Schema::new("event").unwrap();
        normalize(&mut schema, json!({"id": 1, "ev": "click"}), "events");
        let (rows, update) = normalize(&mut schema, json!({"id": 2, "ev": "view"}), "events");
        assert_eq!(1, rows.len());
        assert!(update.is_empty());
    }

    #[test]
    fn nested_mappings_flatten_into_the_parent_row() {
        let mut schema = Schema::new("event").unwrap();
        let (rows, _) = normalize(
            &mut schema,
            json!({"id": 1, "address": {"city": "Berlin", "geo": {"lat": 52.5}}}),
            "events",
        );

        assert_eq!(1, rows.len());
        assert_eq!(json!("Berlin"), rows[0].row["address__city"]);
        assert_eq!(json!(52.5), rows[0].row["address__geo__lat"]);
    }

    #[test]
    fn lists_of_mappings_unwind_into_child_tables() {
        let mut schema = Schema::new("event").unwrap();
        let (rows, _) = normalize(
            &mut schema,
            json!({"id": 1, "tags": [{"k": "a"}, {"k": "b"}]}),
            "events",
        );

        assert_eq!(3, rows.len());
        let parent = &rows[0];
        let parent_id = parent.row[ROW_ID_COLUMN].as_str().unwrap();

        for (idx, child) in rows[1..].iter().enumerate() {
            assert_eq!("events__tags", child.table);
            assert_eq!(Some("events".to_string()), child.parent_table);
            assert_eq!(json!(parent_id), child.row[PARENT_ID_COLUMN]);
            assert_eq!(json!(idx), child.row[LIST_IDX_COLUMN]);
        }
        assert_eq!(json!("a"), rows[1].row["k"]);
        assert_eq!(json!("b"), rows[2].row["k"]);

        let child = schema.table("events__tags").unwrap();
        assert_eq!(Some("events".to_string()), child.parent);
        assert_eq!(DataType::Text, child.columns["k"].data_type);
        assert!(child.columns[PARENT_ID_COLUMN].foreign_key);
        assert_eq!(
            WriteDisposition::Append,
            schema.write_disposition("events__tags").unwrap()
        );
    }

    #[test]
    fn lists_of_scalars_become_value_rows() {
        let mut schema = Schema::new("event").unwrap();
        let (rows, _) = normalize(&mut schema, json!({"id": 1, "tags": ["a", "b"]}), "events");

        assert_eq!(3, rows.len());
        assert_eq!(json!("a"), rows[1].row[VALUE_COLUMN]);
        assert_eq!(json!("b"), rows[2].row[VALUE_COLUMN]);
        assert_eq!(json!(1), rows[2].row[LIST_IDX_COLUMN]);
    }

    #[test]
    fn non_mapping_input_is_wrapped() {
        let mut schema = Schema::new("event").unwrap();
        let (rows, _) = normalize(&mut schema, json!("plain"), "events");
        assert_eq!(1, rows.len());
        assert_eq!(json!("plain"), rows[0].row["v"]);
    }

    #[test]
    fn type_conflict_surfaces_cannot_coerce() {
        let mut schema = Schema::new("event").unwrap();
        normalize(&mut schema, json!({"id": 1}), "events");

        let err = normalize_record(&mut schema, json!({"id": "not-a-number"}), "events", 127)
            .unwrap_err();
        match err {
            SchemaError::CannotCoerceColumn {
                table,
                column,
                declared,
                observed,
            } => {
                assert_eq!("events", table);
                assert_eq!("id", column);
                assert_eq!(DataType::Bigint, declared);
                assert_eq!(DataType::Text, observed);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn established_bigint_accepts_in_window_epochs() {
        let mut schema = Schema::new("event").unwrap();
        // 100 is outside the timestamp window, so the column lands as bigint.
        normalize(&mut schema, json!({"n": 100}), "events");
        // An in-window value detects as timestamp, but its base class still
        // fits the established column.
        let (rows, update) = normalize(&mut schema, json!({"n": 1_690_000_000}), "events");
        assert_eq!(json!(1_690_000_000), rows[0].row["n"]);
        assert!(update.is_empty());
        assert_eq!(
            DataType::Bigint,
            schema.table("events").unwrap().columns["n"].data_type
        );
    }

    #[test]
    fn pinned_complex_columns_stop_the_walk() {
        let mut schema = Schema::new("event").unwrap();
        let mut settings = SchemaSettings::default();
        settings
            .preferred_types
            .insert("re:^payload$".to_string(), DataType::Complex);
        schema.set_settings(settings).unwrap();

        let (rows, _) = normalize(
            &mut schema,
            json!({"payload": {"b": 2, "a": [1, {"x": true}]}}),
            "events",
        );

        // The subtree is carried verbatim as canonical JSON text.
        assert_eq!(1, rows.len());
        assert_eq!(
            json!(r#"{"a":[1,{"x":true}],"b":2}"#),
            rows[0].row["payload"]
        );
        assert_eq!(
            DataType::Complex,
            schema.table("events").unwrap().columns["payload"].data_type
        );

        // Later records keep serializing against the pinned column.
        let (rows, update) = normalize(&mut schema, json!({"payload": {"c": 3}}), "events");
        assert_eq!(json!(r#"{"c":3}"#), rows[0].row["payload"]);
        assert!(update.is_empty());
    }

    #[test]
    fn excluded_paths_prune_columns_and_subtrees() {
        let mut schema = Schema::new("event").unwrap();
        let table = Table {
            filters: Some(RowFilters {
                excludes: vec!["re:^meta".to_string()],
                includes: vec!["re:^meta__keep$".to_string()],
            }),
            ..Table::new("events")
        };
        schema.update_schema(table).unwrap();

        let (rows, _) = normalize(
            &mut schema,
            json!({"id": 1, "meta": {"keep": "yes", "secret": "no"}, "meta_list": [1]}),
            "events",
        );

        let row = &rows[0].row;
        assert_eq!(json!("yes"), row["meta__keep"]);
        assert!(!row.contains_key("meta__secret"));
        // `meta_list` matches the exclude prefix; its child table never forms.
        assert_eq!(1, rows.len());
        assert!(schema.table("events__meta_list").is_none());
    }

    #[test]
    fn long_paths_are_shortened_deterministically() {
        let mut schema = Schema::new("event").unwrap();
        let mut inner = Map::new();
        inner.insert("b".repeat(200), json!(1));
        let mut outer = Map::new();
        outer.insert("a".repeat(200), Value::Object(inner));
        let deep = Value::Object(outer);
        let (rows, _) = normalize_record(&mut schema, deep.clone(), "events", 64).unwrap();
        let column = rows[0]
            .row
            .keys()
            .find(|k| *k != ROW_ID_COLUMN)
            .unwrap()
            .clone();
        assert_eq!(64, column.len());

        let (rows2, _) = normalize_record(&mut schema, deep, "events", 64).unwrap();
        assert!(rows2[0].row.contains_key(&column));
    }

    #[test]
    fn canonical_json_sorts_keys_and_keeps_list_order() {
        let value = json!({"b": [3, 1, {"z": 0, "a": 1}], "a": true});
        assert_eq!(
            r#"{"a":true,"b":[3,1,{"a":1,"z":0}]}"#,
            to_canonical_json(&value)
        );
    }
}
