//! The live schema: an ordered set of tables plus settings, mutated only
//! through the inference/update API and persisted as YAML alongside each load
//! package.

use crate::inference::{can_coerce, detect_type, value_data_type};
use crate::names::normalize_schema_name;
use crate::types::{
    Column, ColumnHint, DataType, Detection, NormalizersConfig, SchemaSettings, StoredSchema,
    Table, WriteDisposition,
};
use crate::SchemaError;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// Version of the schema format itself, bumped when the stored layout
/// changes. Distinct from `version`, which tracks content mutations.
pub const ENGINE_VERSION: u64 = 2;

/// Prefix marking a settings or filter string as a regex; anything without it
/// is matched as a literal path.
pub const SIMPLE_REGEX_PREFIX: &str = "re:";

/// A `re:`-prefixed pattern or a literal path.
#[derive(Debug, Clone)]
enum SimpleRegex {
    Exact(String),
    Pattern(Regex),
}

impl SimpleRegex {
    fn compile(spec: &str) -> Result<Self, SchemaError> {
        match spec.strip_prefix(SIMPLE_REGEX_PREFIX) {
            Some(pattern) => Ok(SimpleRegex::Pattern(
                Regex::new(pattern).map_err(|e| SchemaError::InvalidRegex(spec.into(), e))?,
            )),
            None => Ok(SimpleRegex::Exact(spec.to_string())),
        }
    }

    fn is_match(&self, path: &str) -> bool {
        match self {
            SimpleRegex::Exact(p) => p == path,
            SimpleRegex::Pattern(re) => re.is_match(path),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CompiledFilters {
    excludes: Vec<SimpleRegex>,
    includes: Vec<SimpleRegex>,
}

#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    version: u64,
    engine_version: u64,
    settings: SchemaSettings,
    tables: IndexMap<String, Table>,
    normalizers: NormalizersConfig,
    /// Set by the first mutation after a persist; that mutation alone bumps
    /// `version`.
    dirty: bool,
    preferred: Vec<(SimpleRegex, DataType)>,
    default_hints: Vec<(ColumnHint, Vec<SimpleRegex>)>,
    filters: HashMap<String, CompiledFilters>,
}

impl Schema {
    /// Creates an empty schema. The creation itself counts as the first
    /// unpersisted mutation, so the schema stays at version 1 through its
    /// first persist.
    pub fn new(name: &str) -> Result<Self, SchemaError> {
        let name = normalize_schema_name(name)?;
        Ok(Schema {
            name,
            version: 1,
            engine_version: ENGINE_VERSION,
            settings: SchemaSettings::default(),
            tables: IndexMap::new(),
            normalizers: NormalizersConfig::default(),
            dirty: true,
            preferred: Vec::new(),
            default_hints: Vec::new(),
            filters: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn engine_version(&self) -> u64 {
        self.engine_version
    }

    pub fn tables(&self) -> &IndexMap<String, Table> {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn settings(&self) -> &SchemaSettings {
        &self.settings
    }

    pub fn detections(&self) -> &[Detection] {
        self.normalizers.detections.as_deref().unwrap_or(&[])
    }

    /// Replaces the settings block, recompiling the regex caches.
    pub fn set_settings(&mut self, settings: SchemaSettings) -> Result<(), SchemaError> {
        self.settings = settings;
        self.rebuild_caches()?;
        self.touch();
        Ok(())
    }

    /// Merges a partial table definition and returns the effective diff:
    /// the whole table when it is new, the added or weakened columns when it
    /// already exists, `None` when nothing changed.
    ///
    /// A conflicting `data_type` on a known column is a terminal schema
    /// error. `nullable` may only weaken. Hint changes on known columns are
    /// dropped: hints are honored at creation time only.
    pub fn update_schema(&mut self, partial: Table) -> Result<Option<Table>, SchemaError> {
        let sealed = self.settings.sealed();
        let table_name = partial.name.clone();

        if !self.tables.contains_key(&table_name) {
            if sealed {
                return Err(SchemaError::SchemaSealed(self.name.clone()));
            }
            if let Some(parent) = &partial.parent {
                if !self.tables.contains_key(parent) {
                    return Err(SchemaError::UnknownParentTable {
                        table: table_name,
                        parent: parent.clone(),
                    });
                }
            }
            self.tables.insert(table_name.clone(), partial.clone());
            self.compile_table_filters(&table_name)?;
            self.touch();
            return Ok(Some(partial));
        }

        let mut diff = Table::new(table_name.clone());
        {
            let existing = self.tables.get_mut(&table_name).unwrap();
            diff.parent = existing.parent.clone();

            for (column_name, incoming) in partial.columns {
                match existing.columns.get_mut(&column_name) {
                    Some(current) => {
                        if current.data_type != incoming.data_type {
                            return Err(SchemaError::CannotCoerceColumn {
                                table: table_name,
                                column: column_name,
                                declared: current.data_type,
                                observed: incoming.data_type,
                            });
                        }
                        if incoming.nullable && !current.nullable {
                            current.nullable = true;
                            diff.push_column(current.clone());
                        }
                    }
                    None => {
                        if sealed {
                            return Err(SchemaError::SchemaSealed(self.name.clone()));
                        }
                        existing.columns.insert(column_name, incoming.clone());
                        diff.push_column(incoming);
                    }
                }
            }
        }

        if diff.columns.is_empty() {
            Ok(None)
        } else {
            self.touch();
            Ok(Some(diff))
        }
    }

    /// Checks that a value observed as `observed` may land in an existing
    /// column without changing its declared type. Unknown tables and columns
    /// pass: they are the new-column path.
    pub fn check_compatible(
        &self,
        table: &str,
        column: &str,
        observed: DataType,
    ) -> Result<(), SchemaError> {
        let declared = match self.tables.get(table).and_then(|t| t.columns.get(column)) {
            Some(c) => c.data_type,
            None => return Ok(()),
        };
        if can_coerce(declared, observed) {
            Ok(())
        } else {
            Err(SchemaError::CannotCoerceColumn {
                table: table.to_string(),
                column: column.to_string(),
                declared,
                observed,
            })
        }
    }

    /// The preferred type configured for a path, if any. Evaluation order is
    /// definition order; the first match wins.
    pub fn preferred_type(&self, path: &str) -> Option<DataType> {
        self.preferred
            .iter()
            .find(|(matcher, _)| matcher.is_match(path))
            .map(|(_, data_type)| *data_type)
    }

    /// Infers the data type for a value at a flattened column path:
    /// preferred types first (definition order), then the registered
    /// detections, then the base value mapping. `Null` has no type.
    pub fn infer_column_type(&self, path: &str, value: &Value) -> Option<DataType> {
        if value.is_null() {
            return None;
        }
        if let Some(data_type) = self.preferred_type(path) {
            return Some(data_type);
        }
        if let Some(data_type) = detect_type(self.detections(), value) {
            return Some(data_type);
        }
        value_data_type(value)
    }

    /// Builds a new column for `path`, applying any default hints whose
    /// patterns match it.
    pub fn new_column(&self, name: &str, path: &str, data_type: DataType) -> Column {
        let mut column = Column::new(name, data_type);
        for (hint, matchers) in &self.default_hints {
            if matchers.iter().any(|m| m.is_match(path)) {
                column.set_hint(*hint, true);
            }
        }
        column
    }

    /// Applies the table's row filters to a flattened path: excludes first,
    /// then includes re-admit. With no filters everything is kept.
    pub fn filter_row(&self, table: &str, path: &str) -> bool {
        let Some(filters) = self.filters.get(table) else {
            return true;
        };
        if filters.excludes.iter().any(|m| m.is_match(path)) {
            return filters.includes.iter().any(|m| m.is_match(path));
        }
        true
    }

    /// Resolves the effective write disposition of a table, walking child
    /// tables up to their root.
    pub fn write_disposition(&self, table_name: &str) -> Result<WriteDisposition, SchemaError> {
        let mut current = table_name;
        loop {
            let table = self
                .tables
                .get(current)
                .ok_or_else(|| SchemaError::UnknownTable(table_name.to_string()))?;
            if let Some(disposition) = table.write_disposition {
                return Ok(disposition);
            }
            match &table.parent {
                Some(parent) => current = parent,
                None => return Ok(WriteDisposition::default()),
            }
        }
    }

    /// Marks the in-memory schema as persisted: the next mutation will bump
    /// the version again.
    pub fn mark_persisted(&mut self) {
        self.dirty = false;
    }

    fn touch(&mut self) {
        if !self.dirty {
            self.version += 1;
            self.dirty = true;
        }
    }

    pub fn to_stored(&self) -> StoredSchema {
        StoredSchema {
            version: self.version,
            engine_version: self.engine_version,
            name: self.name.clone(),
            settings: self.settings.clone(),
            tables: self.tables.clone(),
            normalizers: self.normalizers.clone(),
        }
    }

    pub fn from_stored(stored: StoredSchema) -> Result<Self, SchemaError> {
        let stored = migrate_engine(stored)?;
        // Stored names are already canonical; reject anything that is not.
        if normalize_schema_name(&stored.name)? != stored.name {
            return Err(SchemaError::InvalidName(stored.name));
        }
        let mut schema = Schema {
            name: stored.name,
            version: stored.version,
            engine_version: stored.engine_version,
            settings: stored.settings,
            tables: stored.tables,
            normalizers: stored.normalizers,
            dirty: false,
            preferred: Vec::new(),
            default_hints: Vec::new(),
            filters: HashMap::new(),
        };
        schema.rebuild_caches()?;
        Ok(schema)
    }

    pub fn to_yaml(&self, remove_defaults: bool) -> Result<String, SchemaError> {
        let mut value = serde_yaml::to_value(self.to_stored())?;
        if remove_defaults {
            strip_defaults(&mut value);
        }
        Ok(serde_yaml::to_string(&value)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, SchemaError> {
        let stored: StoredSchema = serde_yaml::from_str(text)?;
        Self::from_stored(stored)
    }

    fn rebuild_caches(&mut self) -> Result<(), SchemaError> {
        self.preferred = self
            .settings
            .preferred_types
            .iter()
            .map(|(spec, data_type)| Ok((SimpleRegex::compile(spec)?, *data_type)))
            .collect::<Result<_, SchemaError>>()?;
        self.default_hints = self
            .settings
            .default_hints
            .iter()
            .map(|(hint, specs)| {
                let matchers = specs
                    .iter()
                    .map(|s| SimpleRegex::compile(s))
                    .collect::<Result<_, SchemaError>>()?;
                Ok((*hint, matchers))
            })
            .collect::<Result<_, SchemaError>>()?;
        self.filters.clear();
        let names: Vec<String> = self.tables.keys().cloned().collect();
        for name in names {
            self.compile_table_filters(&name)?;
        }
        Ok(())
    }

    fn compile_table_filters(&mut self, table_name: &str) -> Result<(), SchemaError> {
        let Some(filters) = self.tables.get(table_name).and_then(|t| t.filters.clone()) else {
            return Ok(());
        };
        let compiled = CompiledFilters {
            excludes: filters
                .excludes
                .iter()
                .map(|s| SimpleRegex::compile(s))
                .collect::<Result<_, SchemaError>>()?,
            includes: filters
                .includes
                .iter()
                .map(|s| SimpleRegex::compile(s))
                .collect::<Result<_, SchemaError>>()?,
        };
        self.filters.insert(table_name.to_string(), compiled);
        Ok(())
    }
}

/// Runs stored-format migrations up to [`ENGINE_VERSION`].
fn migrate_engine(mut stored: StoredSchema) -> Result<StoredSchema, SchemaError> {
    while stored.engine_version < ENGINE_VERSION {
        match stored.engine_version {
            // v1 predates the normalizers block; backfill the defaults it
            // implicitly used.
            1 => {
                stored.normalizers = NormalizersConfig::default();
                stored.engine_version = 2;
            }
            other => return Err(SchemaError::UnsupportedEngineVersion(other)),
        }
    }
    if stored.engine_version > ENGINE_VERSION {
        return Err(SchemaError::UnsupportedEngineVersion(stored.engine_version));
    }
    Ok(stored)
}

/// Removes every field equal to its declared default from a serialized
/// schema, so that stored files stay minimal.
fn strip_defaults(value: &mut serde_yaml::Value) {
    use serde_yaml::Value as Y;

    let Some(tables) = value
        .as_mapping_mut()
        .and_then(|m| m.get_mut(&Y::String("tables".into())))
        .and_then(Y::as_mapping_mut)
    else {
        return;
    };

    for (_, table) in tables.iter_mut() {
        let Some(columns) = table
            .as_mapping_mut()
            .and_then(|m| m.get_mut(&Y::String("columns".into())))
            .and_then(Y::as_mapping_mut)
        else {
            continue;
        };
        for (_, column) in columns.iter_mut() {
            let Some(column) = column.as_mapping_mut() else {
                continue;
            };
            let mut drop_keys = Vec::new();
            for (key, field) in column.iter() {
                let Some(key) = key.as_str() else { continue };
                let is_default = match key {
                    "nullable" => field.as_bool() == Some(true),
                    "partition" | "cluster" | "primary_key" | "foreign_key" | "sort"
                    | "unique" => field.as_bool() == Some(false),
                    _ => false,
                };
                if is_default {
                    drop_keys.push(Y::String(key.to_string()));
                }
            }
            for key in drop_keys {
                column.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::RowFilters;

    fn bootstrap() -> Schema {
        let mut schema = Schema::new("event").unwrap();
        let table = Table::new("events")
            .with_write_disposition(WriteDisposition::Append)
            .with_column(Column::new("id", DataType::Bigint))
            .with_column(Column::new("ev", DataType::Text));
        schema.update_schema(table).unwrap();
        schema
    }

    #[test]
    fn version_bumps_once_per_persist_cycle() {
        let mut schema = bootstrap();
        // Creation plus any number of pre-persist mutations stay at 1.
        assert_eq!(1, schema.version());
        schema
            .update_schema(Table::new("events").with_column(Column::new("ts", DataType::Timestamp)))
            .unwrap();
        assert_eq!(1, schema.version());

        schema.mark_persisted();
        schema
            .update_schema(Table::new("events").with_column(Column::new("k", DataType::Text)))
            .unwrap();
        schema
            .update_schema(Table::new("events").with_column(Column::new("l", DataType::Text)))
            .unwrap();
        assert_eq!(2, schema.version());
    }

    #[test]
    fn identical_update_is_a_noop() {
        let mut schema = bootstrap();
        schema.mark_persisted();
        let diff = schema
            .update_schema(Table::new("events").with_column(Column::new("id", DataType::Bigint)))
            .unwrap();
        assert!(diff.is_none());
        assert_eq!(1, schema.version());
    }

    #[test]
    fn conflicting_data_type_is_terminal() {
        let mut schema = bootstrap();
        let err = schema
            .update_schema(Table::new("events").with_column(Column::new("id", DataType::Text)))
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
    fn nullable_only_weakens() {
        let mut schema = Schema::new("event").unwrap();
        schema
            .update_schema(
                Table::new("events").with_column(Column::new("id", DataType::Bigint).not_null()),
            )
            .unwrap();

        // Weakening to nullable is applied and reported.
        let diff = schema
            .update_schema(Table::new("events").with_column(Column::new("id", DataType::Bigint)))
            .unwrap()
            .unwrap();
        assert!(diff.columns["id"].nullable);

        // Attempting to strengthen back is silently ignored.
        let diff = schema
            .update_schema(
                Table::new("events").with_column(Column::new("id", DataType::Bigint).not_null()),
            )
            .unwrap();
        assert!(diff.is_none());
        assert!(schema.table("events").unwrap().columns["id"].nullable);
    }

    #[test]
    fn hint_changes_on_existing_columns_are_dropped() {
        let mut schema = bootstrap();
        let diff = schema
            .update_schema(
                Table::new("events")
                    .with_column(Column::new("id", DataType::Bigint).with_hint(ColumnHint::Cluster)),
            )
            .unwrap();
        assert!(diff.is_none());
        assert!(!schema.table("events").unwrap().columns["id"].cluster);
    }

    #[test]
    fn sealed_schema_rejects_growth() {
        let mut schema = bootstrap();
        schema
            .set_settings(SchemaSettings {
                schema_sealed: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(
            schema.update_schema(Table::new("clicks")),
            Err(SchemaError::SchemaSealed(_))
        ));
        assert!(matches!(
            schema.update_schema(
                Table::new("events").with_column(Column::new("new_col", DataType::Text))
            ),
            Err(SchemaError::SchemaSealed(_))
        ));
    }

    #[test]
    fn child_tables_inherit_write_disposition() {
        let mut schema = Schema::new("event").unwrap();
        schema
            .update_schema(Table::new("events").with_write_disposition(WriteDisposition::Replace))
            .unwrap();
        schema
            .update_schema(Table::new("events__tags").with_parent("events"))
            .unwrap();
        assert_eq!(
            WriteDisposition::Replace,
            schema.write_disposition("events__tags").unwrap()
        );
        assert!(schema.write_disposition("unknown").is_err());
    }

    #[test]
    fn child_tables_require_a_known_parent() {
        let mut schema = Schema::new("event").unwrap();
        assert!(matches!(
            schema.update_schema(Table::new("events__tags").with_parent("events")),
            Err(SchemaError::UnknownParentTable { .. })
        ));
    }

    #[test]
    fn preferred_types_win_over_detections() {
        let mut schema = Schema::new("event").unwrap();
        let mut settings = SchemaSettings::default();
        settings
            .preferred_types
            .insert("re:timestamp$".to_string(), DataType::Text);
        schema.set_settings(settings).unwrap();

        // The raw value would detect as an epoch timestamp, but the
        // preference pins text.
        assert_eq!(
            Some(DataType::Text),
            schema.infer_column_type("event__timestamp", &serde_json::json!(1_690_000_000))
        );
        assert_eq!(
            Some(DataType::Timestamp),
            schema.infer_column_type("event__other", &serde_json::json!(1_690_000_000))
        );
    }

    #[test]
    fn default_hints_apply_at_creation() {
        let mut schema = Schema::new("event").unwrap();
        let mut settings = SchemaSettings::default();
        settings
            .default_hints
            .insert(ColumnHint::Unique, vec!["re:^_dlt_id$".to_string()]);
        schema.set_settings(settings).unwrap();

        let column = schema.new_column("_dlt_id", "_dlt_id", DataType::Text);
        assert!(column.unique);
        let column = schema.new_column("other", "other", DataType::Text);
        assert!(!column.unique);
    }

    #[test]
    fn row_filters_exclude_then_include() {
        let mut schema = Schema::new("event").unwrap();
        let table = Table {
            filters: Some(RowFilters {
                excludes: vec!["re:^meta".to_string()],
                includes: vec!["re:^meta__keep".to_string()],
            }),
            ..Table::new("events")
        };
        schema.update_schema(table).unwrap();

        assert!(schema.filter_row("events", "id"));
        assert!(!schema.filter_row("events", "meta__secret"));
        assert!(schema.filter_row("events", "meta__keep__flag"));
        // A table with no filters keeps everything.
        assert!(schema.filter_row("clicks", "anything"));
    }

    #[test]
    fn yaml_round_trips() {
        let mut schema = bootstrap();
        schema
            .update_schema(
                Table::new("events__tags")
                    .with_parent("events")
                    .with_column(Column::new("k", DataType::Text)),
            )
            .unwrap();

        let full = schema.to_yaml(false).unwrap();
        let restored = Schema::from_yaml(&full).unwrap();
        assert_eq!(schema.to_stored(), restored.to_stored());

        // With defaults removed the file still parses to the same schema and
        // re-saves identically.
        let minimal = schema.to_yaml(true).unwrap();
        assert!(minimal.len() < full.len());
        let restored = Schema::from_yaml(&minimal).unwrap();
        assert_eq!(schema.to_stored(), restored.to_stored());
        assert_eq!(minimal, restored.to_yaml(true).unwrap());
    }

    #[test]
    fn engine_version_one_is_migrated() {
        let yaml = r#"
version: 4
engine_version: 1
name: legacy
tables: {}
"#;
        let schema = Schema::from_yaml(yaml).unwrap();
        assert_eq!(ENGINE_VERSION, schema.engine_version());
        assert_eq!(
            &[Detection::Timestamp, Detection::IsoTimestamp][..],
            schema.detections()
        );
    }

    #[test]
    fn future_engine_versions_are_rejected() {
        let yaml = r#"
version: 1
engine_version: 99
name: future
tables: {}
"#;
        assert!(matches!(
            Schema::from_yaml(yaml),
            Err(SchemaError::UnsupportedEngineVersion(99))
        ));
    }
}
