/// Catalog
///
/// The catalog declares everything a database holds: relations, sequences
/// and materialized views. It is built with the builder methods or read from
/// JSON and checked as a whole by `validate()` before a database is opened.
///
/// # Examples
///
/// ```
/// use livecursor::Catalog;
///
/// let catalog = Catalog::from_json(r#"{
///     "relations": [{
///         "name": "orders",
///         "columns": [
///             {"name": "id", "type": "int", "nullable": false,
///              "default": {"next_val": "order_ids"}},
///             {"name": "total", "type": "decimal", "precision": 10, "scale": 2}
///         ],
///         "primary_key": ["id"]
///     }],
///     "sequences": [{"name": "order_ids", "start": 100}]
/// }"#).unwrap();
///
/// assert!(catalog.validate().is_ok());
/// assert_eq!(catalog.sequences[0].start, 100);
/// ```

use crate::column::{ColumnDefault, ColumnType};
use crate::error::{CursorError, Result};
use crate::mview::MaterializedViewDef;
use crate::sequence::SequenceDef;
use crate::table::{RelationKind, Schema};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub relations: Vec<Schema>,
    #[serde(default)]
    pub sequences: Vec<SequenceDef>,
    #[serde(default)]
    pub materialized_views: Vec<MaterializedViewDef>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(mut self, schema: Schema) -> Self {
        self.relations.push(schema);
        self
    }

    pub fn sequence(mut self, def: SequenceDef) -> Self {
        self.sequences.push(def);
        self
    }

    pub fn materialized_view(mut self, def: MaterializedViewDef) -> Self {
        self.materialized_views.push(def);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CursorError::InvalidCatalog(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CursorError::InvalidCatalog(e.to_string()))
    }

    pub fn find_relation(&self, name: &str) -> Option<&Schema> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Check every declaration and the references between them.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut claim = |name: &str| {
            if names.insert(name.to_string()) {
                Ok(())
            } else {
                Err(CursorError::InvalidCatalog(format!("name '{}' is declared twice", name)))
            }
        };

        for schema in &self.relations {
            claim(&schema.name)?;
            if schema.kind == RelationKind::MaterializedView {
                return Err(CursorError::InvalidCatalog(format!(
                    "relation '{}' is declared as a materialized view; declare it under materialized_views",
                    schema.name
                )));
            }
            schema.validate()?;
        }
        for view in &self.materialized_views {
            claim(&view.name)?;
        }
        let mut sequence_names = HashSet::new();
        for sequence in &self.sequences {
            sequence.validate()?;
            if !sequence_names.insert(sequence.name.as_str()) {
                return Err(CursorError::InvalidCatalog(format!(
                    "sequence '{}' is declared twice",
                    sequence.name
                )));
            }
        }

        for schema in &self.relations {
            for column in &schema.columns {
                match &column.default {
                    None => {}
                    Some(ColumnDefault::Value(text)) => {
                        let value = column.column_type.parse_literal(text).ok_or_else(|| {
                            CursorError::InvalidCatalog(format!(
                                "default '{}' of column '{}.{}' is not a valid {}",
                                text, schema.name, column.name, column.column_type
                            ))
                        })?;
                        if !value.is_null() {
                            column.coerce(value)?;
                        }
                    }
                    Some(ColumnDefault::NextVal(sequence)) => {
                        if !sequence_names.contains(sequence.as_str()) {
                            return Err(CursorError::UnknownSequence(sequence.clone()));
                        }
                        if column.column_type != ColumnType::Int {
                            return Err(CursorError::InvalidCatalog(format!(
                                "column '{}.{}' draws from sequence '{}' but is {}",
                                schema.name, column.name, sequence, column.column_type
                            )));
                        }
                    }
                }
            }
        }

        for view in &self.materialized_views {
            let source = self
                .find_relation(&view.source)
                .ok_or_else(|| CursorError::UnknownRelation(view.source.clone()))?;
            view.backing_schema(source)?.validate()?;
        }
        Ok(())
    }
}
