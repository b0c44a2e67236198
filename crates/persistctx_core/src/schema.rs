//! Schema declaration surface and frozen schema model.
//!
//! # Responsibility
//! - Give schema callbacks a mutable builder to declare entities.
//! - Freeze builder state into an immutable, shareable [`Schema`].
//! - Render the frozen schema as idempotent SQLite DDL.
//!
//! # Invariants
//! - Entity, table, and property names are plain SQL identifiers.
//! - Keys and indexes only reference properties declared on the same entity.
//! - Entity order follows first declaration order.
//! - Index names (`ix_<table>_<columns>`) are unique per entity.

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Storage type of one entity property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
    /// Stored as `INTEGER` 0/1.
    Boolean,
    /// Unix epoch milliseconds stored as `INTEGER`.
    Timestamp,
}

impl ColumnType {
    /// SQLite column affinity.
    pub fn sqlite_affinity(self) -> &'static str {
        match self {
            Self::Integer | Self::Boolean | Self::Timestamp => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }
}

/// One declared entity property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDef {
    pub name: String,
    pub column_type: ColumnType,
    pub required: bool,
}

/// One declared secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    fn name_suffix(&self) -> String {
        self.columns.join("_")
    }
}

/// Schema declaration errors raised by builder methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    InvalidIdentifier(String),
    DuplicateProperty { entity: String, property: String },
    UnknownProperty { entity: String, property: String },
    EmptyColumnList { entity: String },
    DuplicateIndex { entity: String, name: String },
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier(value) => write!(f, "invalid schema identifier: `{value}`"),
            Self::DuplicateProperty { entity, property } => {
                write!(f, "property `{property}` already declared on `{entity}`")
            }
            Self::UnknownProperty { entity, property } => {
                write!(f, "property `{property}` is not declared on `{entity}`")
            }
            Self::EmptyColumnList { entity } => {
                write!(f, "key or index on `{entity}` needs at least one column")
            }
            Self::DuplicateIndex { entity, name } => {
                write!(f, "index `{name}` already declared on `{entity}`")
            }
        }
    }
}

impl Error for SchemaError {}

/// Frozen declaration of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    name: String,
    table: String,
    properties: Vec<PropertyDef>,
    key: Vec<String>,
    indexes: Vec<IndexDef>,
}

impl EntityDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|property| property.name == name)
    }

    pub fn key(&self) -> &[String] {
        &self.key
    }

    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Returns whether the entity maps to at least one column. Entities
    /// without properties have no table to create.
    pub fn has_columns(&self) -> bool {
        !self.properties.is_empty()
    }

    fn create_table_sql(&self) -> String {
        let mut columns = self
            .properties
            .iter()
            .map(|property| {
                let mut column = format!(
                    "    \"{}\" {}",
                    property.name,
                    property.column_type.sqlite_affinity()
                );
                if property.required || self.key.contains(&property.name) {
                    column.push_str(" NOT NULL");
                }
                column
            })
            .collect::<Vec<_>>();
        if !self.key.is_empty() {
            columns.push(format!("    PRIMARY KEY ({})", quoted_list(&self.key)));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n{}\n);",
            self.table,
            columns.join(",\n")
        )
    }

    fn create_index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|index| {
                format!(
                    "CREATE {}INDEX IF NOT EXISTS \"ix_{}_{}\" ON \"{}\" ({});",
                    if index.unique { "UNIQUE " } else { "" },
                    self.table,
                    index.name_suffix(),
                    self.table,
                    quoted_list(&index.columns)
                )
            })
            .collect()
    }
}

/// Mutable handle for one entity inside a [`SchemaBuilder`].
#[derive(Debug)]
pub struct EntityBuilder {
    def: EntityDef,
}

impl EntityBuilder {
    /// Maps the entity to a table name other than its own name.
    pub fn to_table(&mut self, table: &str) -> Result<&mut Self, SchemaError> {
        self.def.table = identifier(table)?;
        Ok(self)
    }

    /// Declares one optional property.
    pub fn property(&mut self, name: &str, column_type: ColumnType) -> Result<&mut Self, SchemaError> {
        let name = identifier(name)?;
        if self.def.property(&name).is_some() {
            return Err(SchemaError::DuplicateProperty {
                entity: self.def.name.clone(),
                property: name,
            });
        }
        self.def.properties.push(PropertyDef {
            name,
            column_type,
            required: false,
        });
        Ok(self)
    }

    /// Marks an already declared property as `NOT NULL`.
    pub fn required(&mut self, name: &str) -> Result<&mut Self, SchemaError> {
        let entity = self.def.name.clone();
        let property = self
            .def
            .properties
            .iter_mut()
            .find(|property| property.name == name)
            .ok_or_else(|| SchemaError::UnknownProperty {
                entity,
                property: name.to_string(),
            })?;
        property.required = true;
        Ok(self)
    }

    /// Sets the primary key, replacing any previous key.
    pub fn has_key(&mut self, columns: &[&str]) -> Result<&mut Self, SchemaError> {
        self.def.key = self.declared_columns(columns)?;
        Ok(self)
    }

    /// Adds a secondary index.
    ///
    /// Rejects a second index that would render under the same name, which
    /// covers repeated column lists regardless of uniqueness.
    pub fn has_index(&mut self, columns: &[&str], unique: bool) -> Result<&mut Self, SchemaError> {
        let index = IndexDef {
            columns: self.declared_columns(columns)?,
            unique,
        };
        let suffix = index.name_suffix();
        if self
            .def
            .indexes
            .iter()
            .any(|existing| existing.name_suffix() == suffix)
        {
            return Err(SchemaError::DuplicateIndex {
                entity: self.def.name.clone(),
                name: format!("ix_{}_{suffix}", self.def.table),
            });
        }
        self.def.indexes.push(index);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    fn declared_columns(&self, columns: &[&str]) -> Result<Vec<String>, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::EmptyColumnList {
                entity: self.def.name.clone(),
            });
        }
        columns
            .iter()
            .map(|column| match self.def.property(column) {
                Some(property) => Ok(property.name.clone()),
                None => Err(SchemaError::UnknownProperty {
                    entity: self.def.name.clone(),
                    property: (*column).to_string(),
                }),
            })
            .collect()
    }
}

/// Mutable schema state handed to schema callbacks during one build.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<EntityBuilder>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named entity, declaring it first if needed.
    pub fn entity(&mut self, name: &str) -> Result<&mut EntityBuilder, SchemaError> {
        let name = identifier(name)?;
        let index = match self.position(&name) {
            Some(index) => index,
            None => {
                self.entities.push(EntityBuilder {
                    def: EntityDef {
                        table: name.clone(),
                        name,
                        properties: Vec::new(),
                        key: Vec::new(),
                        indexes: Vec::new(),
                    },
                });
                self.entities.len() - 1
            }
        };
        Ok(&mut self.entities[index])
    }

    /// Removes a declared entity. Returns whether it was present.
    pub fn ignore(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(index) => {
                self.entities.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains_entity(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(EntityBuilder::name).collect()
    }

    /// Consumes builder state into an immutable schema.
    pub fn freeze(self) -> Schema {
        Schema {
            entities: self.entities.into_iter().map(|entity| entity.def).collect(),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entities.iter().position(|entity| entity.def.name == name)
    }
}

/// Immutable schema produced by a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    entities: Vec<EntityDef>,
}

impl Schema {
    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|entity| entity.name == name)
    }

    pub fn contains_entity(&self, name: &str) -> bool {
        self.entity(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Renders idempotent SQLite DDL for every entity with columns.
    /// Entities without properties are skipped; the script is empty when no
    /// entity has columns.
    pub fn create_script(&self) -> String {
        let mut statements = Vec::new();
        for entity in self.entities.iter().filter(|entity| entity.has_columns()) {
            statements.push(entity.create_table_sql());
            statements.extend(entity.create_index_sql());
        }
        statements.join("\n")
    }
}

fn identifier(value: &str) -> Result<String, SchemaError> {
    if IDENTIFIER_RE.is_match(value) {
        Ok(value.to_string())
    } else {
        Err(SchemaError::InvalidIdentifier(value.to_string()))
    }
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| format!("\"{column}\""))
        .collect::<Vec<_>>()
        .join(", ")
}
