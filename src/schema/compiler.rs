// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Schema compilation: declared record types become index definitions.
//!
//! Walks a [`RecordSchema`] and produces the ordered list of index fields the
//! server will be asked to create. Nested records are unfolded into the
//! parent's index with dotted JSON paths and flattened query-time names
//! (`$.address.city` is queried as `address_city` — the dot is unusable in
//! field identifiers).
//!
//! Compilation is eager and total: every invalid field configuration is
//! rejected here, when the record type is registered, never later.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{OmError, Result};
use crate::keys::KeyCodec;
use crate::schema::{
    FieldDef, FieldType, IndexOptions, IndexState, RecordSchema, StorageLayout, VectorOptions,
};

/// Index field kind, as understood by the search engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Tag,
    Text,
    Numeric,
    Geo,
    Vector,
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Tag => write!(f, "TAG"),
            FieldKind::Text => write!(f, "TEXT"),
            FieldKind::Numeric => write!(f, "NUMERIC"),
            FieldKind::Geo => write!(f, "GEO"),
            FieldKind::Vector => write!(f, "VECTOR"),
        }
    }
}

/// One entry in the compiled index definition.
///
/// Serializable so migration snapshot files can carry full index
/// definitions in both directions (apply and rollback).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexField {
    /// Query-time name (`address_city` for `$.address.city`).
    pub query_name: String,
    /// Where the value lives: the hash field name, or a JSON path
    /// (`$.a.b`, `$.a[*]` for lists).
    pub path: String,
    pub kind: FieldKind,
    pub sortable: bool,
    pub case_sensitive: bool,
    /// Tag fields only.
    pub separator: Option<char>,
    /// Vector fields only.
    pub vector: Option<VectorOptions>,
    /// The declared field is a list; containment queries are legal.
    #[serde(default)]
    pub multi_value: bool,
    /// The declared field is a datetime or date; used by drift detection.
    #[serde(default)]
    pub datetime: bool,
}

/// A compiled record schema: the declared shape plus everything derived from
/// it (index fields, key shapes, lookup tables). Built once at registration,
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    pub record: String,
    pub layout: StorageLayout,
    pub key_prefix: String,
    pub all_keys_pattern: String,
    pub index_name: String,
    pub schema_hash_key: String,
    pub fields: Vec<IndexField>,
    /// The declared schema, kept for the value codec.
    pub source: RecordSchema,
    by_name: HashMap<String, usize>,
    /// Dotted projection paths (`address.city`) to query names.
    paths: HashMap<String, String>,
}

impl CompiledSchema {
    pub fn compile(schema: &RecordSchema) -> Result<Arc<Self>> {
        if schema.meta.embedded {
            return Err(OmError::Schema(format!(
                "embedded record '{}' cannot carry its own index; embed it in a document record",
                schema.name
            )));
        }

        let pk_count = schema
            .fields
            .iter()
            .filter(|f| f.options.primary_key)
            .count();
        match pk_count {
            0 => {
                return Err(OmError::Schema(format!(
                    "record '{}' declares no primary key field",
                    schema.name
                )))
            }
            1 => {}
            _ => {
                return Err(OmError::Schema(format!(
                    "record '{}' declares more than one primary key field",
                    schema.name
                )))
            }
        }

        let mut fields = Vec::new();
        let mut paths = HashMap::new();
        unfold(
            &mut fields,
            &mut paths,
            schema,
            schema.layout,
            "$",
            "",
            "",
            schema.index,
            true,
        )?;

        let mut by_name = HashMap::new();
        for (i, field) in fields.iter().enumerate() {
            if by_name.insert(field.query_name.clone(), i).is_some() {
                return Err(OmError::Schema(format!(
                    "record '{}' produces duplicate index field name '{}'",
                    schema.name, field.query_name
                )));
            }
        }

        let keys = KeyCodec::new(&schema.meta);
        Ok(Arc::new(Self {
            record: schema.name.clone(),
            layout: schema.layout,
            key_prefix: keys.key_prefix(),
            all_keys_pattern: keys.all_keys_pattern(),
            index_name: keys.index_name().to_string(),
            schema_hash_key: keys.schema_hash_key(),
            fields,
            source: schema.clone(),
            by_name,
            paths,
        }))
    }

    /// Look up an index field by its query-time name.
    pub fn index_field(&self, query_name: &str) -> Option<&IndexField> {
        self.by_name.get(query_name).map(|&i| &self.fields[i])
    }

    /// Resolve a field reference as written in queries and projections:
    /// either a query name (`address_city`) or a dotted path
    /// (`address.city`).
    pub fn resolve(&self, reference: &str) -> Option<&IndexField> {
        if let Some(field) = self.index_field(reference) {
            return Some(field);
        }
        self.paths
            .get(reference)
            .and_then(|name| self.index_field(name))
    }

    /// True when the dotted path names a declared field (indexed or not) —
    /// used to validate projections before any server round trip.
    pub fn declares_path(&self, dotted: &str) -> bool {
        declared_type_at(&self.source, dotted).is_some()
    }

    /// The declared type at a dotted path, unwrapping optionals.
    pub fn declared_type(&self, dotted: &str) -> Option<FieldType> {
        declared_type_at(&self.source, dotted)
    }

    pub fn is_sortable(&self, query_name: &str) -> bool {
        self.resolve(query_name).map(|f| f.sortable).unwrap_or(false)
    }

    /// Leaf names of datetime/date fields anywhere in the declared shape.
    pub fn datetime_leaf_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_datetime_leaves(&self.source, &mut names);
        names.sort();
        names.dedup();
        names
    }

    pub fn has_datetime_fields(&self) -> bool {
        !self.datetime_leaf_names().is_empty()
    }

    /// Index fields backed by declared datetime values; these are expected
    /// to be NUMERIC on the server.
    pub fn datetime_index_fields(&self) -> impl Iterator<Item = &IndexField> {
        self.fields.iter().filter(|f| f.datetime)
    }
}

/// Resolve a field's effective index state against the record default.
fn is_indexed(options: &IndexOptions, record_default: bool) -> bool {
    options.primary_key
        || match options.index {
            IndexState::Inherit => record_default,
            IndexState::Included => true,
            IndexState::Excluded => false,
        }
}

#[allow(clippy::too_many_arguments)]
fn unfold(
    out: &mut Vec<IndexField>,
    paths: &mut HashMap<String, String>,
    schema: &RecordSchema,
    layout: StorageLayout,
    json_path: &str,
    name_prefix: &str,
    dotted_prefix: &str,
    record_default_index: bool,
    top_level: bool,
) -> Result<()> {
    for field in &schema.fields {
        // Embedded sub-records never contribute their own primary key.
        if field.options.primary_key && !top_level {
            continue;
        }
        unfold_field(
            out,
            paths,
            field,
            layout,
            json_path,
            name_prefix,
            dotted_prefix,
            record_default_index,
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn unfold_field(
    out: &mut Vec<IndexField>,
    paths: &mut HashMap<String, String>,
    field: &FieldDef,
    layout: StorageLayout,
    json_path: &str,
    name_prefix: &str,
    dotted_prefix: &str,
    record_default_index: bool,
) -> Result<()> {
    let options = &field.options;
    let indexed = is_indexed(options, record_default_index);
    let ty = field.ty.unwrapped();

    if options.sortable && !indexed {
        return Err(OmError::Schema(format!(
            "field '{}' is sortable but not indexed",
            field.name
        )));
    }
    if options.full_text_search && options.case_sensitive {
        return Err(OmError::Schema(format!(
            "field '{}' cannot be both full-text searchable and case-sensitive",
            field.name
        )));
    }

    if layout == StorageLayout::Hash {
        match ty {
            FieldType::List(_) => {
                return Err(OmError::Schema(format!(
                    "flat record field '{}' cannot hold a container; use a document record",
                    field.name
                )))
            }
            FieldType::Embedded(_) => {
                return Err(OmError::Schema(format!(
                    "flat record field '{}' cannot hold a nested record; use a document record",
                    field.name
                )))
            }
            _ => {}
        }
    }

    if options.vector.is_some() && *ty != FieldType::Vector {
        return Err(OmError::Schema(format!(
            "field '{}' carries vector options but is not a vector",
            field.name
        )));
    }

    let query_name = if name_prefix.is_empty() {
        field.name.clone()
    } else {
        format!("{name_prefix}_{}", field.name)
    };
    let dotted = if dotted_prefix.is_empty() {
        field.name.clone()
    } else {
        format!("{dotted_prefix}.{}", field.name)
    };

    match ty {
        FieldType::Embedded(sub) => {
            // Descend; the child record's own index default governs its
            // fields' inherited state.
            let path = format!("{json_path}.{}", field.name);
            unfold(
                out,
                paths,
                sub,
                layout,
                &path,
                &query_name,
                &dotted,
                sub.index,
                false,
            )?;
            return Ok(());
        }
        FieldType::List(element) => {
            match element.unwrapped() {
                FieldType::Str => {
                    if options.full_text_search {
                        return Err(OmError::Schema(format!(
                            "list field '{}' cannot be indexed for full-text search",
                            field.name
                        )));
                    }
                    if !indexed {
                        return Ok(());
                    }
                    let path = format!("{json_path}.{}[*]", field.name);
                    push_field(
                        out,
                        paths,
                        IndexField {
                            query_name,
                            path,
                            kind: FieldKind::Tag,
                            sortable: options.sortable,
                            case_sensitive: options.case_sensitive,
                            separator: Some(options.separator),
                            vector: None,
                            multi_value: true,
                            datetime: false,
                        },
                        &dotted,
                        layout,
                    );
                    return Ok(());
                }
                FieldType::Embedded(sub) => {
                    // Values stored as a JavaScript array: attribute names
                    // follow the container notation directly, e.g.
                    // $.orders[*].created_at.
                    let path = format!("{json_path}.{}[*]", field.name);
                    unfold(
                        out,
                        paths,
                        sub,
                        layout,
                        &path,
                        &query_name,
                        &dotted,
                        sub.index,
                        false,
                    )?;
                    return Ok(());
                }
                _ => {
                    return Err(OmError::Schema(format!(
                        "list field '{}' can only contain strings",
                        field.name
                    )))
                }
            }
        }
        _ => {}
    }

    if !indexed {
        return Ok(());
    }

    let path = match layout {
        StorageLayout::Hash => field.name.clone(),
        StorageLayout::Json => format!("{json_path}.{}", field.name),
    };

    let (kind, separator, vector) = match ty {
        FieldType::Str => {
            if options.full_text_search {
                (FieldKind::Text, None, None)
            } else {
                (FieldKind::Tag, Some(options.separator), None)
            }
        }
        FieldType::Int | FieldType::Float => (FieldKind::Numeric, None, None),
        FieldType::DateTime | FieldType::Date => (FieldKind::Numeric, None, None),
        FieldType::Bool => match layout {
            StorageLayout::Hash => (FieldKind::Tag, Some(options.separator), None),
            StorageLayout::Json => (FieldKind::Numeric, None, None),
        },
        FieldType::Geo => (FieldKind::Geo, None, None),
        FieldType::Vector => {
            let vector = options.vector.clone().ok_or_else(|| {
                OmError::Schema(format!(
                    "vector field '{}' requires vector options",
                    field.name
                ))
            })?;
            if vector.dim < 1 {
                return Err(OmError::Schema(format!(
                    "vector field '{}' must declare a dimension of at least 1",
                    field.name
                )));
            }
            (FieldKind::Vector, None, Some(vector))
        }
        FieldType::List(_) | FieldType::Embedded(_) | FieldType::Optional(_) => unreachable!(),
    };

    if options.full_text_search && kind != FieldKind::Text {
        return Err(OmError::Schema(format!(
            "field '{}' is full-text searchable but not a string",
            field.name
        )));
    }
    if options.case_sensitive && kind != FieldKind::Tag {
        return Err(OmError::Schema(format!(
            "field '{}' is case-sensitive but not a tag field",
            field.name
        )));
    }

    push_field(
        out,
        paths,
        IndexField {
            query_name,
            path,
            kind,
            sortable: options.sortable,
            case_sensitive: options.case_sensitive,
            separator,
            vector,
            multi_value: false,
            datetime: matches!(ty, FieldType::DateTime | FieldType::Date),
        },
        &dotted,
        layout,
    );
    Ok(())
}

fn push_field(
    out: &mut Vec<IndexField>,
    paths: &mut HashMap<String, String>,
    field: IndexField,
    dotted: &str,
    layout: StorageLayout,
) {
    if layout == StorageLayout::Json || !dotted.contains('.') {
        paths.insert(dotted.to_string(), field.query_name.clone());
    }
    out.push(field);
}

/// Declared type at a dotted path, descending through embedded records.
fn declared_type_at(schema: &RecordSchema, dotted: &str) -> Option<FieldType> {
    let mut current = schema;
    let mut segments = dotted.split('.').peekable();
    while let Some(segment) = segments.next() {
        let field = current.field(segment)?;
        let ty = field.ty.unwrapped();
        if segments.peek().is_none() {
            return Some(ty.clone());
        }
        match ty {
            FieldType::Embedded(sub) => current = sub,
            FieldType::List(element) => match element.unwrapped() {
                FieldType::Embedded(sub) => current = sub,
                _ => return None,
            },
            _ => return None,
        }
    }
    None
}

fn collect_datetime_leaves(schema: &RecordSchema, out: &mut Vec<String>) {
    for field in &schema.fields {
        match field.ty.unwrapped() {
            FieldType::DateTime | FieldType::Date => out.push(field.name.clone()),
            FieldType::Embedded(sub) => collect_datetime_leaves(sub, out),
            FieldType::List(element) => {
                if let FieldType::Embedded(sub) = element.unwrapped() {
                    collect_datetime_leaves(sub, out);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DistanceMetric, FieldDef, RecordSchema, VectorType};

    fn customer() -> RecordSchema {
        RecordSchema::hash("customer")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::str("first_name"))
            .field(FieldDef::str("last_name").indexed())
            .field(FieldDef::int("age").indexed().sortable())
            .field(FieldDef::datetime("joined_at").indexed())
            .build()
    }

    fn address() -> RecordSchema {
        RecordSchema::json("address")
            .embedded()
            .field(FieldDef::str("city").indexed())
            .field(FieldDef::str("state").indexed())
            .field(FieldDef::str("note").unindexed())
            .build()
    }

    #[test]
    fn flat_record_compiles_in_declaration_order() {
        let compiled = CompiledSchema::compile(&customer()).unwrap();
        let names: Vec<_> = compiled
            .fields
            .iter()
            .map(|f| f.query_name.as_str())
            .collect();
        // first_name inherits the record default (indexed), so it appears too
        assert_eq!(names, ["pk", "first_name", "last_name", "age", "joined_at"]);
        assert_eq!(compiled.index_field("age").unwrap().kind, FieldKind::Numeric);
        assert!(compiled.index_field("age").unwrap().sortable);
        assert!(compiled.index_field("joined_at").unwrap().datetime);
        // Hash layout: path is the bare field name
        assert_eq!(compiled.index_field("last_name").unwrap().path, "last_name");
    }

    #[test]
    fn record_level_default_off_requires_opt_in() {
        let schema = RecordSchema::hash("sparse")
            .indexed(false)
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::str("ignored"))
            .field(FieldDef::str("wanted").indexed())
            .build();
        let compiled = CompiledSchema::compile(&schema).unwrap();
        assert!(compiled.index_field("ignored").is_none());
        assert!(compiled.index_field("wanted").is_some());
        // pk is always indexed
        assert!(compiled.index_field("pk").is_some());
    }

    #[test]
    fn embedded_fields_unfold_with_dotted_paths() {
        let schema = RecordSchema::json("customer")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::embedded("address", address()))
            .build();
        let compiled = CompiledSchema::compile(&schema).unwrap();

        let city = compiled.index_field("address_city").unwrap();
        assert_eq!(city.path, "$.address.city");
        assert_eq!(city.kind, FieldKind::Tag);
        // The unindexed child is not unfolded
        assert!(compiled.index_field("address_note").is_none());
        // Dotted references resolve to the flattened name
        assert_eq!(
            compiled.resolve("address.city").unwrap().query_name,
            "address_city"
        );
    }

    #[test]
    fn deep_nesting_composes_paths_left_to_right() {
        let inner = RecordSchema::json("geo")
            .embedded()
            .field(FieldDef::str("lat_band").indexed())
            .build();
        let mid = RecordSchema::json("address")
            .embedded()
            .field(FieldDef::embedded("geo", inner))
            .build();
        let schema = RecordSchema::json("customer")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::embedded("address", mid))
            .build();
        let compiled = CompiledSchema::compile(&schema).unwrap();
        let field = compiled.index_field("address_geo_lat_band").unwrap();
        assert_eq!(field.path, "$.address.geo.lat_band");
        assert_eq!(
            compiled.resolve("address.geo.lat_band").unwrap().query_name,
            "address_geo_lat_band"
        );
    }

    #[test]
    fn list_of_strings_is_multi_value_tag() {
        let schema = RecordSchema::json("deck")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::list_of_str("cards").indexed())
            .build();
        let compiled = CompiledSchema::compile(&schema).unwrap();
        let cards = compiled.index_field("cards").unwrap();
        assert_eq!(cards.path, "$.cards[*]");
        assert_eq!(cards.kind, FieldKind::Tag);
        assert!(cards.multi_value);
    }

    #[test]
    fn list_of_embedded_unfolds_through_the_array() {
        let order = RecordSchema::json("order")
            .embedded()
            .field(FieldDef::datetime("created_at").indexed())
            .build();
        let schema = RecordSchema::json("customer")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::list("orders", FieldType::Embedded(Arc::new(order))))
            .build();
        let compiled = CompiledSchema::compile(&schema).unwrap();
        let field = compiled.index_field("orders_created_at").unwrap();
        assert_eq!(field.path, "$.orders[*].created_at");
        assert!(field.datetime);
    }

    #[test]
    fn non_string_list_is_rejected() {
        let schema = RecordSchema::json("bad")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::list("counts", FieldType::Int).indexed())
            .build();
        let err = CompiledSchema::compile(&schema).unwrap_err();
        assert!(err.to_string().contains("can only contain strings"));
    }

    #[test]
    fn full_text_list_is_rejected() {
        let schema = RecordSchema::json("bad")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::list_of_str("tags").indexed().full_text_search())
            .build();
        let err = CompiledSchema::compile(&schema).unwrap_err();
        assert!(err.to_string().contains("full-text"));
    }

    #[test]
    fn flat_record_rejects_containers_and_nesting() {
        let schema = RecordSchema::hash("bad")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::list_of_str("tags").indexed())
            .build();
        assert!(CompiledSchema::compile(&schema).is_err());

        let schema = RecordSchema::hash("bad")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::embedded("address", address()))
            .build();
        assert!(CompiledSchema::compile(&schema).is_err());
    }

    #[test]
    fn sortable_requires_indexed() {
        let schema = RecordSchema::hash("bad")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::int("age").unindexed().sortable())
            .build();
        let err = CompiledSchema::compile(&schema).unwrap_err();
        assert!(err.to_string().contains("sortable but not indexed"));
    }

    #[test]
    fn full_text_and_case_sensitive_conflict() {
        let schema = RecordSchema::hash("bad")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::str("name").indexed().full_text_search().case_sensitive())
            .build();
        assert!(CompiledSchema::compile(&schema).is_err());
    }

    #[test]
    fn primary_key_is_mandatory_and_unique() {
        let schema = RecordSchema::hash("bad").field(FieldDef::str("name")).build();
        assert!(CompiledSchema::compile(&schema).is_err());

        let schema = RecordSchema::hash("bad")
            .field(FieldDef::str("a").primary_key())
            .field(FieldDef::str("b").primary_key())
            .build();
        assert!(CompiledSchema::compile(&schema).is_err());
    }

    #[test]
    fn embedded_record_cannot_register() {
        let err = CompiledSchema::compile(&address()).unwrap_err();
        assert!(err.to_string().contains("embedded"));
    }

    #[test]
    fn document_bool_is_numeric_flat_bool_is_tag() {
        let json = RecordSchema::json("j")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::boolean("active").indexed())
            .build();
        let hash = RecordSchema::hash("h")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::boolean("active").indexed())
            .build();
        assert_eq!(
            CompiledSchema::compile(&json).unwrap().index_field("active").unwrap().kind,
            FieldKind::Numeric
        );
        assert_eq!(
            CompiledSchema::compile(&hash).unwrap().index_field("active").unwrap().kind,
            FieldKind::Tag
        );
    }

    #[test]
    fn vector_field_requires_options() {
        let mut field = FieldDef::vector(
            "embedding",
            VectorOptions::flat(4, VectorType::Float32, DistanceMetric::Cosine),
        );
        field.options.vector = None;
        let schema = RecordSchema::json("bad")
            .field(FieldDef::str("pk").primary_key())
            .field(field.indexed())
            .build();
        assert!(CompiledSchema::compile(&schema).is_err());
    }

    #[test]
    fn datetime_leaves_cover_nested_records() {
        let schema = RecordSchema::json("customer")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::datetime("joined_at").indexed())
            .field(FieldDef::embedded(
                "order",
                RecordSchema::json("order")
                    .embedded()
                    .field(FieldDef::datetime("placed_at").indexed())
                    .build(),
            ))
            .build();
        let compiled = CompiledSchema::compile(&schema).unwrap();
        assert_eq!(compiled.datetime_leaf_names(), ["joined_at", "placed_at"]);
        assert!(compiled.has_datetime_fields());
        let datetime_fields: Vec<_> = compiled
            .datetime_index_fields()
            .map(|f| f.query_name.as_str())
            .collect();
        assert_eq!(datetime_fields, ["joined_at", "order_placed_at"]);
    }
}
