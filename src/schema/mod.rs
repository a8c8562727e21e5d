// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record schema declaration.
//!
//! A record type describes its shape once, up front, with a builder:
//!
//! ```rust
//! use redis_om::schema::{FieldDef, RecordSchema};
//!
//! let schema = RecordSchema::hash("customer")
//!     .field(FieldDef::str("pk").primary_key())
//!     .field(FieldDef::str("first_name"))
//!     .field(FieldDef::str("last_name").indexed())
//!     .field(FieldDef::int("age").indexed().sortable())
//!     .build();
//!
//! assert_eq!(schema.fields.len(), 4);
//! ```
//!
//! The declared schema is compiled into an index definition by
//! [`compiler::CompiledSchema`]; compilation is where invalid field
//! configurations are rejected, eagerly, at registration time.

pub mod compiler;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::keys::PrimaryKeyCreator;

/// How record values are stored on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageLayout {
    /// One Redis Hash per record; field values are flat strings.
    Hash,
    /// One RedisJSON document per record; nesting is allowed.
    Json,
}

impl std::fmt::Display for StorageLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageLayout::Hash => write!(f, "HASH"),
            StorageLayout::Json => write!(f, "JSON"),
        }
    }
}

/// Declared type of a record field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    DateTime,
    Date,
    /// Geographic point, stored as a "lon,lat" string.
    Geo,
    /// Fixed-shape numeric vector; requires [`VectorOptions`] on the field.
    Vector,
    /// Homogeneous list. Only string elements are indexable.
    List(Box<FieldType>),
    /// A nested record (document layout only). Its indexable fields are
    /// unfolded into the parent's index.
    Embedded(Arc<RecordSchema>),
    /// Nullable wrapper. `None` values are elided from Hash storage and
    /// stored as JSON `null` in documents.
    Optional(Box<FieldType>),
}

impl FieldType {
    /// Strip `Optional` wrappers.
    pub fn unwrapped(&self) -> &FieldType {
        match self {
            FieldType::Optional(inner) => inner.unwrapped(),
            other => other,
        }
    }
}

/// Tri-state index flag: fields inherit the record-level default unless they
/// opt in or out explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexState {
    #[default]
    Inherit,
    Included,
    Excluded,
}

/// Default separator for tag values.
pub const DEFAULT_SEPARATOR: char = '|';

/// Per-field indexing options.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOptions {
    pub index: IndexState,
    pub sortable: bool,
    pub full_text_search: bool,
    pub case_sensitive: bool,
    /// Separator splitting multi-value tag strings.
    pub separator: char,
    pub vector: Option<VectorOptions>,
    pub primary_key: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            index: IndexState::Inherit,
            sortable: false,
            full_text_search: false,
            case_sensitive: false,
            separator: DEFAULT_SEPARATOR,
            vector: None,
            primary_key: false,
        }
    }
}

/// Vector index algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorAlgorithm {
    /// Brute-force index: exact results, O(n) query time.
    Flat,
    /// Hierarchical Navigable Small World: approximate, fast on large sets.
    Hnsw,
}

impl std::fmt::Display for VectorAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorAlgorithm::Flat => write!(f, "FLAT"),
            VectorAlgorithm::Hnsw => write!(f, "HNSW"),
        }
    }
}

/// Element type of a stored vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorType {
    Float32,
    Float64,
}

impl VectorType {
    /// Bytes per element when packed for storage and KNN parameters.
    pub fn width(&self) -> usize {
        match self {
            VectorType::Float32 => 4,
            VectorType::Float64 => 8,
        }
    }
}

impl std::fmt::Display for VectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorType::Float32 => write!(f, "FLOAT32"),
            VectorType::Float64 => write!(f, "FLOAT64"),
        }
    }
}

/// Distance metric for vector similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    Cosine,
    L2,
    InnerProduct,
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "COSINE"),
            DistanceMetric::L2 => write!(f, "L2"),
            DistanceMetric::InnerProduct => write!(f, "IP"),
        }
    }
}

/// Parameters for a VECTOR index field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorOptions {
    pub algorithm: VectorAlgorithm,
    pub dtype: VectorType,
    pub dim: usize,
    pub metric: DistanceMetric,
    /// FLAT: initial index capacity.
    pub initial_cap: Option<usize>,
    /// FLAT: block growth size.
    pub block_size: Option<usize>,
    /// HNSW: outgoing edges per node.
    pub m: Option<usize>,
    /// HNSW: build-time search depth.
    pub ef_construction: Option<usize>,
    /// HNSW: query-time search depth.
    pub ef_runtime: Option<usize>,
    /// HNSW: range query accuracy factor.
    pub epsilon: Option<f64>,
}

impl VectorOptions {
    pub fn flat(dim: usize, dtype: VectorType, metric: DistanceMetric) -> Self {
        Self {
            algorithm: VectorAlgorithm::Flat,
            dtype,
            dim,
            metric,
            initial_cap: None,
            block_size: None,
            m: None,
            ef_construction: None,
            ef_runtime: None,
            epsilon: None,
        }
    }

    pub fn hnsw(dim: usize, dtype: VectorType, metric: DistanceMetric) -> Self {
        Self {
            algorithm: VectorAlgorithm::Hnsw,
            ..Self::flat(dim, dtype, metric)
        }
    }

    pub fn with_initial_cap(mut self, cap: usize) -> Self {
        self.initial_cap = Some(cap);
        self
    }

    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = Some(size);
        self
    }

    /// Higher = better recall, more memory. Typical: 12-48.
    pub fn with_m(mut self, m: usize) -> Self {
        self.m = Some(m);
        self
    }

    /// Higher = better index quality, slower build. Typical: 100-500.
    pub fn with_ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = Some(ef);
        self
    }

    pub fn with_ef_runtime(mut self, ef: usize) -> Self {
        self.ef_runtime = Some(ef);
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Schema arguments for this vector field, with the parameter count
    /// prepended (the server requires nargs before the parameter list).
    pub fn to_schema_args(&self) -> Vec<String> {
        let mut args = vec![
            "TYPE".to_string(),
            self.dtype.to_string(),
            "DIM".to_string(),
            self.dim.to_string(),
            "DISTANCE_METRIC".to_string(),
            self.metric.to_string(),
        ];
        match self.algorithm {
            VectorAlgorithm::Flat => {
                if let Some(cap) = self.initial_cap {
                    args.push("INITIAL_CAP".to_string());
                    args.push(cap.to_string());
                }
                if let Some(size) = self.block_size {
                    args.push("BLOCK_SIZE".to_string());
                    args.push(size.to_string());
                }
            }
            VectorAlgorithm::Hnsw => {
                if let Some(m) = self.m {
                    args.push("M".to_string());
                    args.push(m.to_string());
                }
                if let Some(ef) = self.ef_construction {
                    args.push("EF_CONSTRUCTION".to_string());
                    args.push(ef.to_string());
                }
                if let Some(ef) = self.ef_runtime {
                    args.push("EF_RUNTIME".to_string());
                    args.push(ef.to_string());
                }
                if let Some(eps) = self.epsilon {
                    args.push("EPSILON".to_string());
                    args.push(eps.to_string());
                }
            }
        }
        let mut out = vec![args.len().to_string()];
        out.extend(args);
        out
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    pub options: IndexOptions,
}

impl FieldDef {
    fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            options: IndexOptions::default(),
        }
    }

    pub fn str(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Str)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bool)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Date)
    }

    pub fn geo(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Geo)
    }

    pub fn vector(name: impl Into<String>, options: VectorOptions) -> Self {
        let mut field = Self::new(name, FieldType::Vector);
        field.options.vector = Some(options);
        field
    }

    pub fn list_of_str(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::List(Box::new(FieldType::Str)))
    }

    pub fn list(name: impl Into<String>, element: FieldType) -> Self {
        Self::new(name, FieldType::List(Box::new(element)))
    }

    pub fn embedded(name: impl Into<String>, schema: RecordSchema) -> Self {
        Self::new(name, FieldType::Embedded(Arc::new(schema)))
    }

    /// Wrap the declared type as nullable.
    pub fn optional(mut self) -> Self {
        self.ty = FieldType::Optional(Box::new(self.ty));
        self
    }

    pub fn indexed(mut self) -> Self {
        self.options.index = IndexState::Included;
        self
    }

    pub fn unindexed(mut self) -> Self {
        self.options.index = IndexState::Excluded;
        self
    }

    pub fn sortable(mut self) -> Self {
        self.options.sortable = true;
        self
    }

    pub fn full_text_search(mut self) -> Self {
        self.options.full_text_search = true;
        self
    }

    pub fn case_sensitive(mut self) -> Self {
        self.options.case_sensitive = true;
        self
    }

    pub fn separator(mut self, sep: char) -> Self {
        self.options.separator = sep;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.options.primary_key = true;
        self
    }
}

/// Naming, prefix and key-generation policy for one record type.
#[derive(Clone)]
pub struct RecordMeta {
    pub global_key_prefix: String,
    pub model_key_prefix: String,
    pub primary_key_pattern: String,
    pub index_name: Option<String>,
    pub embedded: bool,
    /// Text encoding used when decoding binary-safe hash replies.
    pub encoding: String,
    pub primary_key_creator: Option<Arc<dyn PrimaryKeyCreator>>,
}

impl RecordMeta {
    pub fn new(record_name: &str) -> Self {
        Self {
            global_key_prefix: String::new(),
            model_key_prefix: record_name.to_string(),
            primary_key_pattern: "{pk}".to_string(),
            index_name: None,
            embedded: false,
            encoding: "utf-8".to_string(),
            primary_key_creator: None,
        }
    }
}

impl std::fmt::Debug for RecordMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordMeta")
            .field("global_key_prefix", &self.global_key_prefix)
            .field("model_key_prefix", &self.model_key_prefix)
            .field("primary_key_pattern", &self.primary_key_pattern)
            .field("index_name", &self.index_name)
            .field("embedded", &self.embedded)
            .field("encoding", &self.encoding)
            .field(
                "primary_key_creator",
                &self.primary_key_creator.as_ref().map(|_| "<custom>"),
            )
            .finish()
    }
}

impl PartialEq for RecordMeta {
    fn eq(&self, other: &Self) -> bool {
        self.global_key_prefix == other.global_key_prefix
            && self.model_key_prefix == other.model_key_prefix
            && self.primary_key_pattern == other.primary_key_pattern
            && self.index_name == other.index_name
            && self.embedded == other.embedded
            && self.encoding == other.encoding
    }
}

/// A declared record type: named fields plus meta.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    pub name: String,
    pub layout: StorageLayout,
    /// Record-level index default, inherited by fields whose index state is
    /// [`IndexState::Inherit`].
    pub index: bool,
    pub fields: Vec<FieldDef>,
    pub meta: RecordMeta,
}

impl RecordSchema {
    /// Start declaring a Hash-backed (flat) record.
    pub fn hash(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name, StorageLayout::Hash)
    }

    /// Start declaring a JSON-backed (document) record.
    pub fn json(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name, StorageLayout::Json)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The field marked as primary key, if any.
    pub fn primary_key_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.options.primary_key)
    }
}

/// Fluent builder returned by [`RecordSchema::hash`] / [`RecordSchema::json`].
pub struct SchemaBuilder {
    schema: RecordSchema,
}

impl SchemaBuilder {
    fn new(name: impl Into<String>, layout: StorageLayout) -> Self {
        let name = name.into();
        let meta = RecordMeta::new(&name);
        Self {
            schema: RecordSchema {
                name,
                layout,
                index: true,
                fields: Vec::new(),
                meta,
            },
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.schema.fields.push(field);
        self
    }

    /// Record-level index default. `false` turns off indexing for every
    /// field that does not opt in explicitly.
    pub fn indexed(mut self, index: bool) -> Self {
        self.schema.index = index;
        self
    }

    pub fn global_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.schema.meta.global_key_prefix = prefix.into();
        self
    }

    pub fn model_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.schema.meta.model_key_prefix = prefix.into();
        self
    }

    pub fn primary_key_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.schema.meta.primary_key_pattern = pattern.into();
        self
    }

    pub fn index_name(mut self, name: impl Into<String>) -> Self {
        self.schema.meta.index_name = Some(name.into());
        self
    }

    /// Mark this record as embedded: it is only ever stored inside another
    /// document and never carries its own index.
    pub fn embedded(mut self) -> Self {
        self.schema.meta.embedded = true;
        self
    }

    pub fn primary_key_creator(mut self, creator: Arc<dyn PrimaryKeyCreator>) -> Self {
        self.schema.meta.primary_key_creator = Some(creator);
        self
    }

    pub fn build(self) -> RecordSchema {
        self.schema
    }
}

/// A record type: a serde-mapped Rust type plus its declared schema.
///
/// Validation is serde deserialization: a stored value that deserializes
/// into `Self` is valid; anything else surfaces as a validation error.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn schema() -> RecordSchema;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_fields_in_order() {
        let schema = RecordSchema::hash("customer")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::str("last_name").indexed())
            .field(FieldDef::int("age").indexed().sortable())
            .build();

        let names: Vec<_> = schema.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["pk", "last_name", "age"]);
        assert_eq!(schema.primary_key_field().unwrap().name, "pk");
        assert_eq!(schema.layout, StorageLayout::Hash);
    }

    #[test]
    fn optional_wraps_and_unwraps() {
        let field = FieldDef::datetime("seen_at").optional();
        assert_eq!(*field.ty.unwrapped(), FieldType::DateTime);
    }

    #[test]
    fn vector_args_include_count_prefix() {
        let options = VectorOptions::hnsw(1536, VectorType::Float32, DistanceMetric::Cosine)
            .with_m(32)
            .with_ef_construction(400);
        let args = options.to_schema_args();
        // 6 base args + M pair + EF_CONSTRUCTION pair
        assert_eq!(args[0], "10");
        assert_eq!(
            args[1..7],
            ["TYPE", "FLOAT32", "DIM", "1536", "DISTANCE_METRIC", "COSINE"]
        );
        assert!(args.contains(&"M".to_string()));
        assert!(args.contains(&"EF_CONSTRUCTION".to_string()));
    }

    #[test]
    fn flat_vector_knobs() {
        let options = VectorOptions::flat(4, VectorType::Float64, DistanceMetric::L2)
            .with_initial_cap(1000)
            .with_block_size(100);
        let args = options.to_schema_args();
        assert_eq!(args[0], "10");
        assert!(args.contains(&"INITIAL_CAP".to_string()));
        assert!(args.contains(&"BLOCK_SIZE".to_string()));
        assert!(args.contains(&"FLOAT64".to_string()));
    }

    #[test]
    fn meta_defaults() {
        let schema = RecordSchema::json("order").build();
        assert_eq!(schema.meta.model_key_prefix, "order");
        assert_eq!(schema.meta.primary_key_pattern, "{pk}");
        assert_eq!(schema.meta.encoding, "utf-8");
        assert!(!schema.meta.embedded);
    }
}
