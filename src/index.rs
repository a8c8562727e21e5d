// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index lifecycle: FT.CREATE synthesis, fingerprints, create/drop.
//!
//! A compiled schema deterministically renders into the index-create
//! command:
//!
//! ```text
//! FT.CREATE app:customer:index
//!   ON HASH PREFIX 1 app:customer: SCORE 1.0
//!   SCHEMA
//!     last_name AS last_name TAG SEPARATOR |
//!     age AS age NUMERIC SORTABLE
//! ```
//!
//! The fingerprint is a SHA-256 over a canonical rendering of the sorted
//! index fields plus the storage layout and key prefix. It is persisted at
//! the schema-hash key so later runs can detect drift without reparsing
//! FT.INFO. Creation is idempotent: a matching stored fingerprint skips the
//! rebuild entirely, which also makes a crash between FT.CREATE and the
//! fingerprint write safe to rerun.

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{OmError, Result};
use crate::schema::compiler::{CompiledSchema, FieldKind, IndexField};
use crate::schema::StorageLayout;
use crate::storage::RedisClient;

/// Render one index field into its SCHEMA arguments.
pub fn field_schema_args(field: &IndexField) -> Vec<String> {
    let mut args = vec![field.path.clone(), "AS".to_string(), field.query_name.clone()];
    match field.kind {
        FieldKind::Tag => {
            args.push("TAG".to_string());
            args.push("SEPARATOR".to_string());
            args.push(
                field
                    .separator
                    .unwrap_or(crate::schema::DEFAULT_SEPARATOR)
                    .to_string(),
            );
            if field.case_sensitive {
                args.push("CASESENSITIVE".to_string());
            }
        }
        FieldKind::Text => {
            args.push("TEXT".to_string());
        }
        FieldKind::Numeric => {
            args.push("NUMERIC".to_string());
        }
        FieldKind::Geo => {
            args.push("GEO".to_string());
        }
        FieldKind::Vector => {
            args.push("VECTOR".to_string());
            let options = field.vector.as_ref().expect("vector field carries options");
            args.push(options.algorithm.to_string());
            args.extend(options.to_schema_args());
        }
    }
    if field.sortable {
        args.push("SORTABLE".to_string());
    }
    args
}

/// Full FT.CREATE argument vector (everything after the command name) for
/// an index definition.
pub fn ft_create_args(
    index_name: &str,
    layout: StorageLayout,
    key_prefix: &str,
    fields: &[IndexField],
) -> Vec<String> {
    let mut args = vec![
        index_name.to_string(),
        "ON".to_string(),
        layout.to_string(),
        "PREFIX".to_string(),
        "1".to_string(),
        key_prefix.to_string(),
        "SCORE".to_string(),
        "1.0".to_string(),
        "SCHEMA".to_string(),
    ];
    for field in fields {
        args.extend(field_schema_args(field));
    }
    args
}

/// Deterministic fingerprint of an index definition: SHA-256 over the
/// canonicalized, sorted field renderings plus layout and key prefix.
pub fn fingerprint(layout: StorageLayout, key_prefix: &str, fields: &[IndexField]) -> String {
    let mut lines: Vec<String> = fields.iter().map(canonical_line).collect();
    lines.sort();
    let mut hasher = Sha256::new();
    hasher.update(layout.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(key_prefix.as_bytes());
    hasher.update(b"\n");
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex_digest(hasher)
}

fn canonical_line(field: &IndexField) -> String {
    let mut line = format!("{}|{}", field.query_name, field.kind);
    if let Some(sep) = field.separator {
        line.push_str(&format!("|sep={sep}"));
    }
    if field.case_sensitive {
        line.push_str("|casesensitive");
    }
    if field.sortable {
        line.push_str("|sortable");
    }
    if let Some(vector) = &field.vector {
        line.push_str(&format!(
            "|vector={},{},{},{}",
            vector.algorithm, vector.dtype, vector.dim, vector.metric
        ));
        for (name, knob) in [
            ("initial_cap", vector.initial_cap),
            ("block_size", vector.block_size),
            ("m", vector.m),
            ("ef_construction", vector.ef_construction),
            ("ef_runtime", vector.ef_runtime),
        ] {
            if let Some(value) = knob {
                line.push_str(&format!(",{name}={value}"));
            }
        }
        if let Some(epsilon) = vector.epsilon {
            line.push_str(&format!(",epsilon={epsilon}"));
        }
    }
    line
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Index lifecycle operations for one compiled schema.
pub struct IndexManager<'a> {
    client: &'a RedisClient,
    schema: &'a CompiledSchema,
}

impl<'a> IndexManager<'a> {
    pub fn new(client: &'a RedisClient, schema: &'a CompiledSchema) -> Self {
        Self { client, schema }
    }

    pub fn ft_create_args(&self) -> Vec<String> {
        ft_create_args(
            &self.schema.index_name,
            self.schema.layout,
            &self.schema.key_prefix,
            &self.schema.fields,
        )
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(
            self.schema.layout,
            &self.schema.key_prefix,
            &self.schema.fields,
        )
    }

    /// Fingerprint currently recorded on the server, if any.
    pub async fn stored_fingerprint(&self) -> Result<Option<String>> {
        self.client.get_string(&self.schema.schema_hash_key).await
    }

    /// Create (or re-create) the index unless the stored fingerprint
    /// already matches the in-memory definition.
    pub async fn create_index(&self) -> Result<IndexOutcome> {
        self.guard_database()?;
        self.guard_capabilities().await?;
        let current = self.fingerprint();
        if self.stored_fingerprint().await?.as_deref() == Some(current.as_str()) {
            debug!(index = %self.schema.index_name, "index fingerprint matches, skipping");
            return Ok(IndexOutcome::UpToDate);
        }

        let dropped = self.client.ft_dropindex(&self.schema.index_name).await?;
        self.client.ft_create(&self.ft_create_args()).await?;
        self.client
            .set_string(&self.schema.schema_hash_key, &current)
            .await?;
        info!(
            index = %self.schema.index_name,
            record = %self.schema.record,
            recreated = dropped,
            "index created"
        );
        Ok(if dropped {
            IndexOutcome::Recreated
        } else {
            IndexOutcome::Created
        })
    }

    /// Drop the index and forget the stored fingerprint. Missing indexes
    /// are not an error.
    pub async fn drop_index(&self) -> Result<bool> {
        self.guard_database()?;
        let dropped = self.client.ft_dropindex(&self.schema.index_name).await?;
        self.client
            .del(&[self.schema.schema_hash_key.clone()])
            .await?;
        Ok(dropped)
    }

    fn guard_database(&self) -> Result<()> {
        match self.client.db_number() {
            0 => Ok(()),
            n => Err(OmError::DatabaseNumber(n)),
        }
    }

    /// Probe the server for the modules this index needs before issuing
    /// FT.* commands, so a plain Redis fails with a clear hint instead of
    /// an unknown-command error.
    async fn guard_capabilities(&self) -> Result<()> {
        if !self.client.has_search().await? {
            return Err(OmError::Capability(
                "the search module (FT.*) is not loaded".to_string(),
            ));
        }
        if self.schema.layout == StorageLayout::Json && !self.client.has_json().await? {
            return Err(OmError::Capability(
                "the JSON module (JSON.*) is not loaded".to_string(),
            ));
        }
        Ok(())
    }
}

/// What `create_index` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Stored fingerprint matched; nothing was sent to the server.
    UpToDate,
    /// No index existed; one was created.
    Created,
    /// A stale index was dropped and rebuilt.
    Recreated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::compiler::CompiledSchema;
    use crate::schema::{DistanceMetric, FieldDef, RecordSchema, VectorOptions, VectorType};

    fn compiled() -> std::sync::Arc<CompiledSchema> {
        let schema = RecordSchema::hash("customer")
            .global_key_prefix("app")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::str("last_name").indexed())
            .field(FieldDef::int("age").indexed().sortable())
            .build();
        CompiledSchema::compile(&schema).unwrap()
    }

    #[test]
    fn create_args_have_preamble_and_fields() {
        let schema = compiled();
        let args = ft_create_args(
            &schema.index_name,
            schema.layout,
            &schema.key_prefix,
            &schema.fields,
        );
        let joined = args.join(" ");
        assert!(joined.starts_with(
            "app:customer:index ON HASH PREFIX 1 app:customer: SCORE 1.0 SCHEMA"
        ));
        assert!(joined.contains("last_name AS last_name TAG SEPARATOR |"));
        assert!(joined.contains("age AS age NUMERIC SORTABLE"));
    }

    #[test]
    fn json_fields_render_paths_and_aliases() {
        let address = RecordSchema::json("address")
            .embedded()
            .field(FieldDef::str("city").indexed())
            .build();
        let schema = RecordSchema::json("customer")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::embedded("address", address))
            .build();
        let compiled = CompiledSchema::compile(&schema).unwrap();
        let joined = ft_create_args(
            &compiled.index_name,
            compiled.layout,
            &compiled.key_prefix,
            &compiled.fields,
        )
        .join(" ");
        assert!(joined.contains("ON JSON"));
        assert!(joined.contains("$.address.city AS address_city TAG"));
    }

    #[test]
    fn vector_field_renders_param_block() {
        let schema = RecordSchema::json("doc")
            .field(FieldDef::str("pk").primary_key())
            .field(FieldDef::vector(
                "embedding",
                VectorOptions::hnsw(768, VectorType::Float32, DistanceMetric::Cosine).with_m(16),
            ))
            .build();
        let compiled = CompiledSchema::compile(&schema).unwrap();
        let joined = ft_create_args(
            &compiled.index_name,
            compiled.layout,
            &compiled.key_prefix,
            &compiled.fields,
        )
        .join(" ");
        assert!(joined.contains(
            "$.embedding AS embedding VECTOR HNSW 8 TYPE FLOAT32 DIM 768 DISTANCE_METRIC COSINE M 16"
        ));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = compiled();
        let b = compiled();
        assert_eq!(
            fingerprint(a.layout, &a.key_prefix, &a.fields),
            fingerprint(b.layout, &b.key_prefix, &b.fields),
        );
    }

    #[test]
    fn fingerprint_ignores_field_order_but_not_options() {
        let schema = compiled();
        let mut reversed = schema.fields.clone();
        reversed.reverse();
        assert_eq!(
            fingerprint(schema.layout, &schema.key_prefix, &schema.fields),
            fingerprint(schema.layout, &schema.key_prefix, &reversed),
        );

        let mut changed = schema.fields.clone();
        changed[2].sortable = false;
        assert_ne!(
            fingerprint(schema.layout, &schema.key_prefix, &schema.fields),
            fingerprint(schema.layout, &schema.key_prefix, &changed),
        );
    }

    #[test]
    fn fingerprint_depends_on_layout_and_prefix() {
        let schema = compiled();
        assert_ne!(
            fingerprint(StorageLayout::Hash, &schema.key_prefix, &schema.fields),
            fingerprint(StorageLayout::Json, &schema.key_prefix, &schema.fields),
        );
        assert_ne!(
            fingerprint(schema.layout, "app:customer:", &schema.fields),
            fingerprint(schema.layout, "other:customer:", &schema.fields),
        );
    }
}
