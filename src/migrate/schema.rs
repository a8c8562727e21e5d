// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! File-based schema migrations.
//!
//! Each snapshot file under `schema-migrations/` is a JSON document
//! capturing one record type's index transition: previous and new
//! fingerprints plus the full serialized field lists in both directions,
//! which is what makes rollback possible without the generating code.
//!
//! `run` is idempotent: applied ids are tracked in a server-side set, and
//! re-creating an index whose fingerprint already matches is a no-op at the
//! index layer too. A crash between FT.CREATE and the fingerprint write is
//! repaired by rerunning.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{OmError, Result};
use crate::index;
use crate::migrate::{new_migration_id, schema_applied_key};
use crate::schema::compiler::{CompiledSchema, IndexField};
use crate::schema::StorageLayout;
use crate::storage::RedisClient;

/// One schema migration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMigrationFile {
    pub id: String,
    pub record: String,
    pub index_name: String,
    pub key_prefix: String,
    pub layout: StorageLayout,
    pub schema_hash_key: String,
    /// None for the first migration of a record type.
    pub previous_fingerprint: Option<String>,
    pub new_fingerprint: String,
    pub previous_fields: Option<Vec<IndexField>>,
    pub new_fields: Vec<IndexField>,
    pub created_at: String,
}

/// Where a record type's index stands relative to code and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftState {
    /// Server fingerprint matches the in-memory definition.
    UpToDate,
    /// No index exists on the server yet.
    PendingCreate,
    /// An index exists but its recorded fingerprint differs from the
    /// in-memory definition.
    PendingDrift,
    /// An index exists on the server with no recorded fingerprint; it was
    /// created by something other than this migrator.
    OrphanOnServer,
}

#[derive(Debug, Clone)]
pub struct RecordStatus {
    pub record: String,
    pub index_name: String,
    pub state: DriftState,
    pub current_fingerprint: String,
    pub server_fingerprint: Option<String>,
    pub file_head_fingerprint: Option<String>,
}

/// Drives schema migrations for a set of registered record types.
pub struct SchemaMigrator {
    client: RedisClient,
    schemas: Vec<Arc<CompiledSchema>>,
    dir: PathBuf,
}

impl SchemaMigrator {
    pub fn new(client: RedisClient, schemas: Vec<Arc<CompiledSchema>>, dir: PathBuf) -> Self {
        Self {
            client,
            schemas,
            dir,
        }
    }

    /// Load every snapshot file, sorted by id.
    pub fn files(&self) -> Result<Vec<SchemaMigrationFile>> {
        let mut files = Vec::new();
        if !self.dir.exists() {
            return Ok(files);
        }
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| OmError::Migration(format!("cannot read {}: {e}", self.dir.display())))?;
        for entry in entries {
            let path = entry
                .map_err(|e| OmError::Migration(format!("cannot read migration dir: {e}")))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            files.push(read_file(&path)?);
        }
        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    /// The newest snapshot per record type.
    fn file_heads(&self) -> Result<std::collections::HashMap<String, SchemaMigrationFile>> {
        let mut heads = std::collections::HashMap::new();
        for file in self.files()? {
            heads.insert(file.record.clone(), file);
        }
        Ok(heads)
    }

    async fn applied(&self) -> Result<HashSet<String>> {
        Ok(self
            .client
            .smembers(&schema_applied_key())
            .await?
            .into_iter()
            .collect())
    }

    /// Compare each registered record type against the file series and the
    /// server.
    pub async fn status(&self) -> Result<Vec<RecordStatus>> {
        let heads = self.file_heads()?;
        let mut statuses = Vec::new();
        for schema in &self.schemas {
            let current =
                index::fingerprint(schema.layout, &schema.key_prefix, &schema.fields);
            let server_fingerprint = self.client.get_string(&schema.schema_hash_key).await?;
            let index_exists = self.client.ft_info(&schema.index_name).await?.is_some();
            let state = match (&server_fingerprint, index_exists) {
                (Some(stored), true) if stored == &current => DriftState::UpToDate,
                (Some(_), _) => DriftState::PendingDrift,
                (None, true) => DriftState::OrphanOnServer,
                (None, false) => DriftState::PendingCreate,
            };
            statuses.push(RecordStatus {
                record: schema.record.clone(),
                index_name: schema.index_name.clone(),
                state,
                current_fingerprint: current,
                server_fingerprint,
                file_head_fingerprint: heads
                    .get(&schema.record)
                    .map(|f| f.new_fingerprint.clone()),
            });
        }
        Ok(statuses)
    }

    /// Snapshot every record type whose in-memory definition differs from
    /// the last known one. Returns the paths written.
    pub async fn create(&self, slug: &str) -> Result<Vec<PathBuf>> {
        let heads = self.file_heads()?;
        let id = new_migration_id(slug);
        let mut written = Vec::new();
        for schema in &self.schemas {
            let current =
                index::fingerprint(schema.layout, &schema.key_prefix, &schema.fields);
            let head = heads.get(&schema.record);
            let last_known = match head {
                Some(file) => Some(file.new_fingerprint.clone()),
                // No file history: fall back to what the server recorded.
                None => self.client.get_string(&schema.schema_hash_key).await?,
            };
            if last_known.as_deref() == Some(current.as_str()) {
                continue;
            }
            let file = SchemaMigrationFile {
                id: format!("{id}_{}", schema.record),
                record: schema.record.clone(),
                index_name: schema.index_name.clone(),
                key_prefix: schema.key_prefix.clone(),
                layout: schema.layout,
                schema_hash_key: schema.schema_hash_key.clone(),
                previous_fingerprint: last_known,
                new_fingerprint: current,
                previous_fields: head.map(|f| f.new_fields.clone()),
                new_fields: schema.fields.clone(),
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            written.push(self.write_file(&file)?);
        }
        Ok(written)
    }

    fn write_file(&self, file: &SchemaMigrationFile) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| OmError::Migration(format!("cannot create {}: {e}", self.dir.display())))?;
        let path = self.dir.join(format!("{}.json", file.id));
        let payload = serde_json::to_string_pretty(file)?;
        std::fs::write(&path, payload)
            .map_err(|e| OmError::Migration(format!("cannot write {}: {e}", path.display())))?;
        info!(id = %file.id, record = %file.record, "wrote schema migration");
        Ok(path)
    }

    /// Apply every un-applied snapshot in id order. An FT.CREATE failure
    /// aborts the run; migrations applied before the failure stay applied.
    pub async fn run(&self) -> Result<usize> {
        let applied = self.applied().await?;
        let mut count = 0;
        for file in self.files()? {
            if applied.contains(&file.id) {
                continue;
            }
            self.apply_definition(
                &file.index_name,
                file.layout,
                &file.key_prefix,
                &file.new_fields,
                &file.schema_hash_key,
                &file.new_fingerprint,
            )
            .await?;
            self.client
                .sadd(&schema_applied_key(), &file.id)
                .await?;
            info!(id = %file.id, index = %file.index_name, "applied schema migration");
            count += 1;
        }
        Ok(count)
    }

    /// Re-create the previous index definition for one applied migration.
    pub async fn rollback(&self, id: &str) -> Result<bool> {
        let Some(file) = self.files()?.into_iter().find(|f| f.id == id) else {
            return Err(OmError::Migration(format!("migration '{id}' not found")));
        };
        if !self.applied().await?.contains(id) {
            warn!(id, "migration is not applied; nothing to roll back");
            return Ok(false);
        }
        let (Some(previous_fields), Some(previous_fingerprint)) =
            (&file.previous_fields, &file.previous_fingerprint)
        else {
            return Err(OmError::Migration(format!(
                "migration '{id}' has no previous definition to roll back to"
            )));
        };
        self.apply_definition(
            &file.index_name,
            file.layout,
            &file.key_prefix,
            previous_fields,
            &file.schema_hash_key,
            previous_fingerprint,
        )
        .await?;
        self.client.srem(&schema_applied_key(), id).await?;
        info!(id, index = %file.index_name, "rolled back schema migration");
        Ok(true)
    }

    async fn apply_definition(
        &self,
        index_name: &str,
        layout: StorageLayout,
        key_prefix: &str,
        fields: &[IndexField],
        schema_hash_key: &str,
        fingerprint: &str,
    ) -> Result<()> {
        match self.client.db_number() {
            0 => {}
            n => return Err(OmError::DatabaseNumber(n)),
        }
        // Skip the rebuild when the server already holds this definition;
        // this is what makes a crash between create and fingerprint write
        // safe to rerun.
        if self.client.get_string(schema_hash_key).await?.as_deref() == Some(fingerprint) {
            return Ok(());
        }
        self.client.ft_dropindex(index_name).await?;
        let args = index::ft_create_args(index_name, layout, key_prefix, fields);
        self.client.ft_create(&args).await?;
        self.client.set_string(schema_hash_key, fingerprint).await?;
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<SchemaMigrationFile> {
    let payload = std::fs::read_to_string(path)
        .map_err(|e| OmError::Migration(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&payload)
        .map_err(|e| OmError::Migration(format!("malformed migration {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::compiler::FieldKind;

    fn sample_file() -> SchemaMigrationFile {
        SchemaMigrationFile {
            id: "20240101_120000_initial_customer".to_string(),
            record: "customer".to_string(),
            index_name: "customer:index".to_string(),
            key_prefix: "customer:".to_string(),
            layout: StorageLayout::Hash,
            schema_hash_key: "customer:hash".to_string(),
            previous_fingerprint: None,
            new_fingerprint: "abc".to_string(),
            previous_fields: None,
            new_fields: vec![IndexField {
                query_name: "age".to_string(),
                path: "age".to_string(),
                kind: FieldKind::Numeric,
                sortable: true,
                case_sensitive: false,
                separator: None,
                vector: None,
                multi_value: false,
                datetime: false,
            }],
            created_at: "2024-01-01T12:00:00Z".to_string(),
        }
    }

    #[test]
    fn snapshot_files_round_trip_through_json() {
        let file = sample_file();
        let text = serde_json::to_string_pretty(&file).unwrap();
        let back: SchemaMigrationFile = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, file.id);
        assert_eq!(back.new_fields, file.new_fields);
        assert_eq!(back.previous_fields, None);
    }

    #[test]
    fn snapshot_fields_rebuild_the_create_command() {
        let file = sample_file();
        let args = index::ft_create_args(
            &file.index_name,
            file.layout,
            &file.key_prefix,
            &file.new_fields,
        );
        let joined = args.join(" ");
        assert!(joined.contains("customer:index ON HASH PREFIX 1 customer:"));
        assert!(joined.contains("age AS age NUMERIC SORTABLE"));
    }
}
