// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The client object and per-record repositories.
//!
//! [`Om`] owns the shared wire client and a write-once registry of compiled
//! schemas; [`Repo<T>`] is the typed handle for one record type:
//!
//! ```ignore
//! let om = Om::connect().await?;
//! let customers = om.repository::<Customer>()?;
//! let pk = customers.save(&customer).await?;
//! let found = customers
//!     .find([customers.field("last_name")?.eq("Brookins")])
//!     .first()
//!     .await?;
//! ```
//!
//! Registration compiles the schema eagerly, so a misdeclared record type
//! fails at `repository()`, not at first use.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::codec;
use crate::config::OmConfig;
use crate::error::{OmError, Result};
use crate::index::{IndexManager, IndexOutcome};
use crate::keys::{KeyCodec, PrimaryKeyCreator, UlidKeyCreator};
use crate::query::expr::{Expr, Field};
use crate::query::find::FindQuery;
use crate::schema::compiler::CompiledSchema;
use crate::schema::{Record, StorageLayout};
use crate::storage::RedisClient;

/// The mapping-layer client: one shared connection plus the registry of
/// compiled record schemas.
#[derive(Clone)]
pub struct Om {
    client: RedisClient,
    config: Arc<OmConfig>,
    registry: Arc<DashMap<String, Arc<CompiledSchema>>>,
}

impl Om {
    /// Connect using `REDIS_OM_URL` (and defaults for the rest).
    pub async fn connect() -> Result<Self> {
        Self::with_config(OmConfig::from_env()).await
    }

    pub async fn with_config(config: OmConfig) -> Result<Self> {
        let client = RedisClient::connect(&config.url).await?;
        Ok(Self {
            client,
            config: Arc::new(config),
            registry: Arc::new(DashMap::new()),
        })
    }

    pub fn client(&self) -> &RedisClient {
        &self.client
    }

    pub fn config(&self) -> &OmConfig {
        &self.config
    }

    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }

    /// Register (or fetch the already-registered) repository for a record
    /// type. Compilation errors surface here, eagerly.
    pub fn repository<T: Record>(&self) -> Result<Repo<T>> {
        let declared = T::schema();
        let compiled = match self.registry.get(&declared.name) {
            Some(entry) => entry.value().clone(),
            None => {
                let compiled = CompiledSchema::compile(&declared)?;
                debug!(record = %declared.name, fields = compiled.fields.len(), "registered record type");
                self.registry
                    .insert(declared.name.clone(), compiled.clone());
                compiled
            }
        };
        let creator: Arc<dyn PrimaryKeyCreator> = declared
            .meta
            .primary_key_creator
            .clone()
            .unwrap_or_else(|| Arc::new(UlidKeyCreator));
        Ok(Repo {
            client: self.client.clone(),
            schema: compiled.clone(),
            keys: KeyCodec::new(&compiled.source.meta),
            creator,
            page_size: self.config.default_page_size,
            scan_count: self.config.scan_count,
            _marker: std::marker::PhantomData,
        })
    }

    /// Every schema registered so far (the migrators operate on these).
    pub fn registered_schemas(&self) -> Vec<Arc<CompiledSchema>> {
        let mut schemas: Vec<_> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        schemas.sort_by(|a, b| a.record.cmp(&b.record));
        schemas
    }
}

/// Typed operations for one record type.
pub struct Repo<T: Record> {
    client: RedisClient,
    schema: Arc<CompiledSchema>,
    keys: KeyCodec,
    creator: Arc<dyn PrimaryKeyCreator>,
    page_size: usize,
    scan_count: usize,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Record> Clone for Repo<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            schema: self.schema.clone(),
            keys: self.keys.clone(),
            creator: self.creator.clone(),
            page_size: self.page_size,
            scan_count: self.scan_count,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Record> Repo<T> {
    pub fn schema(&self) -> &Arc<CompiledSchema> {
        &self.schema
    }

    pub fn key_for(&self, pk: &str) -> String {
        self.keys.key(pk)
    }

    /// Encode the record and resolve its primary key, allocating one when
    /// the pk field is empty.
    fn prepare(&self, record: &T) -> Result<(String, Value)> {
        let mut value = serde_json::to_value(record).map_err(OmError::Validation)?;
        let pk_field = self
            .schema
            .source
            .primary_key_field()
            .expect("compiled schemas always carry a primary key")
            .name
            .clone();
        let current = value.get(&pk_field).cloned();
        let pk = match current {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => {
                let pk = self.creator.allocate();
                if let Some(object) = value.as_object_mut() {
                    object.insert(pk_field, Value::String(pk.clone()));
                }
                pk
            }
        };
        Ok((pk, value))
    }

    /// Save (upsert) the record. Returns the primary key, freshly
    /// allocated when the record carried none.
    pub async fn save(&self, record: &T) -> Result<String> {
        let _timer = crate::metrics::LatencyTimer::new("save");
        let (pk, value) = self.prepare(record)?;
        let key = self.keys.key(&pk);
        crate::metrics::record_save(&self.schema.record);
        match self.schema.layout {
            StorageLayout::Hash => {
                let pairs = codec::encode_hash(&self.schema.source, &value)?;
                self.client.hset(&key, &pairs).await?;
            }
            StorageLayout::Json => {
                let doc = codec::encode_json(&self.schema.source, &value)?;
                self.client.json_set(&key, &doc).await?;
            }
        }
        Ok(pk)
    }

    /// Save only if the key does not already exist. `None` means the
    /// condition failed. JSON records use the server's atomic NX; hash
    /// records check existence first.
    pub async fn save_nx(&self, record: &T) -> Result<Option<String>> {
        self.save_conditional(record, true).await
    }

    /// Save only if the key already exists. `None` means the condition
    /// failed.
    pub async fn save_xx(&self, record: &T) -> Result<Option<String>> {
        self.save_conditional(record, false).await
    }

    async fn save_conditional(&self, record: &T, nx: bool) -> Result<Option<String>> {
        let (pk, value) = self.prepare(record)?;
        let key = self.keys.key(&pk);
        match self.schema.layout {
            StorageLayout::Json => {
                let doc = codec::encode_json(&self.schema.source, &value)?;
                if self.client.json_set_conditional(&key, &doc, nx).await? {
                    Ok(Some(pk))
                } else {
                    Ok(None)
                }
            }
            StorageLayout::Hash => {
                let exists = self.client.exists(&key).await?;
                if exists == nx {
                    return Ok(None);
                }
                let pairs = codec::encode_hash(&self.schema.source, &value)?;
                self.client.hset(&key, &pairs).await?;
                Ok(Some(pk))
            }
        }
    }

    /// Queue this record's write into a caller-provided pipeline. The
    /// caller runs the pipeline; nothing is sent here.
    pub fn save_with(&self, record: &T, pipeline: &mut redis::Pipeline) -> Result<String> {
        let (pk, value) = self.prepare(record)?;
        let key = self.keys.key(&pk);
        match self.schema.layout {
            StorageLayout::Hash => {
                let pairs = codec::encode_hash(&self.schema.source, &value)?;
                let mut cmd = redis::cmd("HSET");
                cmd.arg(&key);
                for (field, bytes) in &pairs {
                    cmd.arg(field).arg(bytes.as_slice());
                }
                pipeline.add_command(cmd);
            }
            StorageLayout::Json => {
                let doc = codec::encode_json(&self.schema.source, &value)?;
                let payload = serde_json::to_string(&doc)?;
                let mut cmd = redis::cmd("JSON.SET");
                cmd.arg(&key).arg("$").arg(payload);
                pipeline.add_command(cmd);
            }
        }
        Ok(pk)
    }

    pub async fn get(&self, pk: &str) -> Result<T> {
        let key = self.keys.key(pk);
        let decoded = match self.schema.layout {
            StorageLayout::Hash => {
                let map = self.client.hgetall(&key).await?;
                if map.is_empty() {
                    return Err(OmError::NotFound);
                }
                let pairs: Vec<(Vec<u8>, Vec<u8>)> = map
                    .into_iter()
                    .map(|(name, bytes)| (name.into_bytes(), bytes))
                    .collect();
                codec::decode_hash(&self.schema.source, &pairs)?
            }
            StorageLayout::Json => {
                let doc = self.client.json_get(&key).await?.ok_or(OmError::NotFound)?;
                codec::decode_json(&self.schema.source, &doc)?
            }
        };
        serde_json::from_value(decoded).map_err(OmError::Validation)
    }

    /// Delete by primary key; returns the number of keys removed (0 or 1).
    pub async fn delete(&self, pk: &str) -> Result<u64> {
        self.client.del(&[self.keys.key(pk)]).await
    }

    /// Queue a delete into a caller-provided pipeline.
    pub fn delete_with(&self, pk: &str, pipeline: &mut redis::Pipeline) {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.keys.key(pk));
        pipeline.add_command(cmd);
    }

    /// Set a TTL on the whole record key.
    pub async fn expire(&self, pk: &str, seconds: i64) -> Result<bool> {
        self.client.expire(&self.keys.key(pk), seconds).await
    }

    /// Set a TTL on one hash field (flat records, Redis 7.4+). `None`
    /// means the server lacks hash-field expiration.
    pub async fn expire_field(
        &self,
        pk: &str,
        field: &str,
        seconds: i64,
    ) -> Result<Option<i64>> {
        self.guard_flat("field expiration")?;
        let reply = self
            .client
            .hexpire(&self.keys.key(pk), seconds, &[field.to_string()])
            .await?;
        Ok(reply.and_then(|codes| codes.first().copied()))
    }

    /// Remaining TTL of one hash field, in seconds. `-1` means no expiry,
    /// `-2` means the field does not exist.
    pub async fn field_ttl(&self, pk: &str, field: &str) -> Result<Option<i64>> {
        self.guard_flat("field TTLs")?;
        let reply = self
            .client
            .httl(&self.keys.key(pk), &[field.to_string()])
            .await?;
        Ok(reply.and_then(|codes| codes.first().copied()))
    }

    /// Remove the expiration from one hash field.
    pub async fn persist_field(&self, pk: &str, field: &str) -> Result<Option<i64>> {
        self.guard_flat("field expiration")?;
        let reply = self
            .client
            .hpersist(&self.keys.key(pk), &[field.to_string()])
            .await?;
        Ok(reply.and_then(|codes| codes.first().copied()))
    }

    fn guard_flat(&self, what: &str) -> Result<()> {
        match self.schema.layout {
            StorageLayout::Hash => Ok(()),
            StorageLayout::Json => Err(OmError::Schema(format!(
                "{what} only applies to flat (hash) records; '{}' is a document record",
                self.schema.record
            ))),
        }
    }

    /// Every primary key of this record type, via SCAN (no index needed).
    /// The scan is restricted to the layout's value type so bookkeeping
    /// keys sharing the prefix (the fingerprint) are not misread as
    /// records.
    pub async fn all_pks(&self) -> Result<Vec<String>> {
        let pattern = self.keys.all_keys_pattern();
        let key_type = match self.schema.layout {
            StorageLayout::Hash => "hash",
            StorageLayout::Json => "ReJSON-RL",
        };
        let mut pks = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self
                .client
                .scan(cursor, &pattern, self.scan_count, Some(key_type))
                .await?;
            pks.extend(
                keys.iter()
                    .map(|key| self.keys.primary_key_of(key).to_string()),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(pks)
    }

    /// A field proxy for building query expressions. Accepts query names
    /// (`address_city`) and dotted paths (`address.city`).
    pub fn field(&self, reference: &str) -> Result<Field> {
        Field::resolve(&self.schema, reference)
    }

    /// Start a query. Multiple expressions are AND-combined; none matches
    /// everything.
    pub fn find(&self, exprs: impl IntoIterator<Item = Expr>) -> FindQuery<T> {
        FindQuery::new(
            self.client.clone(),
            self.schema.clone(),
            Expr::all_of(exprs),
            self.page_size,
        )
    }

    /// Create (or refresh) this record type's search index.
    pub async fn create_index(&self) -> Result<IndexOutcome> {
        IndexManager::new(&self.client, &self.schema)
            .create_index()
            .await
    }

    /// Drop this record type's search index and its stored fingerprint.
    pub async fn drop_index(&self) -> Result<bool> {
        IndexManager::new(&self.client, &self.schema).drop_index().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, RecordSchema};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Customer {
        #[serde(default)]
        pk: String,
        last_name: String,
        age: i64,
    }

    impl Record for Customer {
        fn schema() -> RecordSchema {
            RecordSchema::hash("customer")
                .field(FieldDef::str("pk").primary_key())
                .field(FieldDef::str("last_name").indexed())
                .field(FieldDef::int("age").indexed().sortable())
                .build()
        }
    }

    #[test]
    fn schema_compiles_once_per_record_type() {
        // Registry behavior is observable without a server: compile the
        // schema directly and check both handles agree.
        let a = CompiledSchema::compile(&Customer::schema()).unwrap();
        let b = CompiledSchema::compile(&Customer::schema()).unwrap();
        assert_eq!(a.index_name, b.index_name);
        assert_eq!(a.fields, b.fields);
    }
}
