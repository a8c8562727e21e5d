// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The Redis client wrapper.
//!
//! One [`RedisClient`] (a cheap clone around a `ConnectionManager`) is
//! shared across every record type. Commands are retried on transient
//! failures with the `query` preset; response errors propagate unchanged so
//! callers can classify them.
//!
//! Hash field expiration (HEXPIRE/HTTL/HPERSIST) needs Redis 7.4+; on older
//! servers those calls degrade to an observable warning and a no-op result
//! rather than an error.

use std::collections::HashMap;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{cmd, Client, Pipeline, Value};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::database_number;
use crate::error::{is_module_missing, is_unknown_index, OmError, Result};
use crate::storage::retry::{retry, RetryConfig};

#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    db_number: i64,
    has_search: Arc<OnceCell<bool>>,
    has_json: Arc<OnceCell<bool>>,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("db_number", &self.db_number)
            .finish()
    }
}

impl RedisClient {
    /// Connect with the startup retry preset: fail within a few seconds on
    /// a bad URL or an unreachable server.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = retry("redis_connect", &RetryConfig::startup(), || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .await?;
        Ok(Self {
            connection,
            db_number: database_number(url),
            has_search: Arc::new(OnceCell::new()),
            has_json: Arc::new(OnceCell::new()),
        })
    }

    /// Logical database selected by the connection URL. Index operations
    /// only work against database 0.
    pub fn db_number(&self) -> i64 {
        self.db_number
    }

    /// Run an arbitrary prepared command with query retries.
    pub async fn execute(&self, command: &redis::Cmd) -> Result<Value> {
        let conn = self.connection.clone();
        retry("redis_execute", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let command = command.clone();
            async move { command.query_async(&mut conn).await }
        })
        .await
        .map_err(OmError::from)
    }

    async fn query<T: redis::FromRedisValue + Send>(
        &self,
        name: &'static str,
        command: redis::Cmd,
    ) -> Result<T> {
        let conn = self.connection.clone();
        retry(name, &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let command = command.clone();
            async move { command.query_async(&mut conn).await }
        })
        .await
        .map_err(OmError::from)
    }

    pub async fn ping(&self) -> Result<()> {
        self.query("redis_ping", cmd("PING")).await
    }

    // -- plain keys ---------------------------------------------------------

    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.query("redis_get", {
            let mut c = cmd("GET");
            c.arg(key);
            c
        })
        .await
    }

    pub async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.query("redis_set", {
            let mut c = cmd("SET");
            c.arg(key).arg(value);
            c
        })
        .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.query("redis_exists", {
            let mut c = cmd("EXISTS");
            c.arg(key);
            c
        })
        .await
    }

    pub async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query("redis_del", {
            let mut c = cmd("DEL");
            for key in keys {
                c.arg(key);
            }
            c
        })
        .await
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> Result<bool> {
        self.query("redis_expire", {
            let mut c = cmd("EXPIRE");
            c.arg(key).arg(seconds);
            c
        })
        .await
    }

    // -- hashes -------------------------------------------------------------

    pub async fn hset(&self, key: &str, pairs: &[(String, Vec<u8>)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.query("redis_hset", {
            let mut c = cmd("HSET");
            c.arg(key);
            for (field, value) in pairs {
                c.arg(field).arg(value.as_slice());
            }
            c
        })
        .await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.query("redis_hgetall", {
            let mut c = cmd("HGETALL");
            c.arg(key);
            c
        })
        .await
    }

    pub async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.query("redis_hdel", {
            let mut c = cmd("HDEL");
            c.arg(key);
            for field in fields {
                c.arg(field);
            }
            c
        })
        .await
    }

    /// HEXPIRE, or a warned no-op on servers without hash-field expiration.
    pub async fn hexpire(
        &self,
        key: &str,
        seconds: i64,
        fields: &[String],
    ) -> Result<Option<Vec<i64>>> {
        let mut c = cmd("HEXPIRE");
        c.arg(key).arg(seconds).arg("FIELDS").arg(fields.len());
        for field in fields {
            c.arg(field);
        }
        self.hash_field_ttl_command("redis_hexpire", c).await
    }

    /// HTTL, or a warned no-op on servers without hash-field expiration.
    pub async fn httl(&self, key: &str, fields: &[String]) -> Result<Option<Vec<i64>>> {
        let mut c = cmd("HTTL");
        c.arg(key).arg("FIELDS").arg(fields.len());
        for field in fields {
            c.arg(field);
        }
        self.hash_field_ttl_command("redis_httl", c).await
    }

    /// HPERSIST, or a warned no-op on servers without hash-field expiration.
    pub async fn hpersist(&self, key: &str, fields: &[String]) -> Result<Option<Vec<i64>>> {
        let mut c = cmd("HPERSIST");
        c.arg(key).arg("FIELDS").arg(fields.len());
        for field in fields {
            c.arg(field);
        }
        self.hash_field_ttl_command("redis_hpersist", c).await
    }

    async fn hash_field_ttl_command(
        &self,
        name: &'static str,
        command: redis::Cmd,
    ) -> Result<Option<Vec<i64>>> {
        match self.query::<Vec<i64>>(name, command).await {
            Ok(ttls) => Ok(Some(ttls)),
            Err(OmError::Connection(err)) if is_module_missing(&err) => {
                warn!(
                    operation = name,
                    "server does not support hash field expiration (needs Redis 7.4+); skipping"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    // -- JSON documents -----------------------------------------------------

    pub async fn json_set(&self, key: &str, doc: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(doc)?;
        self.json_guard(
            self.query("redis_json_set", {
                let mut c = cmd("JSON.SET");
                c.arg(key).arg("$").arg(&payload);
                c
            })
            .await,
        )
    }

    /// JSON.SET with NX or XX. Returns false when the condition failed.
    pub async fn json_set_conditional(
        &self,
        key: &str,
        doc: &serde_json::Value,
        nx: bool,
    ) -> Result<bool> {
        let payload = serde_json::to_string(doc)?;
        let reply: Result<Value> = self
            .query("redis_json_set_cond", {
                let mut c = cmd("JSON.SET");
                c.arg(key).arg("$").arg(&payload);
                c.arg(if nx { "NX" } else { "XX" });
                c
            })
            .await;
        match self.json_guard(reply)? {
            Value::Nil => Ok(false),
            _ => Ok(true),
        }
    }

    pub async fn json_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self.json_guard(
            self.query("redis_json_get", {
                let mut c = cmd("JSON.GET");
                c.arg(key);
                c
            })
            .await,
        )?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub async fn json_del(&self, key: &str) -> Result<u64> {
        self.json_guard(
            self.query("redis_json_del", {
                let mut c = cmd("JSON.DEL");
                c.arg(key);
                c
            })
            .await,
        )
    }

    fn json_guard<T>(&self, reply: Result<T>) -> Result<T> {
        match reply {
            Err(OmError::Connection(err)) if is_module_missing(&err) => Err(OmError::Capability(
                "JSON commands are unavailable".to_string(),
            )),
            other => other,
        }
    }

    // -- scanning -----------------------------------------------------------

    /// One SCAN page, optionally restricted to one value type (`hash`,
    /// `ReJSON-RL`, ...) so record iteration skips bookkeeping keys sharing
    /// the prefix. Returns the next cursor (0 = exhausted) and the keys.
    pub async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
        key_type: Option<&str>,
    ) -> Result<(u64, Vec<String>)> {
        self.query("redis_scan", {
            let mut c = cmd("SCAN");
            c.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(count);
            if let Some(t) = key_type {
                c.arg("TYPE").arg(t);
            }
            c
        })
        .await
    }

    // -- sets (migration bookkeeping) ---------------------------------------

    pub async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.query("redis_sadd", {
            let mut c = cmd("SADD");
            c.arg(key).arg(member);
            c
        })
        .await
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.query("redis_srem", {
            let mut c = cmd("SREM");
            c.arg(key).arg(member);
            c
        })
        .await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.query("redis_smembers", {
            let mut c = cmd("SMEMBERS");
            c.arg(key);
            c
        })
        .await
    }

    // -- pipelines ----------------------------------------------------------

    /// Run a caller-assembled pipeline. Commands execute in order on one
    /// connection.
    pub async fn run_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let conn = self.connection.clone();
        retry("redis_pipeline", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let pipeline = pipeline.clone();
            async move { pipeline.query_async::<()>(&mut conn).await }
        })
        .await
        .map_err(OmError::from)
    }

    // -- search module ------------------------------------------------------

    /// FT.CREATE with pre-assembled arguments. A missing search module maps
    /// to a capability error with an installation hint.
    pub async fn ft_create(&self, args: &[String]) -> Result<()> {
        let reply: Result<()> = self
            .query("redis_ft_create", {
                let mut c = cmd("FT.CREATE");
                for arg in args {
                    c.arg(arg);
                }
                c
            })
            .await;
        match reply {
            Err(OmError::Connection(err)) if is_module_missing(&err) => Err(OmError::Capability(
                "FT.CREATE is unavailable".to_string(),
            )),
            other => other,
        }
    }

    /// FT.DROPINDEX. Returns false (not an error) when the index does not
    /// exist.
    pub async fn ft_dropindex(&self, index_name: &str) -> Result<bool> {
        let reply: Result<()> = self
            .query("redis_ft_dropindex", {
                let mut c = cmd("FT.DROPINDEX");
                c.arg(index_name);
                c
            })
            .await;
        match reply {
            Ok(()) => Ok(true),
            Err(OmError::Connection(err)) if is_unknown_index(&err) => Ok(false),
            Err(OmError::Connection(err)) if is_module_missing(&err) => Err(OmError::Capability(
                "FT.DROPINDEX is unavailable".to_string(),
            )),
            Err(err) => Err(err),
        }
    }

    /// FT.INFO, or None when the index does not exist.
    pub async fn ft_info(&self, index_name: &str) -> Result<Option<Value>> {
        let reply: Result<Value> = self
            .query("redis_ft_info", {
                let mut c = cmd("FT.INFO");
                c.arg(index_name);
                c
            })
            .await;
        match reply {
            Ok(value) => Ok(Some(value)),
            Err(OmError::Connection(err)) if is_unknown_index(&err) => Ok(None),
            Err(OmError::Connection(err)) if is_module_missing(&err) => Err(OmError::Capability(
                "FT.INFO is unavailable".to_string(),
            )),
            Err(err) => Err(err),
        }
    }

    /// True when the server exposes FT.* commands. Probed once, cached for
    /// the connection's lifetime.
    pub async fn has_search(&self) -> Result<bool> {
        self.probe(&self.has_search, "ft.create").await
    }

    /// True when the server exposes JSON.* commands.
    pub async fn has_json(&self) -> Result<bool> {
        self.probe(&self.has_json, "json.set").await
    }

    async fn probe(&self, cell: &OnceCell<bool>, command_name: &str) -> Result<bool> {
        let present = cell
            .get_or_try_init(|| async {
                let reply: Value = self
                    .query("redis_command_info", {
                        let mut c = cmd("COMMAND");
                        c.arg("INFO").arg(command_name);
                        c
                    })
                    .await?;
                let present = match reply {
                    Value::Array(entries) => {
                        entries.iter().any(|entry| !matches!(entry, Value::Nil))
                    }
                    Value::Nil => false,
                    _ => true,
                };
                debug!(command = command_name, present, "capability probe");
                Ok::<bool, OmError>(present)
            })
            .await?;
        Ok(*present)
    }
}
