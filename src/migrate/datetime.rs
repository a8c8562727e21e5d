// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Built-in datetime transition and its drift diagnostics.
//!
//! Older deployments stored datetime fields as ISO-8601 strings, which
//! forced TAG indexing and broke range queries. The current encoding is
//! numeric seconds since epoch, indexed NUMERIC. [`DatetimeTransition`]
//! rewrites stored values in place, idempotently: values already numeric
//! are skipped, so rerunning (or resuming after an interruption) is safe.
//!
//! [`check_schema`] is the passive diagnostic: it compares the
//! server-reported kind of every datetime index field against the expected
//! NUMERIC and reports drift. [`assert_no_drift`] is the startup guard
//! built on it; nothing runs the transition implicitly.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::codec::{
    datetime_to_timestamp, format_f64, parse_datetime_flexible, timestamp_to_datetime,
};
use crate::error::{OmError, Result};
use crate::migrate::data::{DataMigration, FailureMode, MigrationContext};
use crate::schema::compiler::CompiledSchema;
use crate::schema::StorageLayout;
use crate::storage::RedisClient;

/// Id of the built-in transition.
pub const DATETIME_MIGRATION_ID: &str = "001_datetime_to_timestamps";

/// Redis value types carrying each storage layout.
fn keyspace_type(layout: StorageLayout) -> &'static str {
    match layout {
        StorageLayout::Hash => "hash",
        StorageLayout::Json => "ReJSON-RL",
    }
}

/// Converts legacy ISO-8601 datetime strings to numeric timestamps across
/// every registered record type.
pub struct DatetimeTransition;

#[async_trait]
impl DataMigration for DatetimeTransition {
    fn id(&self) -> &str {
        DATETIME_MIGRATION_ID
    }

    fn description(&self) -> &str {
        "convert stored datetime fields from ISO-8601 strings to numeric timestamps"
    }

    async fn can_run(&self, ctx: &MigrationContext) -> Result<bool> {
        ctx.client.ping().await?;
        Ok(true)
    }

    async fn up(&self, ctx: &MigrationContext) -> Result<()> {
        self.transform(ctx, Direction::Up).await
    }

    /// Approximate reversal: numeric timestamps become ISO strings again.
    /// Sub-second precision beyond microseconds is not reconstructed.
    async fn down(&self, ctx: &MigrationContext) -> Result<()> {
        self.transform(ctx, Direction::Down).await
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl DatetimeTransition {
    async fn transform(&self, ctx: &MigrationContext, direction: Direction) -> Result<()> {
        let mut schemas: Vec<Arc<CompiledSchema>> = ctx
            .schemas
            .iter()
            .filter(|s| s.has_datetime_fields())
            .cloned()
            .collect();
        schemas.sort_by(|a, b| a.record.cmp(&b.record));
        if schemas.is_empty() {
            info!("no record types declare datetime fields; nothing to do");
            return Ok(());
        }

        // Resume: skip record types finished in a previous run and pick up
        // the SCAN cursor within the interrupted one. Conversion is
        // idempotent, so an imprecise cursor only costs re-reads.
        let checkpoint = ctx.load_progress().await?;
        if let Some(progress) = &checkpoint {
            ctx.restore_stats(progress.stats.clone());
            info!(
                record = ?progress.record,
                seen = progress.stats.seen,
                "resuming datetime transition from checkpoint"
            );
        }
        let mut resume = checkpoint.and_then(|p| p.record.map(|record| (record, p.cursor)));

        for schema in &schemas {
            let mut cursor = match &resume {
                Some((record, saved_cursor)) => {
                    if schema.record < *record {
                        continue;
                    }
                    if schema.record == *record {
                        let cursor = *saved_cursor;
                        resume = None;
                        cursor
                    } else {
                        resume = None;
                        0
                    }
                }
                None => 0,
            };
            let leaves: HashSet<String> = schema.datetime_leaf_names().into_iter().collect();
            info!(
                record = %schema.record,
                fields = ?leaves,
                "processing datetime fields"
            );
            loop {
                let (next, keys) = ctx
                    .client
                    .scan(
                        cursor,
                        &schema.all_keys_pattern,
                        ctx.options.batch_size,
                        Some(keyspace_type(schema.layout)),
                    )
                    .await?;
                for key in &keys {
                    self.transform_key(ctx, schema, key, &leaves, direction).await?;
                    ctx.note_seen();
                    ctx.maybe_save_progress(Some(&schema.record), cursor, Some(key))
                        .await?;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            ctx.save_progress(Some(&schema.record), 0, None).await?;
        }
        let stats = ctx.stats();
        info!(
            seen = stats.seen,
            ok = stats.ok,
            skipped = stats.skipped,
            errored = stats.errored,
            "datetime transition finished"
        );
        Ok(())
    }

    async fn transform_key(
        &self,
        ctx: &MigrationContext,
        schema: &CompiledSchema,
        key: &str,
        leaves: &HashSet<String>,
        direction: Direction,
    ) -> Result<()> {
        match schema.layout {
            StorageLayout::Hash => {
                let map = ctx.client.hgetall(key).await?;
                let mut updates = Vec::new();
                for field in leaves {
                    let Some(bytes) = map.get(field) else {
                        continue;
                    };
                    let text = String::from_utf8_lossy(bytes).into_owned();
                    match convert_scalar(&Value::String(text), direction) {
                        Conversion::Already => ctx.note_skipped(),
                        Conversion::To(value) => {
                            ctx.note_ok();
                            updates.push((field.clone(), value_to_hash_bytes(&value)));
                        }
                        Conversion::Failed(detail) => {
                            ctx.note_error(key, field, &detail)?;
                            if ctx.options.failure_mode == FailureMode::Default {
                                updates.push((
                                    field.clone(),
                                    format_f64(ctx.options.default_timestamp).into_bytes(),
                                ));
                            }
                        }
                    }
                }
                if !updates.is_empty() && !ctx.options.dry_run {
                    ctx.client.hset(key, &updates).await?;
                }
            }
            StorageLayout::Json => {
                let Some(doc) = ctx.client.json_get(key).await? else {
                    return Ok(());
                };
                let mut changed = false;
                let converted =
                    convert_document(ctx, key, &doc, leaves, direction, &mut changed)?;
                if changed && !ctx.options.dry_run {
                    ctx.client.json_set(key, &converted).await?;
                }
            }
        }
        Ok(())
    }
}

enum Conversion {
    /// Value is already in the target form.
    Already,
    To(Value),
    Failed(String),
}

fn convert_scalar(value: &Value, direction: Direction) -> Conversion {
    match direction {
        Direction::Up => match value {
            Value::Number(_) => Conversion::Already,
            Value::String(s) => {
                if s.parse::<f64>().is_ok() {
                    return Conversion::Already;
                }
                match parse_datetime_flexible(value) {
                    Some(dt) => Conversion::To(serde_json::json!(datetime_to_timestamp(&dt))),
                    None => Conversion::Failed(format!("not a datetime: '{s}'")),
                }
            }
            other => Conversion::Failed(format!("unexpected value {other}")),
        },
        Direction::Down => match value {
            Value::String(_) => Conversion::Already,
            Value::Number(n) => match n.as_f64().and_then(timestamp_to_datetime) {
                Some(dt) => Conversion::To(Value::String(dt.to_rfc3339())),
                None => Conversion::Failed(format!("not a timestamp: {n}")),
            },
            other => Conversion::Failed(format!("unexpected value {other}")),
        },
    }
}

fn value_to_hash_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Number(n) => format_f64(n.as_f64().unwrap_or(0.0)).into_bytes(),
        Value::String(s) => s.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

/// Recursively convert fields whose name matches a declared datetime leaf,
/// anywhere in the document (embedded records and lists included).
fn convert_document(
    ctx: &MigrationContext,
    key: &str,
    value: &Value,
    leaves: &HashSet<String>,
    direction: Direction,
    changed: &mut bool,
) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (name, child) in map {
                if leaves.contains(name) {
                    match convert_scalar(child, direction) {
                        Conversion::Already => {
                            ctx.note_skipped();
                            out.insert(name.clone(), child.clone());
                        }
                        Conversion::To(converted) => {
                            ctx.note_ok();
                            *changed = true;
                            out.insert(name.clone(), converted);
                        }
                        Conversion::Failed(detail) => {
                            ctx.note_error(key, name, &detail)?;
                            if ctx.options.failure_mode == FailureMode::Default {
                                *changed = true;
                                out.insert(
                                    name.clone(),
                                    serde_json::json!(ctx.options.default_timestamp),
                                );
                            } else {
                                out.insert(name.clone(), child.clone());
                            }
                        }
                    }
                } else {
                    out.insert(
                        name.clone(),
                        convert_document(ctx, key, child, leaves, direction, changed)?,
                    );
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let converted: Result<Vec<Value>> = items
                .iter()
                .map(|item| convert_document(ctx, key, item, leaves, direction, changed))
                .collect();
            Ok(Value::Array(converted?))
        }
        other => Ok(other.clone()),
    }
}

/// One datetime field whose server-side index kind disagrees with the
/// expected NUMERIC.
#[derive(Debug, Clone, Serialize)]
pub struct DriftRecord {
    pub record: String,
    pub field: String,
    pub server_kind: String,
    pub expected_kind: String,
    pub index: String,
}

/// Compare FT.INFO's reported kind for every datetime index field against
/// the expected NUMERIC. Records with no server-side index are skipped.
pub async fn check_schema(
    client: &RedisClient,
    schemas: &[Arc<CompiledSchema>],
) -> Result<Vec<DriftRecord>> {
    let mut drift = Vec::new();
    for schema in schemas {
        let datetime_fields: Vec<&str> = schema
            .datetime_index_fields()
            .map(|f| f.query_name.as_str())
            .collect();
        if datetime_fields.is_empty() {
            continue;
        }
        let Some(info) = client.ft_info(&schema.index_name).await? else {
            continue;
        };
        for (alias, kind) in parse_info_attributes(&info) {
            if datetime_fields.contains(&alias.as_str()) && kind != "NUMERIC" {
                drift.push(DriftRecord {
                    record: schema.record.clone(),
                    field: alias,
                    server_kind: kind,
                    expected_kind: "NUMERIC".to_string(),
                    index: schema.index_name.clone(),
                });
            }
        }
    }
    Ok(drift)
}

/// Startup guard: refuse to serve traffic while datetime index drift is
/// present. Does not run the transition itself.
pub async fn assert_no_drift(
    client: &RedisClient,
    schemas: &[Arc<CompiledSchema>],
) -> Result<()> {
    let drift = check_schema(client, schemas).await?;
    if drift.is_empty() {
        return Ok(());
    }
    let summary: Vec<String> = drift
        .iter()
        .map(|d| format!("{}.{} is {} (expected {})", d.record, d.field, d.server_kind, d.expected_kind))
        .collect();
    Err(OmError::Migration(format!(
        "datetime index drift detected: {}; run the schema migration and the datetime data \
         migration before serving traffic",
        summary.join(", ")
    )))
}

/// Count stored datetime values still in the legacy string form.
pub async fn count_legacy_values(
    client: &RedisClient,
    schemas: &[Arc<CompiledSchema>],
    batch_size: usize,
) -> Result<u64> {
    let mut legacy = 0u64;
    for schema in schemas {
        let leaves: HashSet<String> = schema.datetime_leaf_names().into_iter().collect();
        if leaves.is_empty() {
            continue;
        }
        let mut cursor = 0u64;
        loop {
            let (next, keys) = client
                .scan(
                    cursor,
                    &schema.all_keys_pattern,
                    batch_size,
                    Some(keyspace_type(schema.layout)),
                )
                .await?;
            for key in &keys {
                match schema.layout {
                    StorageLayout::Hash => {
                        let map = client.hgetall(key).await?;
                        for field in &leaves {
                            if let Some(bytes) = map.get(field) {
                                let text = String::from_utf8_lossy(bytes);
                                if is_legacy(&text) {
                                    legacy += 1;
                                }
                            }
                        }
                    }
                    StorageLayout::Json => {
                        if let Some(doc) = client.json_get(key).await? {
                            legacy += count_legacy_in_document(&doc, &leaves);
                        }
                    }
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
    }
    Ok(legacy)
}

fn is_legacy(text: &str) -> bool {
    text.parse::<f64>().is_err()
        && parse_datetime_flexible(&Value::String(text.to_string())).is_some()
}

fn count_legacy_in_document(value: &Value, leaves: &HashSet<String>) -> u64 {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(name, child)| {
                if leaves.contains(name) {
                    match child {
                        Value::String(s) if is_legacy(s) => 1,
                        _ => 0,
                    }
                } else {
                    count_legacy_in_document(child, leaves)
                }
            })
            .sum(),
        Value::Array(items) => items
            .iter()
            .map(|item| count_legacy_in_document(item, leaves))
            .sum(),
        _ => 0,
    }
}

/// Extract `(alias, kind)` pairs from an FT.INFO reply.
fn parse_info_attributes(info: &redis::Value) -> Vec<(String, String)> {
    let redis::Value::Array(entries) = info else {
        return Vec::new();
    };
    let mut attributes = None;
    let mut iter = entries.iter();
    while let Some(entry) = iter.next() {
        if as_text(entry).as_deref() == Some("attributes") {
            attributes = iter.next();
            break;
        }
    }
    let Some(redis::Value::Array(fields)) = attributes else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for field in fields {
        let redis::Value::Array(pairs) = field else {
            continue;
        };
        let mut alias = None;
        let mut kind = None;
        let mut pair_iter = pairs.iter();
        while let Some(name) = pair_iter.next() {
            let Some(value) = pair_iter.next() else {
                break;
            };
            match as_text(name).as_deref() {
                Some("attribute") => alias = as_text(value),
                Some("type") => kind = as_text(value),
                _ => {}
            }
        }
        if let (Some(alias), Some(kind)) = (alias, kind) {
            out.push((alias, kind));
        }
    }
    out
}

fn as_text(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> redis::Value {
        redis::Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn scalar_conversion_up_is_idempotent() {
        match convert_scalar(&Value::String("2023-06-01T12:30:45Z".into()), Direction::Up) {
            Conversion::To(Value::Number(n)) => {
                assert_eq!(n.as_f64().unwrap(), 1685622645.0);
            }
            _ => panic!("expected conversion"),
        }
        assert!(matches!(
            convert_scalar(&serde_json::json!(1685622645.0), Direction::Up),
            Conversion::Already
        ));
        // Numeric strings (the hash storage form) are already converted
        assert!(matches!(
            convert_scalar(&Value::String("1685622645.5".into()), Direction::Up),
            Conversion::Already
        ));
        assert!(matches!(
            convert_scalar(&Value::String("not a date".into()), Direction::Up),
            Conversion::Failed(_)
        ));
    }

    #[test]
    fn scalar_conversion_down_restores_iso() {
        match convert_scalar(&serde_json::json!(1685622645.0), Direction::Down) {
            Conversion::To(Value::String(s)) => assert!(s.starts_with("2023-06-01T12:30:45")),
            _ => panic!("expected conversion"),
        }
        assert!(matches!(
            convert_scalar(&Value::String("2023-06-01T12:30:45Z".into()), Direction::Down),
            Conversion::Already
        ));
    }

    #[test]
    fn legacy_detection_distinguishes_forms() {
        assert!(is_legacy("2023-06-01T12:30:45Z"));
        assert!(is_legacy("2023-06-01"));
        assert!(!is_legacy("1685622645.5"));
        assert!(!is_legacy("plainly not a date"));
    }

    #[test]
    fn ft_info_attribute_parsing() {
        let info = redis::Value::Array(vec![
            bulk("index_name"),
            bulk("customer:index"),
            bulk("attributes"),
            redis::Value::Array(vec![
                redis::Value::Array(vec![
                    bulk("identifier"),
                    bulk("$.created_at"),
                    bulk("attribute"),
                    bulk("created_at"),
                    bulk("type"),
                    bulk("TAG"),
                ]),
                redis::Value::Array(vec![
                    bulk("identifier"),
                    bulk("$.age"),
                    bulk("attribute"),
                    bulk("age"),
                    bulk("type"),
                    bulk("NUMERIC"),
                ]),
            ]),
            bulk("num_docs"),
            redis::Value::Int(3),
        ]);
        let attrs = parse_info_attributes(&info);
        assert_eq!(
            attrs,
            vec![
                ("created_at".to_string(), "TAG".to_string()),
                ("age".to_string(), "NUMERIC".to_string()),
            ]
        );
    }

    #[test]
    fn legacy_count_walks_nested_documents() {
        let leaves: HashSet<String> = ["created_at".to_string()].into_iter().collect();
        let doc = serde_json::json!({
            "created_at": "2023-06-01T12:30:45Z",
            "address": {"created_at": 1685622645.0},
            "orders": [{"created_at": "2020-01-01"}],
        });
        assert_eq!(count_legacy_in_document(&doc, &leaves), 2);
    }
}
