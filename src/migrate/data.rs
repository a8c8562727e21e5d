// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data migration engine.
//!
//! A data migration is a named unit with an id, a description, a declared
//! dependency set, and `up`/`down` operations (absence of `down` means
//! non-reversible). Units register programmatically; the engine orders them
//! by dependency (cycles are fatal), iterates the key space in bounded
//! batches, checkpoints progress so an interrupted run resumes, and applies
//! a selectable failure policy with an optional error ceiling.
//!
//! Dry-run mode performs every read and transformation but suppresses
//! writes, checkpoint updates, and the applied-set update.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{OmError, Result};
use crate::migrate::{data_applied_key, datetime, new_migration_id, progress_key};
use crate::schema::compiler::CompiledSchema;
use crate::storage::RedisClient;

/// How a migration reacts to a value it cannot transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Abort the migration immediately.
    Fail,
    /// Leave the value in place, silently.
    Skip,
    /// Leave the value in place, log and count it.
    LogAndSkip,
    /// Substitute the configured default value.
    Default,
}

impl std::str::FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fail" => Ok(FailureMode::Fail),
            "skip" => Ok(FailureMode::Skip),
            "log_and_skip" => Ok(FailureMode::LogAndSkip),
            "default" => Ok(FailureMode::Default),
            other => Err(format!(
                "unknown failure mode '{other}' (expected fail, skip, log_and_skip, or default)"
            )),
        }
    }
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureMode::Fail => write!(f, "fail"),
            FailureMode::Skip => write!(f, "skip"),
            FailureMode::LogAndSkip => write!(f, "log_and_skip"),
            FailureMode::Default => write!(f, "default"),
        }
    }
}

/// Counters carried in the progress checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStats {
    pub seen: u64,
    pub ok: u64,
    pub skipped: u64,
    pub errored: u64,
}

/// Persistent cursor enabling resume after interruption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    /// Record type currently being processed.
    pub record: Option<String>,
    /// SCAN cursor within that record's key space.
    pub cursor: u64,
    pub last_key: Option<String>,
    pub stats: MigrationStats,
    pub updated_at: String,
}

/// Tunables for one migration run.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub batch_size: usize,
    /// Persist the checkpoint every this many processed keys.
    pub progress_save_interval: u64,
    pub failure_mode: FailureMode,
    /// Abort once this many values failed to convert. None = unlimited.
    pub max_errors: Option<u64>,
    pub dry_run: bool,
    /// Substitute for unconvertible datetimes under `FailureMode::Default`.
    pub default_timestamp: f64,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            progress_save_interval: 100,
            failure_mode: FailureMode::LogAndSkip,
            max_errors: None,
            dry_run: false,
            default_timestamp: 0.0,
        }
    }
}

/// Everything a migration's `up`/`down` needs: the shared client, the
/// registered schemas, the run options, and checkpoint/counter plumbing.
pub struct MigrationContext {
    pub client: RedisClient,
    pub schemas: Vec<Arc<CompiledSchema>>,
    pub options: MigrationOptions,
    migration_id: String,
    stats: Mutex<MigrationStats>,
    since_save: Mutex<u64>,
}

impl MigrationContext {
    pub fn new(
        client: RedisClient,
        schemas: Vec<Arc<CompiledSchema>>,
        options: MigrationOptions,
        migration_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            schemas,
            options,
            migration_id: migration_id.into(),
            stats: Mutex::new(MigrationStats::default()),
            since_save: Mutex::new(0),
        }
    }

    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    pub fn stats(&self) -> MigrationStats {
        self.stats.lock().clone()
    }

    pub fn note_seen(&self) {
        self.stats.lock().seen += 1;
        *self.since_save.lock() += 1;
    }

    pub fn note_ok(&self) {
        self.stats.lock().ok += 1;
        crate::metrics::record_migration_key(&self.migration_id, "ok");
    }

    pub fn note_skipped(&self) {
        self.stats.lock().skipped += 1;
        crate::metrics::record_migration_key(&self.migration_id, "skipped");
    }

    /// Record one conversion failure and apply the failure policy. Returns
    /// an error when the policy (or the error ceiling) demands an abort.
    pub fn note_error(&self, key: &str, field: &str, detail: &str) -> Result<()> {
        let errored = {
            let mut stats = self.stats.lock();
            stats.errored += 1;
            stats.errored
        };
        crate::metrics::record_migration_key(&self.migration_id, "errored");
        match self.options.failure_mode {
            FailureMode::Fail => {
                return Err(OmError::Migration(format!(
                    "migration '{}' failed on {key}.{field}: {detail}",
                    self.migration_id
                )))
            }
            FailureMode::Skip => {}
            FailureMode::LogAndSkip | FailureMode::Default => {
                warn!(
                    migration = %self.migration_id,
                    key, field, detail, "conversion failed"
                );
            }
        }
        if let Some(max) = self.options.max_errors {
            if errored > max {
                return Err(OmError::Migration(format!(
                    "migration '{}' exceeded its error ceiling of {max}",
                    self.migration_id
                )));
            }
        }
        Ok(())
    }

    pub async fn load_progress(&self) -> Result<Option<Progress>> {
        let raw = self
            .client
            .get_string(&progress_key(&self.migration_id))
            .await?;
        match raw {
            Some(text) => match serde_json::from_str::<Progress>(&text) {
                Ok(progress) => Ok(Some(progress)),
                Err(e) => {
                    warn!(migration = %self.migration_id, error = %e, "discarding malformed checkpoint");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Restore counters from a loaded checkpoint.
    pub fn restore_stats(&self, stats: MigrationStats) {
        *self.stats.lock() = stats;
    }

    /// Persist the checkpoint now. Suppressed in dry-run mode.
    pub async fn save_progress(
        &self,
        record: Option<&str>,
        cursor: u64,
        last_key: Option<&str>,
    ) -> Result<()> {
        if self.options.dry_run {
            return Ok(());
        }
        let progress = Progress {
            record: record.map(str::to_string),
            cursor,
            last_key: last_key.map(str::to_string),
            stats: self.stats(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_string(&progress)?;
        self.client
            .set_string(&progress_key(&self.migration_id), &payload)
            .await?;
        *self.since_save.lock() = 0;
        Ok(())
    }

    /// Persist the checkpoint when `progress_save_interval` keys have been
    /// processed since the last save.
    pub async fn maybe_save_progress(
        &self,
        record: Option<&str>,
        cursor: u64,
        last_key: Option<&str>,
    ) -> Result<()> {
        let due = *self.since_save.lock() >= self.options.progress_save_interval;
        if due {
            self.save_progress(record, cursor, last_key).await?;
        }
        Ok(())
    }

    pub async fn clear_progress(&self) -> Result<()> {
        self.client
            .del(&[progress_key(&self.migration_id)])
            .await?;
        Ok(())
    }
}

/// One versioned data transformation.
#[async_trait]
pub trait DataMigration: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;

    /// Ids that must be applied before this migration runs.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Preflight check; a false return skips the migration this run.
    async fn can_run(&self, ctx: &MigrationContext) -> Result<bool> {
        let _ = ctx;
        Ok(true)
    }

    async fn up(&self, ctx: &MigrationContext) -> Result<()>;

    /// Reverse the migration. The default marks it non-reversible.
    async fn down(&self, ctx: &MigrationContext) -> Result<()> {
        let _ = ctx;
        Err(OmError::Migration(format!(
            "migration '{}' is not reversible",
            self.id()
        )))
    }
}

/// Summary of one `run`.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub applied: Vec<String>,
    pub stats: Vec<(String, MigrationStats)>,
    pub dry_run: bool,
}

impl RunReport {
    /// True when at least one value failed to convert (under a tolerant
    /// failure mode) even though the run completed.
    pub fn had_errors(&self) -> bool {
        self.stats.iter().any(|(_, s)| s.errored > 0)
    }
}

#[derive(Debug, Clone)]
pub struct DataStatus {
    pub total: usize,
    pub applied: Vec<String>,
    pub pending: Vec<String>,
}

/// Outcome of `verify`.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub pending: Vec<String>,
    pub drift: Vec<datetime::DriftRecord>,
    /// Count of stored datetime values still in the legacy string form;
    /// only populated when data checking was requested.
    pub legacy_values: Option<u64>,
}

impl VerifyReport {
    pub fn clean(&self) -> bool {
        self.pending.is_empty()
            && self.drift.is_empty()
            && self.legacy_values.unwrap_or(0) == 0
    }
}

/// Discovers, orders, and executes data migrations.
pub struct DataMigrator {
    client: RedisClient,
    schemas: Vec<Arc<CompiledSchema>>,
    options: MigrationOptions,
    migrations: Vec<Arc<dyn DataMigration>>,
}

impl DataMigrator {
    /// A migrator pre-loaded with the built-in datetime transition.
    pub fn new(client: RedisClient, schemas: Vec<Arc<CompiledSchema>>) -> Self {
        let mut migrator = Self::without_builtins(client, schemas);
        migrator.register(Arc::new(datetime::DatetimeTransition));
        migrator
    }

    pub fn without_builtins(client: RedisClient, schemas: Vec<Arc<CompiledSchema>>) -> Self {
        Self {
            client,
            schemas,
            options: MigrationOptions::default(),
            migrations: Vec::new(),
        }
    }

    pub fn set_options(&mut self, options: MigrationOptions) {
        self.options = options;
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    pub fn register(&mut self, migration: Arc<dyn DataMigration>) {
        self.migrations.push(migration);
    }

    pub async fn applied(&self) -> Result<HashSet<String>> {
        Ok(self
            .client
            .smembers(&data_applied_key())
            .await?
            .into_iter()
            .collect())
    }

    fn ordered(&self) -> Result<Vec<Arc<dyn DataMigration>>> {
        topological_order(&self.migrations)
    }

    pub async fn status(&self) -> Result<DataStatus> {
        let applied = self.applied().await?;
        let order = self.ordered()?;
        let pending = order
            .iter()
            .filter(|m| !applied.contains(m.id()))
            .map(|m| m.id().to_string())
            .collect();
        let mut applied: Vec<String> = applied.into_iter().collect();
        applied.sort();
        Ok(DataStatus {
            total: order.len(),
            applied,
            pending,
        })
    }

    /// Run pending migrations in dependency order. A migration failure
    /// aborts the run; earlier migrations stay applied.
    pub async fn run(&self, limit: Option<usize>) -> Result<RunReport> {
        let applied = self.applied().await?;
        let pending: Vec<_> = self
            .ordered()?
            .into_iter()
            .filter(|m| !applied.contains(m.id()))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        let mut report = RunReport {
            dry_run: self.options.dry_run,
            ..RunReport::default()
        };
        for migration in pending {
            let id = migration.id().to_string();
            let ctx = MigrationContext::new(
                self.client.clone(),
                self.schemas.clone(),
                self.options.clone(),
                id.clone(),
            );
            if !migration.can_run(&ctx).await? {
                warn!(migration = %id, "preflight check failed, skipping");
                continue;
            }
            info!(migration = %id, dry_run = self.options.dry_run, "running data migration");
            let start = Instant::now();
            migration.up(&ctx).await.map_err(|e| {
                OmError::Migration(format!("migration '{id}' failed: {e}"))
            })?;
            crate::metrics::record_migration_duration(&id, start.elapsed());
            if !self.options.dry_run {
                self.client.sadd(&data_applied_key(), &id).await?;
                ctx.clear_progress().await?;
            }
            report.stats.push((id.clone(), ctx.stats()));
            report.applied.push(id);
        }
        Ok(report)
    }

    /// Roll back one applied migration via its `down` operation.
    pub async fn rollback(&self, id: &str) -> Result<bool> {
        let Some(migration) = self.migrations.iter().find(|m| m.id() == id).cloned() else {
            return Err(OmError::Migration(format!("migration '{id}' not found")));
        };
        if !self.applied().await?.contains(id) {
            warn!(migration = %id, "migration is not applied; nothing to roll back");
            return Ok(false);
        }
        let ctx = MigrationContext::new(
            self.client.clone(),
            self.schemas.clone(),
            self.options.clone(),
            id,
        );
        migration.down(&ctx).await?;
        self.client.srem(&data_applied_key(), id).await?;
        info!(migration = %id, "rolled back data migration");
        Ok(true)
    }

    pub async fn progress(&self, id: &str) -> Result<Option<Progress>> {
        let raw = self.client.get_string(&progress_key(id)).await?;
        match raw {
            Some(text) => Ok(serde_json::from_str(&text).ok()),
            None => Ok(None),
        }
    }

    pub async fn clear_progress(&self, id: &str) -> Result<()> {
        self.client.del(&[progress_key(id)]).await?;
        Ok(())
    }

    /// Compare server index kinds against expectations and optionally scan
    /// stored data for legacy datetime strings.
    pub async fn verify(&self, check_data: bool) -> Result<VerifyReport> {
        let status = self.status().await?;
        let drift = datetime::check_schema(&self.client, &self.schemas).await?;
        let legacy_values = if check_data {
            Some(
                datetime::count_legacy_values(
                    &self.client,
                    &self.schemas,
                    self.options.batch_size,
                )
                .await?,
            )
        } else {
            None
        };
        Ok(VerifyReport {
            pending: status.pending,
            drift,
            legacy_values,
        })
    }

    /// Write a stub source file for a new data migration unit.
    pub fn create_file(&self, dir: &PathBuf, slug: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .map_err(|e| OmError::Migration(format!("cannot create {}: {e}", dir.display())))?;
        let id = new_migration_id(slug);
        let path = dir.join(format!("{id}.rs"));
        let type_name: String = slug
            .split('_')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect();
        let stub = format!(
            r#"//! Data migration: {slug}

use async_trait::async_trait;
use redis_om::migrate::data::{{DataMigration, MigrationContext}};
use redis_om::OmError;

pub struct {type_name};

#[async_trait]
impl DataMigration for {type_name} {{
    fn id(&self) -> &str {{
        "{id}"
    }}

    fn description(&self) -> &str {{
        "{slug}"
    }}

    async fn up(&self, ctx: &MigrationContext) -> Result<(), OmError> {{
        // Transform keys here; register this type with DataMigrator::register.
        let _ = ctx;
        Ok(())
    }}
}}
"#
        );
        std::fs::write(&path, stub)
            .map_err(|e| OmError::Migration(format!("cannot write {}: {e}", path.display())))?;
        Ok(path)
    }
}

/// Topological order over the dependency DAG (Kahn's algorithm, ties broken
/// by id for determinism). Cycles and unknown dependencies are configuration
/// errors.
fn topological_order(
    migrations: &[Arc<dyn DataMigration>],
) -> Result<Vec<Arc<dyn DataMigration>>> {
    let by_id: HashMap<String, Arc<dyn DataMigration>> = migrations
        .iter()
        .map(|m| (m.id().to_string(), m.clone()))
        .collect();
    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for migration in migrations {
        let id = migration.id().to_string();
        in_degree.entry(id.clone()).or_insert(0);
        for dep in migration.dependencies() {
            if !by_id.contains_key(&dep) {
                return Err(OmError::Migration(format!(
                    "migration '{id}' depends on unknown migration '{dep}'"
                )));
            }
            *in_degree.entry(id.clone()).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(id.clone());
        }
    }
    // Keep `ready` sorted descending so pop() always yields the smallest id.
    let mut ready: Vec<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| id.clone())
        .collect();
    ready.sort_unstable_by(|a, b| b.cmp(a));
    let mut order = Vec::new();
    while let Some(id) = ready.pop() {
        order.push(by_id[&id].clone());
        for dependent in dependents.get(&id).cloned().unwrap_or_default() {
            let degree = in_degree.get_mut(&dependent).expect("known migration");
            *degree -= 1;
            if *degree == 0 {
                ready.push(dependent);
                ready.sort_unstable_by(|a, b| b.cmp(a));
            }
        }
    }
    if order.len() != migrations.len() {
        return Err(OmError::Migration(
            "circular dependency among data migrations".to_string(),
        ));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        id: &'static str,
        deps: Vec<String>,
    }

    #[async_trait]
    impl DataMigration for Fake {
        fn id(&self) -> &str {
            self.id
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }
        async fn up(&self, _ctx: &MigrationContext) -> Result<()> {
            Ok(())
        }
    }

    fn ordered_ids(migrations: Vec<Fake>) -> Result<Vec<String>> {
        let migrations: Vec<Arc<dyn DataMigration>> = migrations
            .into_iter()
            .map(|m| Arc::new(m) as Arc<dyn DataMigration>)
            .collect();
        topological_order(&migrations)
            .map(|order| order.iter().map(|m| m.id().to_string()).collect())
    }

    #[test]
    fn dependencies_order_before_dependents() {
        let ids = ordered_ids(vec![
            Fake {
                id: "002_second",
                deps: vec!["001_first".to_string()],
            },
            Fake {
                id: "001_first",
                deps: vec![],
            },
        ])
        .unwrap();
        assert_eq!(ids, ["001_first", "002_second"]);
    }

    #[test]
    fn independent_migrations_run_in_id_order() {
        let ids = ordered_ids(vec![
            Fake {
                id: "b",
                deps: vec![],
            },
            Fake {
                id: "a",
                deps: vec![],
            },
        ])
        .unwrap();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn cycles_are_fatal() {
        let err = ordered_ids(vec![
            Fake {
                id: "a",
                deps: vec!["b".to_string()],
            },
            Fake {
                id: "b",
                deps: vec!["a".to_string()],
            },
        ])
        .unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn unknown_dependencies_are_fatal() {
        let err = ordered_ids(vec![Fake {
            id: "a",
            deps: vec!["ghost".to_string()],
        }])
        .unwrap_err();
        assert!(err.to_string().contains("unknown migration"));
    }

    #[test]
    fn failure_modes_parse_from_cli_spellings() {
        assert_eq!("fail".parse::<FailureMode>().unwrap(), FailureMode::Fail);
        assert_eq!(
            "log-and-skip".parse::<FailureMode>().unwrap(),
            FailureMode::LogAndSkip
        );
        assert_eq!(
            "DEFAULT".parse::<FailureMode>().unwrap(),
            FailureMode::Default
        );
        assert!("bogus".parse::<FailureMode>().is_err());
    }

    #[test]
    fn run_report_flags_tolerated_errors() {
        let mut report = RunReport::default();
        report.stats.push((
            "001".to_string(),
            MigrationStats {
                seen: 10,
                ok: 8,
                skipped: 1,
                errored: 1,
            },
        ));
        assert!(report.had_errors());
    }
}
