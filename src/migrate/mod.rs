// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned migrations.
//!
//! Two engines share this module:
//!
//! - [`schema::SchemaMigrator`] — file-based index migrations. Snapshot
//!   files under `<migrations_dir>/schema-migrations/` carry full index
//!   definitions in both directions, so `run` and `rollback` never depend
//!   on the code that generated them.
//! - [`data::DataMigrator`] — versioned data transformations with a
//!   dependency DAG, batched key iteration, progress checkpointing, and a
//!   bounded error policy. The built-in [`datetime::DatetimeTransition`]
//!   rewrites ISO-8601 datetime strings into numeric timestamps.
//!
//! Server-side bookkeeping lives under the reserved `redis_om` prefix:
//! applied sets and per-migration progress keys.

pub mod data;
pub mod datetime;
pub mod schema;

use chrono::Utc;

use crate::config::RESERVED_PREFIX;

/// Set of applied schema-migration ids.
pub fn schema_applied_key() -> String {
    format!("{RESERVED_PREFIX}:migrations:schema-applied")
}

/// Set of applied data-migration ids.
pub fn data_applied_key() -> String {
    format!("{RESERVED_PREFIX}:migrations:applied")
}

/// Per-migration progress checkpoint key.
pub fn progress_key(migration_id: &str) -> String {
    format!("{RESERVED_PREFIX}:migrations:progress:{migration_id}")
}

/// Monotonically orderable migration id: timestamp plus slug.
pub fn new_migration_id(slug: &str) -> String {
    format!("{}_{slug}", Utc::now().format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_live_under_the_library_prefix() {
        assert_eq!(data_applied_key(), "redis_om:migrations:applied");
        assert_eq!(
            progress_key("001_x"),
            "redis_om:migrations:progress:001_x"
        );
    }

    #[test]
    fn migration_ids_order_by_creation_time() {
        let id = new_migration_id("add_age_index");
        assert!(id.ends_with("_add_age_index"));
        // yyyymmdd_hhmmss prefix
        assert_eq!(id.split('_').next().unwrap().len(), 8);
    }
}
