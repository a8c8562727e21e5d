//! # Redis OM
//!
//! Object mapping for Redis Stack: typed record schemas, automatic search
//! index lifecycle, a fluent query DSL, and versioned migrations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Record Declaration                      │
//! │  • RecordSchema builder: fields, index options, meta        │
//! │  • Compiled eagerly at registration (schema errors here)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Mapping Layer                          │
//! │  • Keys: prefixes, ULID primary keys, index names           │
//! │  • Codec: Hash strings / JSON documents, datetime numbers   │
//! │  • Index: FT.CREATE synthesis + SHA-256 fingerprints        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Query Layer                           │
//! │  • Expr trees via field proxies and &, |, ! operators       │
//! │  • Lowering to FT.SEARCH with escaping, KNN, geo            │
//! │  • FindQuery: all/first/count/page/update/delete/projection │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Migration Layer                         │
//! │  • Schema: fingerprint drift → JSON snapshot files          │
//! │  • Data: dependency DAG, checkpoints, datetime transition   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redis_om::schema::{FieldDef, Record, RecordSchema};
//! use redis_om::Om;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Customer {
//!     #[serde(default)]
//!     pk: String,
//!     first_name: String,
//!     last_name: String,
//!     age: i64,
//! }
//!
//! impl Record for Customer {
//!     fn schema() -> RecordSchema {
//!         RecordSchema::hash("customer")
//!             .field(FieldDef::str("pk").primary_key())
//!             .field(FieldDef::str("first_name"))
//!             .field(FieldDef::str("last_name").indexed())
//!             .field(FieldDef::int("age").indexed().sortable())
//!             .build()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), redis_om::OmError> {
//!     let om = Om::connect().await?;
//!     let customers = om.repository::<Customer>()?;
//!     customers.create_index().await?;
//!
//!     let pk = customers
//!         .save(&Customer {
//!             pk: String::new(),
//!             first_name: "Andrew".into(),
//!             last_name: "Brookins".into(),
//!             age: 38,
//!         })
//!         .await?;
//!
//!     let found = customers
//!         .find([customers.field("last_name")?.eq("Brookins")])
//!         .sort_by(&["-age"])?
//!         .first()
//!         .await?;
//!     assert_eq!(found.pk, pk);
//!     Ok(())
//! }
//! ```
//!
//! ## Storage Layouts
//!
//! - **Flat** ([`schema::RecordSchema::hash`]): one Redis Hash per record,
//!   scalar fields only.
//! - **Document** ([`schema::RecordSchema::json`]): one RedisJSON document
//!   per record, with embedded records, lists, and optionals. Indexable
//!   fields of embedded records are unfolded into the parent's index under
//!   flattened names (`address.city` → `address_city`).
//!
//! ## Modules
//!
//! - [`schema`]: record declaration and the index compiler
//! - [`repo`]: the [`Om`] client and typed [`repo::Repo`] handles
//! - [`query`]: expression trees, lowering, and execution
//! - [`index`]: FT.CREATE synthesis and fingerprints
//! - [`codec`]: value encoding for both layouts
//! - [`migrate`]: schema and data migration engines
//! - [`cli`]: the embeddable `om migrate` / `om migrate-data` surface

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod keys;
pub mod metrics;
pub mod migrate;
pub mod query;
pub mod repo;
pub mod schema;
pub mod storage;

pub use codec::GeoPoint;
pub use config::OmConfig;
pub use error::{OmError, Result};
pub use keys::{PrimaryKeyCreator, UlidKeyCreator};
pub use query::expr::{Expr, Field, GeoUnit};
pub use query::find::{FindQuery, PartialRecord};
pub use repo::{Om, Repo};
pub use schema::{
    DistanceMetric, FieldDef, FieldType, Record, RecordSchema, StorageLayout, VectorAlgorithm,
    VectorOptions, VectorType,
};
pub use storage::RedisClient;
