//! Key construction and primary-key allocation.
//!
//! All key shapes live here: record keys, the SCAN pattern covering a record
//! type, the index name, and the key under which the index fingerprint is
//! persisted. Keeping prefix policy in one place decouples it from both the
//! value codec and the index name.
//!
//! Key shapes:
//!
//! ```text
//! {global_prefix}:{model_prefix}:{pk}      record data (Hash or JSON)
//! {global_prefix}:{model_prefix}:index     search index
//! {global_prefix}:{model_prefix}:hash      schema fingerprint
//! ```

use ulid::Ulid;

use crate::schema::RecordMeta;

/// Allocates primary keys locally, without a server round trip.
pub trait PrimaryKeyCreator: Send + Sync {
    fn allocate(&self) -> String;
}

/// Default generator: a 26-character lexicographically sortable identifier
/// derived from the current time plus randomness (ULID, millisecond
/// resolution). Monotonicity within a millisecond is not guaranteed.
#[derive(Debug, Default, Clone, Copy)]
pub struct UlidKeyCreator;

impl PrimaryKeyCreator for UlidKeyCreator {
    fn allocate(&self) -> String {
        Ulid::new().to_string()
    }
}

/// Builds every key shape for one record type.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    global_prefix: String,
    model_prefix: String,
    primary_key_pattern: String,
    index_name: String,
}

impl KeyCodec {
    pub fn new(meta: &RecordMeta) -> Self {
        let index_name = meta.index_name.clone().unwrap_or_else(|| {
            join_parts(&[&meta.global_key_prefix, &meta.model_key_prefix, "index"])
        });
        Self {
            global_prefix: meta.global_key_prefix.clone(),
            model_prefix: meta.model_key_prefix.clone(),
            primary_key_pattern: meta.primary_key_pattern.clone(),
            index_name,
        }
    }

    /// Key holding the record with the given primary key.
    pub fn key(&self, pk: &str) -> String {
        let tail = self.primary_key_pattern.replace("{pk}", pk);
        join_parts(&[&self.global_prefix, &self.model_prefix, &tail])
    }

    /// The prefix shared by every record of this type. This is what the
    /// index's `PREFIX 1` clause covers.
    pub fn key_prefix(&self) -> String {
        let mut prefix = join_parts(&[&self.global_prefix, &self.model_prefix]);
        prefix.push(':');
        prefix
    }

    /// SCAN pattern matching every record of this type.
    pub fn all_keys_pattern(&self) -> String {
        format!("{}*", self.key_prefix())
    }

    /// Strip the record prefix from a full key, recovering the primary key.
    pub fn primary_key_of<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.key_prefix()).unwrap_or(key)
    }

    /// Name of the search index covering this record type.
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Key under which the index-definition fingerprint is stored.
    pub fn schema_hash_key(&self) -> String {
        join_parts(&[&self.global_prefix, &self.model_prefix, "hash"])
    }
}

/// Join non-empty parts with `:`. An empty global prefix does not produce a
/// leading colon.
fn join_parts(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RecordMeta;

    fn meta() -> RecordMeta {
        RecordMeta {
            global_key_prefix: "app".into(),
            model_key_prefix: "customer".into(),
            ..RecordMeta::new("customer")
        }
    }

    #[test]
    fn key_shapes() {
        let keys = KeyCodec::new(&meta());
        assert_eq!(keys.key("01H"), "app:customer:01H");
        assert_eq!(keys.key_prefix(), "app:customer:");
        assert_eq!(keys.all_keys_pattern(), "app:customer:*");
        assert_eq!(keys.index_name(), "app:customer:index");
        assert_eq!(keys.schema_hash_key(), "app:customer:hash");
    }

    #[test]
    fn empty_global_prefix_has_no_leading_colon() {
        let meta = RecordMeta::new("customer");
        let keys = KeyCodec::new(&meta);
        assert_eq!(keys.key("1"), "customer:1");
        assert_eq!(keys.index_name(), "customer:index");
    }

    #[test]
    fn index_name_override() {
        let mut m = meta();
        m.index_name = Some("custom-index".into());
        let keys = KeyCodec::new(&m);
        assert_eq!(keys.index_name(), "custom-index");
        // The fingerprint key is independent of the index name override.
        assert_eq!(keys.schema_hash_key(), "app:customer:hash");
    }

    #[test]
    fn primary_key_round_trip() {
        let keys = KeyCodec::new(&meta());
        let pk = UlidKeyCreator.allocate();
        assert_eq!(pk.len(), 26);
        assert_eq!(keys.primary_key_of(&keys.key(&pk)), pk);
    }

    #[test]
    fn ulid_keys_sort_by_allocation_time() {
        let a = UlidKeyCreator.allocate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = UlidKeyCreator.allocate();
        assert!(a < b);
    }
}
