//! Property-based tests for the mapping core.
//!
//! Everything here runs offline: codec round trips, datetime format
//! tolerance, fingerprint determinism, tag escaping, and query lowering.
//!
//! Run with: `cargo test --test proptest_fuzz`

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};

use redis_om::codec::{
    datetime_to_timestamp, decode_hash, decode_json, encode_hash, encode_json,
    parse_datetime_flexible, timestamp_to_datetime,
};
use redis_om::index;
use redis_om::query::translate::escape_tag;
use redis_om::schema::compiler::CompiledSchema;
use redis_om::schema::{
    DistanceMetric, FieldDef, RecordSchema, VectorOptions, VectorType,
};
use redis_om::UlidKeyCreator;

// =============================================================================
// Strategies
// =============================================================================

/// Timestamps with microsecond precision across several decades of epochs.
fn datetime_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..2_000_000_000, 0u32..1_000_000).prop_map(|(secs, micros)| {
        DateTime::<Utc>::from_timestamp(secs, micros * 1000).expect("in range")
    })
}

/// Tag-safe strings: anything printable except the separator.
fn tag_string_strategy() -> impl Strategy<Value = String> {
    "[ -{}~]{0,24}".prop_map(|s| s.replace('|', "_"))
}

fn flat_schema() -> RecordSchema {
    RecordSchema::hash("prop_customer")
        .field(FieldDef::str("pk").primary_key())
        .field(FieldDef::str("last_name").indexed())
        .field(FieldDef::int("age").indexed().sortable())
        .field(FieldDef::float("score"))
        .field(FieldDef::boolean("active").indexed())
        .field(FieldDef::datetime("joined_at").indexed())
        .field(FieldDef::str("nickname").optional())
        .build()
}

fn doc_schema() -> RecordSchema {
    let address = RecordSchema::json("prop_address")
        .embedded()
        .field(FieldDef::str("city").indexed())
        .field(FieldDef::datetime("moved_in").indexed())
        .build();
    RecordSchema::json("prop_doc_customer")
        .field(FieldDef::str("pk").primary_key())
        .field(FieldDef::boolean("active").indexed())
        .field(FieldDef::datetime("joined_at").indexed())
        .field(FieldDef::embedded("address", address))
        .field(FieldDef::list_of_str("tags").indexed())
        .field(FieldDef::vector(
            "embedding",
            VectorOptions::flat(4, VectorType::Float32, DistanceMetric::Cosine),
        ))
        .build()
}

fn rfc3339_micros(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

// =============================================================================
// Codec round trips
// =============================================================================

proptest! {
    /// Hash layout: decode(encode(v)) preserves every field value.
    #[test]
    fn hash_codec_round_trips(
        last_name in tag_string_strategy(),
        age in any::<i32>(),
        score in -1.0e12f64..1.0e12,
        active in any::<bool>(),
        joined_at in datetime_strategy(),
        nickname in prop::option::of("[a-z]{1,10}"),
    ) {
        let schema = flat_schema();
        let record = json!({
            "pk": "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "last_name": last_name,
            "age": age,
            "score": score,
            "active": active,
            "joined_at": rfc3339_micros(&joined_at),
            "nickname": nickname,
        });
        let pairs = encode_hash(&schema, &record).unwrap();
        let raw: Vec<(Vec<u8>, Vec<u8>)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into_bytes(), v))
            .collect();
        let decoded = decode_hash(&schema, &raw).unwrap();
        prop_assert_eq!(&decoded, &record);
    }

    /// Document layout: decode(encode(v)) preserves nesting, lists, and
    /// vectors.
    #[test]
    fn json_codec_round_trips(
        city in tag_string_strategy(),
        active in any::<bool>(),
        joined_at in datetime_strategy(),
        moved_in in datetime_strategy(),
        tags in prop::collection::vec("[a-z]{1,8}", 0..5),
        embedding in prop::collection::vec(prop::num::f32::NORMAL, 4),
    ) {
        let schema = doc_schema();
        let record = json!({
            "pk": "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "active": active,
            "joined_at": rfc3339_micros(&joined_at),
            "address": {"city": city, "moved_in": rfc3339_micros(&moved_in)},
            "tags": tags,
            "embedding": embedding,
        });
        let stored = encode_json(&schema, &record).unwrap();
        // The stored form is fully transformed
        prop_assert!(stored["joined_at"].is_number());
        prop_assert!(stored["active"].is_number());
        prop_assert!(stored["embedding"].is_string());
        let decoded = decode_json(&schema, &stored).unwrap();
        prop_assert_eq!(&decoded, &record);
    }

    /// The two datetime wire forms decode to the same instant, within the
    /// codec's microsecond resolution.
    #[test]
    fn datetime_forms_decode_identically(dt in datetime_strategy()) {
        let iso = Value::String(dt.to_rfc3339());
        let numeric = json!(datetime_to_timestamp(&dt));
        let from_iso = parse_datetime_flexible(&iso).unwrap();
        let from_numeric = parse_datetime_flexible(&numeric).unwrap();
        let delta = (from_iso.timestamp_micros() - from_numeric.timestamp_micros()).abs();
        prop_assert!(delta <= 1, "iso and numeric forms diverged by {delta}us");
        prop_assert_eq!(from_iso, dt);
    }

    /// Numeric timestamps survive a full encode/decode cycle exactly.
    #[test]
    fn timestamp_round_trip_is_exact(dt in datetime_strategy()) {
        let ts = datetime_to_timestamp(&dt);
        prop_assert_eq!(timestamp_to_datetime(ts).unwrap(), dt);
    }
}

// =============================================================================
// Escaping
// =============================================================================

proptest! {
    /// Every special character is escaped; stripping the escapes restores
    /// the input.
    #[test]
    fn tag_escaping_is_reversible(value in "[ -~]{0,40}") {
        let escaped = escape_tag(&value);
        // No special character survives unescaped
        let mut chars = escaped.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' {
                chars.next();
                continue;
            }
            prop_assert!(
                !",.<>{}[]\"':;!@#$%^&*()-+=~/ ".contains(c),
                "unescaped special character {c:?} in {escaped:?}"
            );
        }
        // Unescaping restores the original
        let mut restored = String::new();
        let mut chars = escaped.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    restored.push(next);
                }
            } else {
                restored.push(c);
            }
        }
        prop_assert_eq!(restored, value);
    }
}

// =============================================================================
// Fingerprints
// =============================================================================

proptest! {
    /// Compiling the same declaration repeatedly yields one fingerprint,
    /// and field order never matters.
    #[test]
    fn fingerprint_is_deterministic(seed in 0usize..6) {
        let compiled_a = CompiledSchema::compile(&flat_schema()).unwrap();
        let compiled_b = CompiledSchema::compile(&flat_schema()).unwrap();
        let a = index::fingerprint(compiled_a.layout, &compiled_a.key_prefix, &compiled_a.fields);
        let b = index::fingerprint(compiled_b.layout, &compiled_b.key_prefix, &compiled_b.fields);
        prop_assert_eq!(&a, &b);

        let mut rotated = compiled_a.fields.clone();
        let rotated_len = rotated.len().max(1);
        rotated.rotate_left(seed % rotated_len);
        let c = index::fingerprint(compiled_a.layout, &compiled_a.key_prefix, &rotated);
        prop_assert_eq!(&a, &c);
    }
}

// =============================================================================
// Primary keys
// =============================================================================

#[test]
fn generated_keys_are_sortable_and_unique() {
    use redis_om::PrimaryKeyCreator;
    let creator = UlidKeyCreator;
    let mut keys: Vec<String> = Vec::new();
    for _ in 0..256 {
        keys.push(creator.allocate());
    }
    let mut sorted = keys.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 256, "collision among generated keys");
    assert!(keys.iter().all(|k| k.len() == 26));
}

// =============================================================================
// Query lowering under reassociation
// =============================================================================

proptest! {
    /// AND-reassociated trees lower to queries holding exactly the same
    /// clauses (the server evaluates them identically).
    #[test]
    fn and_reassociation_preserves_clauses(age in 0i64..200, name in "[A-Za-z]{1,12}") {
        use redis_om::query::translate::translate;

        let schema = CompiledSchema::compile(&flat_schema()).unwrap();
        let last_name = redis_om::Field::resolve(&schema, "last_name").unwrap();
        let age_field = redis_om::Field::resolve(&schema, "age").unwrap();
        let active = redis_om::Field::resolve(&schema, "active").unwrap();

        let left = (last_name.eq(name.as_str()) & age_field.ge(age)) & active.eq(true);
        let right = last_name.eq(name.as_str()) & (age_field.ge(age) & active.eq(true));

        let a = translate(&left).unwrap().query;
        let b = translate(&right).unwrap().query;
        for clause in [
            format!("@age:[{age} +inf]"),
            "@active:{1}".to_string(),
        ] {
            prop_assert!(a.contains(&clause) && b.contains(&clause), "missing {clause}");
        }
    }
}
