// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query expression tree.
//!
//! A query starts from a [`Field`] proxy resolved against a compiled
//! schema. Leaf constructors build comparisons; `&`, `|` and `!` combine
//! them:
//!
//! ```ignore
//! let q = !(first_name.eq("Andrew"))
//!     & (last_name.eq("Brookins") | last_name.eq("Smith"));
//! ```
//!
//! Resolving a proxy checks that the field exists and is indexed, so a typo
//! fails before any server round trip. Operator/kind compatibility is
//! checked when the tree is lowered.

use chrono::{DateTime, NaiveDate, Utc};

use crate::codec::{date_to_timestamp, datetime_to_timestamp, pack_f32};
use crate::error::{OmError, Result};
use crate::schema::compiler::{CompiledSchema, FieldKind};
use crate::schema::{VectorType, DEFAULT_SEPARATOR};

/// What the translator needs to know about a field, captured at proxy
/// resolution so the tree is self-contained.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub query_name: String,
    pub kind: FieldKind,
    pub multi_value: bool,
    pub separator: char,
    pub vector_dtype: Option<VectorType>,
}

/// A field proxy bound to one record type's compiled schema.
#[derive(Debug, Clone)]
pub struct Field {
    r: FieldRef,
}

impl Field {
    /// Resolve a proxy by query name (`address_city`) or dotted path
    /// (`address.city`). Unknown or unindexed fields are rejected here.
    pub fn resolve(schema: &CompiledSchema, reference: &str) -> Result<Self> {
        let field = schema.resolve(reference).ok_or_else(|| {
            OmError::Query(format!(
                "field '{}' does not exist on record '{}' or is not indexed",
                reference, schema.record
            ))
        })?;
        Ok(Self {
            r: FieldRef {
                query_name: field.query_name.clone(),
                kind: field.kind,
                multi_value: field.multi_value,
                separator: field.separator.unwrap_or(DEFAULT_SEPARATOR),
                vector_dtype: field.vector.as_ref().map(|v| v.dtype),
            },
        })
    }

    pub fn query_name(&self) -> &str {
        &self.r.query_name
    }

    fn compare(&self, op: CompareOp, value: impl Into<QueryValue>) -> Expr {
        Expr::Compare {
            field: self.r.clone(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(&self, value: impl Into<QueryValue>) -> Expr {
        self.compare(CompareOp::Eq, value)
    }

    pub fn ne(&self, value: impl Into<QueryValue>) -> Expr {
        self.compare(CompareOp::Ne, value)
    }

    pub fn lt(&self, value: impl Into<QueryValue>) -> Expr {
        self.compare(CompareOp::Lt, value)
    }

    pub fn le(&self, value: impl Into<QueryValue>) -> Expr {
        self.compare(CompareOp::Le, value)
    }

    pub fn gt(&self, value: impl Into<QueryValue>) -> Expr {
        self.compare(CompareOp::Gt, value)
    }

    pub fn ge(&self, value: impl Into<QueryValue>) -> Expr {
        self.compare(CompareOp::Ge, value)
    }

    /// Stemmed full-text match. The field must be declared
    /// `full_text_search`.
    pub fn matches(&self, text: impl Into<String>) -> Expr {
        self.compare(CompareOp::Like, QueryValue::Str(text.into()))
    }

    /// Containment: the field (a list) holds any of the given values.
    pub fn any_of<I, S>(&self, values: I) -> Expr
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compare(
            CompareOp::In,
            QueryValue::StrList(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Non-containment: the field (a list) holds none of the given values.
    pub fn none_of<I, S>(&self, values: I) -> Expr
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compare(
            CompareOp::NotIn,
            QueryValue::StrList(values.into_iter().map(Into::into).collect()),
        )
    }

    /// K-nearest-neighbor leaf over a vector field. The reference vector is
    /// packed to the field's declared element width.
    pub fn knn(&self, k: usize, reference: &[f32]) -> Expr {
        let vector = match self.r.vector_dtype {
            Some(VectorType::Float64) => reference
                .iter()
                .flat_map(|v| f64::from(*v).to_le_bytes())
                .collect(),
            _ => pack_f32(reference),
        };
        Expr::Knn {
            field: self.r.clone(),
            k,
            vector,
        }
    }

    /// KNN with a caller-packed byte blob (for float64 reference vectors).
    pub fn knn_bytes(&self, k: usize, vector: Vec<u8>) -> Expr {
        Expr::Knn {
            field: self.r.clone(),
            k,
            vector,
        }
    }

    /// Geo-radius leaf over a GEO field.
    pub fn within(&self, longitude: f64, latitude: f64, radius: f64, unit: GeoUnit) -> Expr {
        Expr::GeoWithin {
            field: self.r.clone(),
            longitude,
            latitude,
            radius,
            unit,
        }
    }
}

/// Leaf comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Stemmed full-text match (`%`).
    Like,
    /// Containment (`<<`).
    In,
    /// Non-containment (`>>`).
    NotIn,
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "%",
            CompareOp::In => "<<",
            CompareOp::NotIn => ">>",
        };
        write!(f, "{symbol}")
    }
}

/// Radius unit for geo queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoUnit {
    Meters,
    Kilometers,
    Miles,
    Feet,
}

impl std::fmt::Display for GeoUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeoUnit::Meters => write!(f, "m"),
            GeoUnit::Kilometers => write!(f, "km"),
            GeoUnit::Miles => write!(f, "mi"),
            GeoUnit::Feet => write!(f, "ft"),
        }
    }
}

/// A comparison value.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Str(String),
    Num(f64),
    Bool(bool),
    StrList(Vec<String>),
}

impl std::fmt::Display for QueryValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryValue::Str(s) => write!(f, "{s:?}"),
            QueryValue::Num(n) => write!(f, "{}", crate::codec::format_f64(*n)),
            QueryValue::Bool(b) => write!(f, "{b}"),
            QueryValue::StrList(items) => write!(f, "{items:?}"),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(v: &str) -> Self {
        QueryValue::Str(v.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(v: String) -> Self {
        QueryValue::Str(v)
    }
}

impl From<i64> for QueryValue {
    fn from(v: i64) -> Self {
        QueryValue::Num(v as f64)
    }
}

impl From<i32> for QueryValue {
    fn from(v: i32) -> Self {
        QueryValue::Num(f64::from(v))
    }
}

impl From<f64> for QueryValue {
    fn from(v: f64) -> Self {
        QueryValue::Num(v)
    }
}

impl From<bool> for QueryValue {
    fn from(v: bool) -> Self {
        QueryValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for QueryValue {
    fn from(v: DateTime<Utc>) -> Self {
        QueryValue::Num(datetime_to_timestamp(&v))
    }
}

impl From<NaiveDate> for QueryValue {
    fn from(v: NaiveDate) -> Self {
        QueryValue::Num(date_to_timestamp(&v))
    }
}

impl From<Vec<String>> for QueryValue {
    fn from(v: Vec<String>) -> Self {
        QueryValue::StrList(v)
    }
}

/// The query expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Matches every record (`*`).
    All,
    Compare {
        field: FieldRef,
        op: CompareOp,
        value: QueryValue,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Knn {
        field: FieldRef,
        k: usize,
        vector: Vec<u8>,
    },
    GeoWithin {
        field: FieldRef,
        longitude: f64,
        latitude: f64,
        radius: f64,
        unit: GeoUnit,
    },
}

impl Expr {
    /// AND-combine a sequence of expressions; an empty sequence matches
    /// everything.
    pub fn all_of(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        exprs
            .into_iter()
            .reduce(|acc, e| acc & e)
            .unwrap_or(Expr::All)
    }

    pub fn contains_knn(&self) -> bool {
        match self {
            Expr::Knn { .. } => true,
            Expr::And(a, b) | Expr::Or(a, b) => a.contains_knn() || b.contains_knn(),
            Expr::Not(inner) => inner.contains_knn(),
            _ => false,
        }
    }

    /// Deterministic ASCII rendering for diagnostics.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        render(self, "", "", &mut out);
        out
    }
}

fn label(expr: &Expr) -> String {
    match expr {
        Expr::All => "ALL".to_string(),
        Expr::Compare { field, op, value } => {
            format!("{} {} {}", field.query_name, op, value)
        }
        Expr::And(..) => "AND".to_string(),
        Expr::Or(..) => "OR".to_string(),
        Expr::Not(..) => "NOT".to_string(),
        Expr::Knn { field, k, .. } => format!("KNN k={k} @{}", field.query_name),
        Expr::GeoWithin {
            field,
            longitude,
            latitude,
            radius,
            unit,
        } => format!(
            "GEO @{} within {radius}{unit} of ({longitude},{latitude})",
            field.query_name
        ),
    }
}

fn render(expr: &Expr, prefix: &str, child_prefix: &str, out: &mut String) {
    out.push_str(prefix);
    out.push_str(&label(expr));
    out.push('\n');
    let children: Vec<&Expr> = match expr {
        Expr::And(a, b) | Expr::Or(a, b) => vec![a, b],
        Expr::Not(inner) => vec![inner],
        _ => vec![],
    };
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        let (branch, next) = if last {
            ("└── ", "    ")
        } else {
            ("├── ", "│   ")
        };
        render(
            child,
            &format!("{child_prefix}{branch}"),
            &format!("{child_prefix}{next}"),
            out,
        );
    }
}

impl std::ops::BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(rhs))
    }
}

impl std::ops::BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(rhs))
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    /// Negation; a double negation collapses back to the inner tree.
    fn not(self) -> Expr {
        match self {
            Expr::Not(inner) => *inner,
            other => Expr::Not(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::compiler::CompiledSchema;
    use crate::schema::{FieldDef, RecordSchema};
    use std::sync::Arc;

    fn schema() -> Arc<CompiledSchema> {
        let address = RecordSchema::json("address")
            .embedded()
            .field(FieldDef::str("city").indexed())
            .build();
        CompiledSchema::compile(
            &RecordSchema::json("customer")
                .field(FieldDef::str("pk").primary_key())
                .field(FieldDef::str("first_name").indexed())
                .field(FieldDef::str("last_name").indexed())
                .field(FieldDef::int("age").indexed().sortable())
                .field(FieldDef::str("bio").indexed().full_text_search())
                .field(FieldDef::embedded("address", address))
                .field(FieldDef::str("hidden").unindexed())
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn resolving_unknown_or_unindexed_field_fails() {
        let schema = schema();
        assert!(Field::resolve(&schema, "no_such_field").is_err());
        assert!(Field::resolve(&schema, "hidden").is_err());
        assert!(Field::resolve(&schema, "last_name").is_ok());
    }

    #[test]
    fn dotted_paths_resolve_to_flattened_names() {
        let schema = schema();
        let city = Field::resolve(&schema, "address.city").unwrap();
        assert_eq!(city.query_name(), "address_city");
    }

    #[test]
    fn double_negation_collapses() {
        let schema = schema();
        let age = Field::resolve(&schema, "age").unwrap();
        let expr = age.gt(30);
        assert_eq!(!!expr.clone(), expr);
    }

    #[test]
    fn combinators_build_the_expected_shape() {
        let schema = schema();
        let first = Field::resolve(&schema, "first_name").unwrap();
        let last = Field::resolve(&schema, "last_name").unwrap();
        let expr = !(first.eq("Andrew")) & (last.eq("Brookins") | last.eq("Smith"));
        match expr {
            Expr::And(lhs, rhs) => {
                assert!(matches!(*lhs, Expr::Not(_)));
                assert!(matches!(*rhs, Expr::Or(..)));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn datetime_values_become_timestamps() {
        use chrono::TimeZone;
        let schema = schema();
        let age = Field::resolve(&schema, "age").unwrap();
        let t = chrono::Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        match age.gt(t) {
            Expr::Compare {
                value: QueryValue::Num(n),
                ..
            } => assert_eq!(n, 1672531200.0),
            other => panic!("expected numeric compare, got {other:?}"),
        }
    }

    #[test]
    fn tree_rendering_is_deterministic() {
        let schema = schema();
        let first = Field::resolve(&schema, "first_name").unwrap();
        let age = Field::resolve(&schema, "age").unwrap();
        let expr = !(first.eq("Andrew")) & age.ge(21);
        let expected = "\
AND
├── NOT
│   └── first_name == \"Andrew\"
└── age >= 21
";
        assert_eq!(expr.render_tree(), expected);
        assert_eq!(expr.render_tree(), expr.render_tree());
    }

    #[test]
    fn all_of_reduces_and_defaults_to_all() {
        let schema = schema();
        let age = Field::resolve(&schema, "age").unwrap();
        assert_eq!(Expr::all_of([]), Expr::All);
        let combined = Expr::all_of([age.ge(21), age.lt(65)]);
        assert!(matches!(combined, Expr::And(..)));
    }
}
