// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query lowering: expression trees to the server's search grammar.
//!
//! ```text
//! @field:{tag}                  TAG equality
//! @field:(text)                 TEXT phrase / stemmed match
//! @field:[min max]              NUMERIC range, ( for exclusive bounds
//! @field:{a|b|c}                containment
//! @field:[lon lat radius unit]  geo radius
//! -clause                       negation
//! a b / (a | b)                 AND / OR
//! (filter)=>[KNN k @vec $BLOB AS __vec_score]
//! ```
//!
//! Tag values are escaped per the engine's tokenization rules; spaces split
//! tag terms unless escaped.

use crate::codec::format_f64;
use crate::error::{OmError, Result};
use crate::query::expr::{CompareOp, Expr, FieldRef, QueryValue};
use crate::query::VECTOR_SCORE_ALIAS;
use crate::schema::compiler::FieldKind;

/// Characters the engine treats specially inside tag and text terms. The
/// backslash itself must be escaped too, or escaped output is ambiguous.
const ESCAPED_CHARS: &[char] = &[
    ',', '.', '<', '>', '{', '}', '[', ']', '"', '\'', ':', ';', '!', '@', '#', '$', '%', '^',
    '&', '*', '(', ')', '-', '+', '=', '~', '/', '\\',
];

/// Escape punctuation and spaces for a single tag term.
pub fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ' ' || ESCAPED_CHARS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape punctuation but keep spaces (phrase matching on TEXT fields).
fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if ESCAPED_CHARS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// A lowered query: the query string plus any binary parameters.
#[derive(Debug, Clone)]
pub struct Translated {
    pub query: String,
    pub params: Vec<(String, Vec<u8>)>,
    /// Set when the tree held a KNN leaf; carries `k`.
    pub knn_k: Option<usize>,
}

/// Lower an expression tree into the search grammar.
pub fn translate(expr: &Expr) -> Result<Translated> {
    let (knn, filter) = split_knn(expr)?;
    let filter_query = match &filter {
        Some(expr) => lower(expr)?,
        None => "*".to_string(),
    };

    match knn {
        None => Ok(Translated {
            query: filter_query,
            params: Vec::new(),
            knn_k: None,
        }),
        Some((field, k, vector)) => {
            if field.kind != FieldKind::Vector {
                return Err(OmError::Query(format!(
                    "field '{}' is not a vector field",
                    field.query_name
                )));
            }
            // Always parenthesize the filter so an OR filter binds to the
            // whole KNN clause, not its last term.
            let query = format!(
                "({filter_query})=>[KNN {k} @{} $BLOB AS {VECTOR_SCORE_ALIAS}]",
                field.query_name
            );
            Ok(Translated {
                query,
                params: vec![("BLOB".to_string(), vector)],
                knn_k: Some(k),
            })
        }
    }
}

type KnnLeaf = (FieldRef, usize, Vec<u8>);

/// Pull the (single) KNN leaf out of a tree. KNN may stand alone or be
/// AND-combined with a filter; anything else is malformed.
fn split_knn(expr: &Expr) -> Result<(Option<KnnLeaf>, Option<Expr>)> {
    match expr {
        Expr::Knn { field, k, vector } => Ok((Some((field.clone(), *k, vector.clone())), None)),
        Expr::And(a, b) => {
            let (ka, ra) = split_knn(a)?;
            let (kb, rb) = split_knn(b)?;
            if ka.is_some() && kb.is_some() {
                return Err(OmError::Query(
                    "a query may hold at most one KNN leaf".to_string(),
                ));
            }
            let rest = match (ra, rb) {
                (Some(a), Some(b)) => Some(Expr::And(Box::new(a), Box::new(b))),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
            Ok((ka.or(kb), rest))
        }
        Expr::Or(..) | Expr::Not(..) if expr.contains_knn() => Err(OmError::Query(
            "a KNN leaf can only be combined with AND".to_string(),
        )),
        other => Ok((None, Some(other.clone()))),
    }
}

fn lower(expr: &Expr) -> Result<String> {
    match expr {
        Expr::All => Ok("*".to_string()),
        Expr::Compare { field, op, value } => lower_compare(field, *op, value),
        Expr::And(a, b) => Ok(format!("({} {})", lower(a)?, lower(b)?)),
        Expr::Or(a, b) => Ok(format!("({} | {})", lower(a)?, lower(b)?)),
        Expr::Not(inner) => {
            if matches!(**inner, Expr::All) {
                return Err(OmError::Query(
                    "cannot negate a query for all records".to_string(),
                ));
            }
            Ok(format!("-({})", lower(inner)?))
        }
        Expr::GeoWithin {
            field,
            longitude,
            latitude,
            radius,
            unit,
        } => {
            if field.kind != FieldKind::Geo {
                return Err(OmError::Query(format!(
                    "field '{}' is not a geo field",
                    field.query_name
                )));
            }
            Ok(format!(
                "@{}:[{} {} {} {}]",
                field.query_name,
                format_f64(*longitude),
                format_f64(*latitude),
                format_f64(*radius),
                unit
            ))
        }
        Expr::Knn { .. } => Err(OmError::Query(
            "KNN leaves must sit at the top of the query".to_string(),
        )),
    }
}

fn lower_compare(field: &FieldRef, op: CompareOp, value: &QueryValue) -> Result<String> {
    match field.kind {
        FieldKind::Text => lower_text(field, op, value),
        FieldKind::Numeric => lower_numeric(field, op, value),
        FieldKind::Tag => lower_tag(field, op, value),
        FieldKind::Geo => Err(OmError::Query(format!(
            "geo field '{}' is queried with within(), not comparison operators",
            field.query_name
        ))),
        FieldKind::Vector => Err(OmError::Query(format!(
            "vector field '{}' accepts only KNN expressions",
            field.query_name
        ))),
    }
}

fn lower_text(field: &FieldRef, op: CompareOp, value: &QueryValue) -> Result<String> {
    let QueryValue::Str(text) = value else {
        return Err(OmError::Query(format!(
            "full-text field '{}' compares against strings",
            field.query_name
        )));
    };
    let term = escape_text(&text.to_lowercase());
    match op {
        CompareOp::Eq => Ok(format!("@{}:({term})", field.query_name)),
        CompareOp::Ne => Ok(format!("-@{}:({term})", field.query_name)),
        CompareOp::Like => Ok(format!("@{}:({term})", field.query_name)),
        _ => Err(OmError::Query(format!(
            "full-text field '{}' supports only equality, inequality, and text match",
            field.query_name
        ))),
    }
}

fn lower_numeric(field: &FieldRef, op: CompareOp, value: &QueryValue) -> Result<String> {
    let n = match value {
        QueryValue::Num(n) => *n,
        QueryValue::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        QueryValue::Str(s) => s.parse().map_err(|_| {
            OmError::Query(format!(
                "numeric field '{}' compared against non-numeric '{s}'",
                field.query_name
            ))
        })?,
        QueryValue::StrList(_) => {
            return Err(OmError::Query(format!(
                "containment requires a list-typed field; '{}' is numeric",
                field.query_name
            )))
        }
    };
    let name = &field.query_name;
    let n = format_f64(n);
    match op {
        CompareOp::Eq => Ok(format!("@{name}:[{n} {n}]")),
        CompareOp::Ne => Ok(format!("-@{name}:[{n} {n}]")),
        CompareOp::Gt => Ok(format!("@{name}:[({n} +inf]")),
        CompareOp::Ge => Ok(format!("@{name}:[{n} +inf]")),
        CompareOp::Lt => Ok(format!("@{name}:[-inf ({n}]")),
        CompareOp::Le => Ok(format!("@{name}:[-inf {n}]")),
        CompareOp::Like => Err(OmError::Query(format!(
            "text match requires full_text_search=true on field '{name}'"
        ))),
        CompareOp::In | CompareOp::NotIn => Err(OmError::Query(format!(
            "containment requires a list-typed field; '{name}' is numeric"
        ))),
    }
}

fn lower_tag(field: &FieldRef, op: CompareOp, value: &QueryValue) -> Result<String> {
    let name = &field.query_name;
    match op {
        CompareOp::Eq | CompareOp::Ne => {
            let term = match value {
                QueryValue::Str(s) => {
                    if s.contains(field.separator) {
                        // A single value holding the separator would be
                        // split by the index; match each piece instead.
                        let clauses: Vec<String> = s
                            .split(field.separator)
                            .filter(|piece| !piece.is_empty())
                            .map(|piece| format!("@{name}:{{{}}}", escape_tag(piece)))
                            .collect();
                        if clauses.is_empty() {
                            return Err(OmError::Query(format!(
                                "tag value for field '{name}' holds only the separator character"
                            )));
                        }
                        let joined = format!("({})", clauses.join(" "));
                        return Ok(match op {
                            CompareOp::Eq => joined,
                            _ => format!("-{joined}"),
                        });
                    }
                    escape_tag(s)
                }
                QueryValue::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
                QueryValue::Num(n) => escape_tag(&format_f64(*n)),
                QueryValue::StrList(_) => {
                    return Err(OmError::Query(format!(
                        "equality on field '{name}' takes a single value; use any_of() for lists"
                    )))
                }
            };
            Ok(match op {
                CompareOp::Eq => format!("@{name}:{{{term}}}"),
                _ => format!("-@{name}:{{{term}}}"),
            })
        }
        CompareOp::In | CompareOp::NotIn => {
            if !field.multi_value {
                return Err(OmError::Query(format!(
                    "containment requires a list-typed field; '{name}' holds a single value"
                )));
            }
            let QueryValue::StrList(values) = value else {
                return Err(OmError::Query(format!(
                    "containment on field '{name}' takes a list of values"
                )));
            };
            if values.is_empty() {
                return Err(OmError::Query(format!(
                    "containment on field '{name}' needs at least one value"
                )));
            }
            let joined = values
                .iter()
                .map(|v| escape_tag(v))
                .collect::<Vec<_>>()
                .join("|");
            Ok(match op {
                CompareOp::In => format!("@{name}:{{{joined}}}"),
                _ => format!("-@{name}:{{{joined}}}"),
            })
        }
        CompareOp::Like => Err(OmError::Query(format!(
            "text match requires full_text_search=true on field '{name}'"
        ))),
        _ => Err(OmError::Query(format!(
            "range operators require a numeric field; '{name}' is a tag"
        ))),
    }
}

/// Sort direction for the SORTBY clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl std::fmt::Display for SortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// The fully assembled FT.SEARCH invocation.
#[derive(Debug, Clone)]
pub struct SearchArgs {
    pub index_name: String,
    pub query: String,
    pub offset: usize,
    pub limit: usize,
    pub sort_by: Option<(String, SortDirection)>,
    pub return_fields: Option<Vec<String>>,
    pub params: Vec<(String, Vec<u8>)>,
    /// Grammar dialect; KNN requires 2.
    pub dialect: Option<u8>,
    pub nocontent: bool,
}

impl SearchArgs {
    pub fn to_command(&self) -> redis::Cmd {
        let mut cmd = redis::cmd("FT.SEARCH");
        cmd.arg(&self.index_name).arg(&self.query);
        cmd.arg("LIMIT").arg(self.offset).arg(self.limit);
        if let Some((field, direction)) = &self.sort_by {
            cmd.arg("SORTBY").arg(field).arg(direction.to_string());
        }
        if let Some(fields) = &self.return_fields {
            cmd.arg("RETURN").arg(fields.len());
            for field in fields {
                cmd.arg(field);
            }
        }
        if !self.params.is_empty() {
            cmd.arg("PARAMS").arg(self.params.len() * 2);
            for (name, value) in &self.params {
                cmd.arg(name).arg(value.as_slice());
            }
        }
        if let Some(dialect) = self.dialect {
            cmd.arg("DIALECT").arg(dialect);
        }
        if self.nocontent {
            cmd.arg("NOCONTENT");
        }
        cmd
    }

    /// Human-readable argument vector (binary params elided) for logs and
    /// tests.
    pub fn to_debug_args(&self) -> Vec<String> {
        let mut args = vec![
            self.index_name.clone(),
            self.query.clone(),
            "LIMIT".to_string(),
            self.offset.to_string(),
            self.limit.to_string(),
        ];
        if let Some((field, direction)) = &self.sort_by {
            args.push("SORTBY".to_string());
            args.push(field.clone());
            args.push(direction.to_string());
        }
        if let Some(fields) = &self.return_fields {
            args.push("RETURN".to_string());
            args.push(fields.len().to_string());
            args.extend(fields.iter().cloned());
        }
        if !self.params.is_empty() {
            args.push("PARAMS".to_string());
            args.push((self.params.len() * 2).to_string());
            for (name, value) in &self.params {
                args.push(name.clone());
                args.push(format!("<{} bytes>", value.len()));
            }
        }
        if let Some(dialect) = self.dialect {
            args.push("DIALECT".to_string());
            args.push(dialect.to_string());
        }
        if self.nocontent {
            args.push("NOCONTENT".to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::Field;
    use crate::schema::compiler::CompiledSchema;
    use crate::schema::{
        DistanceMetric, FieldDef, RecordSchema, VectorOptions, VectorType,
    };
    use std::sync::Arc;

    fn schema() -> Arc<CompiledSchema> {
        CompiledSchema::compile(
            &RecordSchema::json("customer")
                .field(FieldDef::str("pk").primary_key())
                .field(FieldDef::str("first_name").indexed())
                .field(FieldDef::str("last_name").indexed())
                .field(FieldDef::int("age").indexed().sortable())
                .field(FieldDef::boolean("active").indexed())
                .field(FieldDef::str("bio").indexed().full_text_search())
                .field(FieldDef::list_of_str("tags").indexed())
                .field(FieldDef::geo("location").indexed())
                .field(FieldDef::vector(
                    "embedding",
                    VectorOptions::flat(4, VectorType::Float32, DistanceMetric::Cosine),
                ))
                .build(),
        )
        .unwrap()
    }

    fn f(name: &str) -> Field {
        Field::resolve(&schema(), name).unwrap()
    }

    fn q(expr: &Expr) -> String {
        translate(expr).unwrap().query
    }

    #[test]
    fn tag_equality_and_inequality() {
        assert_eq!(q(&f("last_name").eq("Brookins")), "@last_name:{Brookins}");
        assert_eq!(q(&f("last_name").ne("Brookins")), "-@last_name:{Brookins}");
    }

    #[test]
    fn tag_escaping_covers_special_characters() {
        assert_eq!(
            q(&f("last_name").eq("user@example.com")),
            r"@last_name:{user\@example\.com}"
        );
        assert_eq!(
            q(&f("last_name").eq("two words")),
            r"@last_name:{two\ words}"
        );
    }

    #[test]
    fn tag_value_holding_separator_splits_into_clauses() {
        assert_eq!(
            q(&f("last_name").eq("a|b")),
            "(@last_name:{a} @last_name:{b})"
        );
    }

    #[test]
    fn numeric_ranges() {
        assert_eq!(q(&f("age").eq(38)), "@age:[38 38]");
        assert_eq!(q(&f("age").ne(38)), "-@age:[38 38]");
        assert_eq!(q(&f("age").gt(38)), "@age:[(38 +inf]");
        assert_eq!(q(&f("age").ge(38)), "@age:[38 +inf]");
        assert_eq!(q(&f("age").lt(38)), "@age:[-inf (38]");
        assert_eq!(q(&f("age").le(38)), "@age:[-inf 38]");
    }

    #[test]
    fn boolean_on_numeric_kind_uses_zero_one() {
        // Document-layout booleans are NUMERIC, stored as 0/1
        assert_eq!(q(&f("active").eq(true)), "@active:[1 1]");
        assert_eq!(q(&f("active").eq(false)), "@active:[0 0]");
    }

    #[test]
    fn text_match_is_lowercased() {
        assert_eq!(q(&f("bio").matches("Running")), "@bio:(running)");
        assert_eq!(q(&f("bio").eq("Loves Redis")), "@bio:(loves redis)");
        assert_eq!(q(&f("bio").ne("x")), "-@bio:(x)");
    }

    #[test]
    fn text_rejects_ranges() {
        let err = translate(&f("bio").gt(1)).unwrap_err();
        assert!(err.to_string().contains("equality, inequality"));
    }

    #[test]
    fn like_requires_full_text_field() {
        let err = translate(&f("last_name").matches("x")).unwrap_err();
        assert!(err.to_string().contains("full_text_search"));
    }

    #[test]
    fn containment_needs_a_list_field() {
        assert_eq!(
            q(&f("tags").any_of(["a", "b", "c"])),
            "@tags:{a|b|c}"
        );
        assert_eq!(q(&f("tags").none_of(["a"])), "-@tags:{a}");
        let err = translate(&f("last_name").any_of(["a"])).unwrap_err();
        assert!(err.to_string().contains("list-typed"));
    }

    #[test]
    fn boolean_algebra_lowering() {
        let expr = !(f("first_name").eq("Andrew"))
            & (f("last_name").eq("Brookins") | f("last_name").eq("Smith"));
        assert_eq!(
            q(&expr),
            "(-(@first_name:{Andrew}) (@last_name:{Brookins} | @last_name:{Smith}))"
        );
    }

    #[test]
    fn wildcard_and_negated_wildcard() {
        assert_eq!(q(&Expr::All), "*");
        assert!(translate(&!Expr::All).is_err());
    }

    #[test]
    fn geo_within() {
        assert_eq!(
            q(&f("location").within(-122.4, 37.8, 10.0, crate::query::expr::GeoUnit::Kilometers)),
            "@location:[-122.4 37.8 10 km]"
        );
    }

    #[test]
    fn knn_standalone_and_hybrid() {
        let knn = f("embedding").knn(5, &[0.1, 0.2, 0.3, 0.4]);
        let t = translate(&knn).unwrap();
        assert_eq!(t.query, "(*)=>[KNN 5 @embedding $BLOB AS __vec_score]");
        assert_eq!(t.knn_k, Some(5));
        assert_eq!(t.params.len(), 1);
        assert_eq!(t.params[0].0, "BLOB");
        assert_eq!(t.params[0].1.len(), 16);

        let hybrid = f("age").ge(21) & f("embedding").knn(3, &[0.0; 4]);
        let t = translate(&hybrid).unwrap();
        assert_eq!(
            t.query,
            "(@age:[21 +inf])=>[KNN 3 @embedding $BLOB AS __vec_score]"
        );
    }

    #[test]
    fn knn_under_or_is_rejected() {
        let bad = f("age").ge(21) | f("embedding").knn(3, &[0.0; 4]);
        assert!(translate(&bad).is_err());

        let double =
            f("embedding").knn(3, &[0.0; 4]) & f("embedding").knn(5, &[0.0; 4]);
        assert!(translate(&double).is_err());
    }

    #[test]
    fn vector_comparison_is_rejected() {
        let err = translate(&f("embedding").eq("x")).unwrap_err();
        assert!(err.to_string().contains("KNN"));
    }

    #[test]
    fn search_args_assemble_in_grammar_order() {
        let args = SearchArgs {
            index_name: "customer:index".into(),
            query: "@age:[21 +inf]".into(),
            offset: 10,
            limit: 20,
            sort_by: Some(("age".into(), SortDirection::Desc)),
            return_fields: Some(vec!["first_name".into()]),
            params: vec![("BLOB".into(), vec![0u8; 8])],
            dialect: Some(2),
            nocontent: false,
        };
        assert_eq!(
            args.to_debug_args(),
            vec![
                "customer:index",
                "@age:[21 +inf]",
                "LIMIT",
                "10",
                "20",
                "SORTBY",
                "age",
                "DESC",
                "RETURN",
                "1",
                "first_name",
                "PARAMS",
                "2",
                "BLOB",
                "<8 bytes>",
                "DIALECT",
                "2",
            ]
        );
    }

    #[test]
    fn and_commutations_hit_the_same_result_set() {
        // Not string-identical, but both lower to valid conjunctions of the
        // same clauses.
        let a = q(&(f("age").ge(21) & f("last_name").eq("Smith")));
        let b = q(&(f("last_name").eq("Smith") & f("age").ge(21)));
        assert!(a.contains("@age:[21 +inf]") && a.contains("@last_name:{Smith}"));
        assert!(b.contains("@age:[21 +inf]") && b.contains("@last_name:{Smith}"));
    }
}
