// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lazy query execution.
//!
//! [`FindQuery`] is a cheap, copy-on-modify description of one search.
//! Non-terminals (`sort_by`, `limit`) return a new query; terminals
//! (`all`, `first`, `count`, `page`, `update`, `delete`, `values`, `only`,
//! `iter`) run it. Each page of results is one FT.SEARCH round trip.
//!
//! Pagination is strict: `page()` demands an explicit `sort_by` (or a KNN
//! leaf, which orders by vector distance) because the server's unsorted
//! ordering is not stable across inserts.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::codec;
use crate::error::{OmError, Result};
use crate::query::expr::Expr;
use crate::query::translate::{translate, SearchArgs, SortDirection};
use crate::query::VECTOR_SCORE_ALIAS;
use crate::schema::compiler::CompiledSchema;
use crate::schema::{FieldType, Record, StorageLayout};
use crate::storage::RedisClient;

/// One raw search hit: the record key plus returned field pairs (empty for
/// NOCONTENT queries).
#[derive(Debug, Clone)]
pub struct Hit {
    pub key: String,
    pub pairs: Vec<(String, Vec<u8>)>,
}

/// Parse an FT.SEARCH reply into (total, hits).
pub(crate) fn parse_search_reply(value: &redis::Value) -> Result<(u64, Vec<Hit>)> {
    let items = match value {
        redis::Value::Array(items) => items,
        other => {
            return Err(OmError::Query(format!(
                "unexpected search reply shape: {other:?}"
            )))
        }
    };
    let mut iter = items.iter();
    let total = match iter.next() {
        Some(redis::Value::Int(n)) => *n as u64,
        other => {
            return Err(OmError::Query(format!(
                "search reply is missing its hit count: {other:?}"
            )))
        }
    };
    let mut hits = Vec::new();
    let mut pending_key: Option<String> = None;
    for item in iter {
        match item {
            redis::Value::BulkString(bytes) => {
                if let Some(key) = pending_key.take() {
                    // NOCONTENT replies are a flat key list; seeing a second
                    // string before an array means no bodies are coming.
                    hits.push(Hit {
                        key,
                        pairs: Vec::new(),
                    });
                }
                pending_key = Some(String::from_utf8_lossy(bytes).into_owned());
            }
            redis::Value::SimpleString(s) => {
                if let Some(key) = pending_key.take() {
                    hits.push(Hit {
                        key,
                        pairs: Vec::new(),
                    });
                }
                pending_key = Some(s.clone());
            }
            redis::Value::Array(fields) => {
                let key = pending_key.take().ok_or_else(|| {
                    OmError::Query("search reply held a document without a key".to_string())
                })?;
                let mut pairs = Vec::with_capacity(fields.len() / 2);
                let mut chunks = fields.chunks_exact(2);
                for chunk in &mut chunks {
                    let name = value_to_string(&chunk[0]);
                    let data = value_to_bytes(&chunk[1]);
                    pairs.push((name, data));
                }
                hits.push(Hit { key, pairs });
            }
            _ => {}
        }
    }
    if let Some(key) = pending_key {
        hits.push(Hit {
            key,
            pairs: Vec::new(),
        });
    }
    Ok((total, hits))
}

fn value_to_string(value: &redis::Value) -> String {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        redis::Value::SimpleString(s) => s.clone(),
        redis::Value::Int(n) => n.to_string(),
        other => format!("{other:?}"),
    }
}

fn value_to_bytes(value: &redis::Value) -> Vec<u8> {
    match value {
        redis::Value::BulkString(bytes) => bytes.clone(),
        redis::Value::SimpleString(s) => s.clone().into_bytes(),
        redis::Value::Int(n) => n.to_string().into_bytes(),
        _ => Vec::new(),
    }
}

/// A partially loaded record produced by `only()`. Reading a path that was
/// not requested is an error rather than a silent default.
#[derive(Debug, Clone)]
pub struct PartialRecord {
    record: String,
    key: String,
    fields: Map<String, Value>,
    requested: Vec<String>,
}

impl PartialRecord {
    /// The full Redis key of the underlying record.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, path: &str) -> Result<Value> {
        if !self.requested.iter().any(|p| p == path) {
            return Err(OmError::Query(format!(
                "field '{path}' of record '{}' was not loaded by this query; add it to only()",
                self.record
            )));
        }
        Ok(self.fields.get(path).cloned().unwrap_or(Value::Null))
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }
}

/// A lazy query over one record type.
pub struct FindQuery<T: Record> {
    client: RedisClient,
    schema: Arc<CompiledSchema>,
    expr: Expr,
    offset: usize,
    limit: Option<usize>,
    page_size: usize,
    sort: Vec<(String, SortDirection)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for FindQuery<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            schema: self.schema.clone(),
            expr: self.expr.clone(),
            offset: self.offset,
            limit: self.limit,
            page_size: self.page_size,
            sort: self.sort.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Record> FindQuery<T> {
    pub(crate) fn new(
        client: RedisClient,
        schema: Arc<CompiledSchema>,
        expr: Expr,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            schema,
            expr,
            offset: 0,
            limit: None,
            page_size,
            sort: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// The lowered query string (diagnostics and tests).
    pub fn query_string(&self) -> Result<String> {
        Ok(translate(&self.expr)?.query)
    }

    /// Deterministic ASCII rendering of the expression tree.
    pub fn tree(&self) -> String {
        self.expr.render_tree()
    }

    /// Sort keys: `"age"` ascending, `"-age"` descending. Only the first
    /// key reaches the server (the search engine sorts by one field);
    /// extras are validated and ignored.
    pub fn sort_by<S: AsRef<str>>(mut self, fields: &[S]) -> Result<Self> {
        let mut sort = Vec::new();
        for spec in fields {
            let spec = spec.as_ref();
            let (name, direction) = match spec.strip_prefix('-') {
                Some(name) => (name, SortDirection::Desc),
                None => (spec, SortDirection::Asc),
            };
            if name == VECTOR_SCORE_ALIAS && self.expr.contains_knn() {
                sort.push((name.to_string(), direction));
                continue;
            }
            let field = self.schema.resolve(name).ok_or_else(|| {
                OmError::Query(format!(
                    "cannot sort by '{name}': no such indexed field on record '{}'",
                    self.schema.record
                ))
            })?;
            if !field.sortable {
                return Err(OmError::Query(format!(
                    "cannot sort by '{name}': the field is not declared sortable"
                )));
            }
            sort.push((field.query_name.clone(), direction));
        }
        self.sort = sort;
        Ok(self)
    }

    /// Cap the total number of records terminals will return.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Results-per-round-trip for `all()` and iteration.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn build_args(
        &self,
        offset: usize,
        limit: usize,
        nocontent: bool,
        return_fields: Option<Vec<String>>,
    ) -> Result<SearchArgs> {
        let translated = translate(&self.expr)?;
        let sort_by = self.sort.first().cloned().or_else(|| {
            translated
                .knn_k
                .map(|_| (VECTOR_SCORE_ALIAS.to_string(), SortDirection::Asc))
        });
        let dialect = if translated.knn_k.is_some() {
            Some(2)
        } else {
            None
        };
        Ok(SearchArgs {
            index_name: self.schema.index_name.clone(),
            query: translated.query,
            offset,
            limit,
            sort_by,
            return_fields,
            params: translated.params,
            dialect,
            nocontent,
        })
    }

    async fn execute(
        &self,
        offset: usize,
        limit: usize,
        nocontent: bool,
        return_fields: Option<Vec<String>>,
    ) -> Result<(u64, Vec<Hit>)> {
        let _timer = crate::metrics::LatencyTimer::new("search");
        let args = self.build_args(offset, limit, nocontent, return_fields)?;
        debug!(record = %self.schema.record, args = ?args.to_debug_args(), "FT.SEARCH");
        crate::metrics::record_search(&self.schema.record);
        let reply = match self.client.execute(&args.to_command()).await {
            Ok(reply) => reply,
            Err(err) => return Err(self.attach_datetime_hint(err)),
        };
        parse_search_reply(&reply)
    }

    /// Search syntax errors on records with datetime fields usually mean
    /// the stored index predates the numeric datetime encoding.
    fn attach_datetime_hint(&self, err: OmError) -> OmError {
        if let OmError::Connection(inner) = &err {
            let message = inner.to_string().to_lowercase();
            if message.contains("syntax error") && self.schema.has_datetime_fields() {
                return OmError::Query(format!(
                    "search failed ({inner}); record '{}' has datetime fields that may still \
                     be indexed as TAG — run check-schema, then the datetime data migration",
                    self.schema.record
                ));
            }
        }
        err
    }

    fn hydrate(&self, hit: &Hit) -> Result<T> {
        let decoded = self.decode_document(hit)?;
        serde_json::from_value(decoded).map_err(OmError::Validation)
    }

    /// Decode one hit into the record's serde shape.
    fn decode_document(&self, hit: &Hit) -> Result<Value> {
        match self.schema.layout {
            StorageLayout::Json => {
                let raw = hit
                    .pairs
                    .iter()
                    .find(|(name, _)| name == "$")
                    .map(|(_, bytes)| bytes)
                    .ok_or_else(|| {
                        OmError::Query(format!(
                            "search hit for '{}' is missing its document body",
                            hit.key
                        ))
                    })?;
                let doc: Value = serde_json::from_slice(raw)?;
                codec::decode_json(&self.schema.source, &doc)
            }
            StorageLayout::Hash => {
                let pairs: Vec<(Vec<u8>, Vec<u8>)> = hit
                    .pairs
                    .iter()
                    .map(|(name, bytes)| (name.as_bytes().to_vec(), bytes.clone()))
                    .collect();
                codec::decode_hash(&self.schema.source, &pairs)
            }
        }
    }

    // -- terminals ----------------------------------------------------------

    /// Every matching record, fetched page by page.
    pub async fn all(&self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut offset = self.offset;
        loop {
            let page_limit = match self.limit {
                Some(cap) => self.page_size.min(cap.saturating_sub(out.len())),
                None => self.page_size,
            };
            if page_limit == 0 {
                break;
            }
            let (_, hits) = self.execute(offset, page_limit, false, None).await?;
            let fetched = hits.len();
            for hit in &hits {
                out.push(self.hydrate(hit)?);
            }
            if fetched < page_limit {
                break;
            }
            offset += fetched;
        }
        Ok(out)
    }

    /// The first match, or `NotFound`.
    pub async fn first(&self) -> Result<T> {
        let (_, hits) = self.execute(self.offset, 1, false, None).await?;
        match hits.first() {
            Some(hit) => self.hydrate(hit),
            None => Err(OmError::NotFound),
        }
    }

    /// Just the hit count; no document bodies cross the wire.
    pub async fn count(&self) -> Result<u64> {
        let (total, _) = self.execute(0, 0, true, None).await?;
        Ok(total)
    }

    /// One explicit window. Requires a prior `sort_by` (or a KNN leaf):
    /// unsorted windows are not stable across inserts.
    pub async fn page(&self, offset: usize, limit: usize) -> Result<Vec<T>> {
        if self.sort.is_empty() && !self.expr.contains_knn() {
            return Err(OmError::Query(
                "page() without sort_by() has no stable order; sort explicitly first".to_string(),
            ));
        }
        let (_, hits) = self.execute(offset, limit, false, None).await?;
        hits.iter().map(|hit| self.hydrate(hit)).collect()
    }

    /// Restartable paged iteration.
    pub fn iter(&self) -> QueryStream<T> {
        QueryStream {
            query: self.clone(),
            offset: self.offset,
            buffer: VecDeque::new(),
            remaining: self.limit,
            finished: false,
        }
    }

    /// Collect every matching key (NOCONTENT round trips).
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut offset = self.offset;
        loop {
            let (_, hits) = self.execute(offset, self.page_size, true, None).await?;
            let fetched = hits.len();
            keys.extend(hits.into_iter().map(|hit| hit.key));
            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }
        Ok(keys)
    }

    /// Load each match, apply the patch, save. Returns the number of
    /// records written.
    pub async fn update(&self, patch: &[(&str, Value)]) -> Result<usize> {
        for (name, _) in patch {
            if self.schema.source.field(name).is_none() {
                return Err(OmError::Query(format!(
                    "update patch names unknown field '{name}' on record '{}'",
                    self.schema.record
                )));
            }
        }
        let mut written = 0;
        let mut offset = self.offset;
        loop {
            let (_, hits) = self.execute(offset, self.page_size, false, None).await?;
            let fetched = hits.len();
            for hit in &hits {
                let mut decoded = self.decode_document(hit)?;
                if let Some(object) = decoded.as_object_mut() {
                    for (name, value) in patch {
                        object.insert((*name).to_string(), value.clone());
                    }
                }
                match self.schema.layout {
                    StorageLayout::Json => {
                        let stored = codec::encode_json(&self.schema.source, &decoded)?;
                        self.client.json_set(&hit.key, &stored).await?;
                    }
                    StorageLayout::Hash => {
                        let pairs = codec::encode_hash(&self.schema.source, &decoded)?;
                        self.client.hset(&hit.key, &pairs).await?;
                    }
                }
                written += 1;
            }
            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }
        Ok(written)
    }

    /// Delete every match; returns the number of keys removed.
    pub async fn delete(&self) -> Result<u64> {
        let keys = self.keys().await?;
        let mut deleted = 0;
        for chunk in keys.chunks(512) {
            deleted += self.client.del(chunk).await?;
        }
        Ok(deleted)
    }

    // -- projection ---------------------------------------------------------

    /// Rows of decoded values for the requested paths. Simple top-level
    /// paths are fetched with a server-side RETURN; any dotted path falls
    /// back to loading full documents and extracting locally.
    pub async fn values(&self, paths: &[&str]) -> Result<Vec<Map<String, Value>>> {
        self.project(paths).await
    }

    /// Partial records exposing only the requested paths; any other access
    /// errors.
    pub async fn only(&self, paths: &[&str]) -> Result<Vec<PartialRecord>> {
        let requested: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        let rows = self.project_with_keys(paths).await?;
        Ok(rows
            .into_iter()
            .map(|(key, fields)| PartialRecord {
                record: self.schema.record.clone(),
                key,
                fields,
                requested: requested.clone(),
            })
            .collect())
    }

    async fn project(&self, paths: &[&str]) -> Result<Vec<Map<String, Value>>> {
        Ok(self
            .project_with_keys(paths)
            .await?
            .into_iter()
            .map(|(_, fields)| fields)
            .collect())
    }

    async fn project_with_keys(&self, paths: &[&str]) -> Result<Vec<(String, Map<String, Value>)>> {
        for path in paths {
            if !self.schema.declares_path(path) {
                return Err(OmError::Query(format!(
                    "projection path '{path}' does not exist on record '{}'",
                    self.schema.record
                )));
            }
        }
        let shallow = paths.iter().all(|path| self.projectable_on_server(path));
        if shallow {
            self.project_shallow(paths).await
        } else {
            self.project_deep(paths).await
        }
    }

    /// A path can be served by RETURN when it is top-level and the server
    /// knows it: hash layouts return any hash field by name; JSON layouts
    /// need an indexed alias.
    fn projectable_on_server(&self, path: &str) -> bool {
        if path.contains('.') {
            return false;
        }
        match self.schema.layout {
            StorageLayout::Hash => true,
            StorageLayout::Json => self.schema.resolve(path).is_some(),
        }
    }

    async fn project_shallow(&self, paths: &[&str]) -> Result<Vec<(String, Map<String, Value>)>> {
        let return_fields: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        let mut rows = Vec::new();
        let mut offset = self.offset;
        loop {
            let page_limit = match self.limit {
                Some(cap) => self.page_size.min(cap.saturating_sub(rows.len())),
                None => self.page_size,
            };
            if page_limit == 0 {
                break;
            }
            let (_, hits) = self
                .execute(offset, page_limit, false, Some(return_fields.clone()))
                .await?;
            let fetched = hits.len();
            for hit in &hits {
                let mut row = Map::new();
                for path in paths {
                    let raw = hit
                        .pairs
                        .iter()
                        .find(|(name, _)| name == path)
                        .map(|(_, bytes)| bytes.as_slice());
                    row.insert((*path).to_string(), self.decode_projected(path, raw)?);
                }
                rows.push((hit.key.clone(), row));
            }
            if fetched < page_limit {
                break;
            }
            offset += fetched;
        }
        Ok(rows)
    }

    async fn project_deep(&self, paths: &[&str]) -> Result<Vec<(String, Map<String, Value>)>> {
        let mut rows = Vec::new();
        let mut offset = self.offset;
        loop {
            let page_limit = match self.limit {
                Some(cap) => self.page_size.min(cap.saturating_sub(rows.len())),
                None => self.page_size,
            };
            if page_limit == 0 {
                break;
            }
            let (_, hits) = self.execute(offset, page_limit, false, None).await?;
            let fetched = hits.len();
            for hit in &hits {
                let decoded = self.decode_document(hit)?;
                let mut row = Map::new();
                for path in paths {
                    row.insert(
                        (*path).to_string(),
                        codec::extract_path(&decoded, path).unwrap_or(Value::Null),
                    );
                }
                rows.push((hit.key.clone(), row));
            }
            if fetched < page_limit {
                break;
            }
            offset += fetched;
        }
        Ok(rows)
    }

    /// Decode a RETURN-projected scalar by its declared type, so numbers
    /// stay numbers and datetimes decode to their wire form.
    fn decode_projected(&self, path: &str, raw: Option<&[u8]>) -> Result<Value> {
        let Some(bytes) = raw else {
            return Ok(Value::Null);
        };
        let text = String::from_utf8_lossy(bytes).into_owned();
        let ty = self.schema.declared_type(path);
        let value = match ty.as_ref().map(FieldType::unwrapped) {
            Some(FieldType::Int) => text
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::String(text)),
            Some(FieldType::Float) => text
                .parse::<f64>()
                .map(Value::from)
                .unwrap_or(Value::String(text)),
            Some(FieldType::Bool) => match text.as_str() {
                "1" | "true" | "True" => Value::Bool(true),
                "0" | "false" | "False" => Value::Bool(false),
                _ => Value::String(text),
            },
            Some(FieldType::DateTime) => {
                match codec::parse_datetime_flexible(&Value::String(text.clone())) {
                    Some(dt) => Value::String(
                        dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                    ),
                    None => Value::String(text),
                }
            }
            Some(FieldType::Date) => {
                match codec::parse_datetime_flexible(&Value::String(text.clone())) {
                    Some(dt) => Value::String(dt.date_naive().to_string()),
                    None => Value::String(text),
                }
            }
            Some(FieldType::List(_)) | Some(FieldType::Vector) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            _ => Value::String(text),
        };
        Ok(value)
    }
}

/// Restartable async iteration over query results; each refill is one
/// FT.SEARCH round trip.
pub struct QueryStream<T: Record> {
    query: FindQuery<T>,
    offset: usize,
    buffer: VecDeque<T>,
    remaining: Option<usize>,
    finished: bool,
}

impl<T: Record> QueryStream<T> {
    pub async fn next(&mut self) -> Result<Option<T>> {
        if let Some(record) = self.buffer.pop_front() {
            return Ok(Some(record));
        }
        if self.finished {
            return Ok(None);
        }
        let page_limit = match self.remaining {
            Some(0) => {
                self.finished = true;
                return Ok(None);
            }
            Some(n) => self.query.page_size.min(n),
            None => self.query.page_size,
        };
        let (_, hits) = self
            .query
            .execute(self.offset, page_limit, false, None)
            .await?;
        let fetched = hits.len();
        for hit in &hits {
            self.buffer.push_back(self.query.hydrate(hit)?);
        }
        self.offset += fetched;
        if let Some(n) = &mut self.remaining {
            *n = n.saturating_sub(fetched);
        }
        if fetched < page_limit {
            self.finished = true;
        }
        Ok(self.buffer.pop_front())
    }
}
