//! In-Process Cluster
//!
//! [`MemoryCluster`] implements [`Transport`] without a network. It emulates
//! one bucket spread over a list of servers: documents with CAS and expiry,
//! per-server stats, map-style views answered as chunked HTTP responses, and
//! a handful of switches for failure testing.
//!
//! ```text
//!  submit(Get/Store)  ──>  StorageEngine  ──> sink.complete(status, body)
//!  submit(Stat)       ──>  counters per server ──> one Stats completion
//!  submit(View)       ──>  map fn over snapshot ──> JSON body
//!                                                    │ split every chunk_size bytes
//!                                                    └──> ViewChunk × N (last is_final)
//! ```
//!
//! Completions are reported from inside `submit` through the sink, which
//! only queues them for the event loop; `submit` never waits.

use crate::connection::config::{ConnectParams, TransportConfig};
use crate::storage::{ExpiryConfig, ExpirySweeper, StorageEngine, StoreError};
use crate::transport::{
    CompletionBody, CompletionSink, Request, StatEntry, StatusCode, StoreMode, Transport, ViewPath,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info, trace};

/// Largest document value the emulated bucket accepts.
pub const MAX_VALUE_SIZE: usize = 20 * 1024 * 1024;

/// Default size of one view response chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// A view's map function: `(doc id, doc) -> [(key, value)]`.
pub type MapFn = Arc<dyn Fn(&str, &Value) -> Vec<(Value, Value)> + Send + Sync>;

/// A canned HTTP response for a view, delivered exactly as given.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedView {
    pub http_status: u16,
    pub chunks: Vec<Bytes>,
    /// Transport failure reported after the chunks instead of a final chunk
    pub then_fail: Option<StatusCode>,
}

impl ScriptedView {
    pub fn new<I, C>(http_status: u16, chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            http_status,
            chunks: chunks.into_iter().map(Into::into).collect(),
            then_fail: None,
        }
    }

    pub fn then_fail(mut self, status: StatusCode) -> Self {
        self.then_fail = Some(status);
        self
    }
}

#[derive(Clone)]
enum ViewDef {
    Map(MapFn),
    Scripted(ScriptedView),
}

/// An emulated bucket.
///
/// # Example
///
/// ```
/// use couchlink::transport::MemoryCluster;
/// use serde_json::json;
///
/// let cluster = MemoryCluster::new("radius")
///     .with_servers(["10.0.0.1:11210", "10.0.0.2:11210"])
///     .with_chunk_size(64);
/// cluster.define_view("acct/by_user", |_id, doc| {
///     match doc.get("user") {
///         Some(user) => vec![(user.clone(), json!(1))],
///         None => vec![],
///     }
/// });
/// ```
pub struct MemoryCluster {
    bucket: String,
    servers: Vec<String>,
    credentials: Option<(String, String)>,
    engine: Arc<StorageEngine>,
    sweeper: Mutex<Option<ExpirySweeper>>,
    started: Instant,
    connected: AtomicBool,
    reachable: AtomicBool,
    chunk_size: AtomicUsize,
    views: RwLock<HashMap<String, ViewDef>>,
    faults: RwLock<HashMap<String, StatusCode>>,
    silent: RwLock<HashSet<String>>,
    last_config: Mutex<Option<TransportConfig>>,
    submitted: AtomicU64,
    destroyed: AtomicU64,
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("bucket", &self.bucket)
            .field("servers", &self.servers)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("documents", &self.engine.len())
            .finish()
    }
}

impl MemoryCluster {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            servers: vec!["127.0.0.1:11210".to_string()],
            credentials: None,
            engine: Arc::new(StorageEngine::new()),
            sweeper: Mutex::new(None),
            started: Instant::now(),
            connected: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            chunk_size: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
            views: RwLock::new(HashMap::new()),
            faults: RwLock::new(HashMap::new()),
            silent: RwLock::new(HashSet::new()),
            last_config: Mutex::new(None),
            submitted: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Servers reporting stats. At least one is always kept.
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let servers: Vec<String> = servers.into_iter().map(Into::into).collect();
        if !servers.is_empty() {
            self.servers = servers;
        }
        self
    }

    /// Requires these credentials at connect.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        self.set_chunk_size(chunk_size);
        self
    }

    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.chunk_size.store(chunk_size.max(1), Ordering::Relaxed);
    }

    /// While unreachable, connects fail and requests fail with `NetworkError`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    /// Makes every request for `target` (a document key or view name) fail.
    pub fn inject_fault(&self, target: impl Into<String>, status: StatusCode) {
        self.faults.write().unwrap().insert(target.into(), status);
    }

    pub fn clear_fault(&self, target: &str) {
        self.faults.write().unwrap().remove(target);
    }

    /// Requests for `target` are accepted and never answered.
    pub fn silence(&self, target: impl Into<String>) {
        self.silent.write().unwrap().insert(target.into());
    }

    /// Defines a map view under `ddoc/view`.
    pub fn define_view<F>(&self, name: impl Into<String>, map: F)
    where
        F: Fn(&str, &Value) -> Vec<(Value, Value)> + Send + Sync + 'static,
    {
        self.views
            .write()
            .unwrap()
            .insert(name.into(), ViewDef::Map(Arc::new(map)));
    }

    /// Answers `ddoc/view` with a canned response.
    pub fn script_view(&self, name: impl Into<String>, script: ScriptedView) {
        self.views
            .write()
            .unwrap()
            .insert(name.into(), ViewDef::Scripted(script));
    }

    /// The bucket's documents.
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Effective configuration passed at the last successful connect.
    pub fn last_config(&self) -> Option<TransportConfig> {
        self.last_config.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Number of `destroy` calls received.
    pub fn destroy_count(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    fn fault_for(&self, target: &str) -> Option<StatusCode> {
        self.faults.read().unwrap().get(target).copied()
    }

    fn is_silent(&self, target: &str) -> bool {
        self.silent.read().unwrap().contains(target)
    }

    fn execute_get(&self, key: &str, sink: &CompletionSink) {
        match self.engine.get(key) {
            Some(entry) => {
                sink.complete(
                    StatusCode::Success,
                    CompletionBody::Document {
                        value: entry.value,
                        cas: entry.cas,
                    },
                );
            }
            None => {
                sink.fail(StatusCode::KeyNotFound);
            }
        }
    }

    fn execute_store(&self, key: &str, value: Bytes, expiry: u32, mode: StoreMode, sink: &CompletionSink) {
        if value.len() > MAX_VALUE_SIZE {
            sink.fail(StatusCode::ValueTooLarge);
            return;
        }

        match self.engine.store(key, value, expiry, mode) {
            Ok(cas) => {
                sink.complete(StatusCode::Success, CompletionBody::Stored { cas });
            }
            Err(StoreError::KeyExists) => {
                sink.fail(StatusCode::KeyExists);
            }
            Err(StoreError::KeyNotFound) => {
                sink.fail(StatusCode::KeyNotFound);
            }
        }
    }

    fn execute_stat(&self, group: Option<&str>, sink: &CompletionSink) {
        let stats = self.engine.stats();
        let stats: Vec<(&str, String)> = match group {
            None | Some("") => vec![
                ("uptime", self.started.elapsed().as_secs().to_string()),
                ("curr_items", stats.items.to_string()),
                ("cmd_get", stats.cmd_get.to_string()),
                ("get_hits", stats.get_hits.to_string()),
                ("get_misses", stats.get_misses.to_string()),
                ("cmd_set", stats.cmd_set.to_string()),
                ("delete_hits", stats.delete_hits.to_string()),
                ("expired", stats.expired.to_string()),
            ],
            Some("memory") => vec![("mem_used", self.engine.memory_used().to_string())],
            Some("items") => vec![("curr_items", stats.items.to_string())],
            Some(_) => {
                sink.fail(StatusCode::KeyNotFound);
                return;
            }
        };

        let entries = self
            .servers
            .iter()
            .flat_map(|server| {
                stats.iter().map(move |(key, value)| StatEntry {
                    server: server.clone(),
                    key: key.to_string(),
                    value: value.clone(),
                })
            })
            .collect();
        sink.complete(StatusCode::Success, CompletionBody::Stats(entries));
    }

    fn execute_view(&self, path: &ViewPath, post: Option<&str>, sink: &CompletionSink) {
        let name = path.name();
        let def = if name == ViewPath::ALL_DOCS {
            None
        } else {
            match self.views.read().unwrap().get(&name) {
                Some(def) => Some(def.clone()),
                None => {
                    let body = json!({"error": "not_found", "reason": "missing"});
                    self.send_body(404, &body, sink);
                    return;
                }
            }
        };

        match def {
            Some(ViewDef::Scripted(script)) => self.send_script(&script, sink),
            Some(ViewDef::Map(map)) => match self.run_map(path, post, Some(&map)) {
                Ok(body) => self.send_body(200, &body, sink),
                Err(body) => self.send_body(400, &body, sink),
            },
            None => match self.run_map(path, post, None) {
                Ok(body) => self.send_body(200, &body, sink),
                Err(body) => self.send_body(400, &body, sink),
            },
        }
    }

    /// Builds a view result. `None` lists every document.
    fn run_map(&self, path: &ViewPath, post: Option<&str>, map: Option<&MapFn>) -> Result<Value, Value> {
        let query = ViewQuery::from_path(path, post)?;

        let mut rows: Vec<(Value, String, Value)> = Vec::new();
        for (id, raw) in self.engine.snapshot() {
            match map {
                None => rows.push((Value::String(id.clone()), id, Value::Null)),
                Some(map) => {
                    // Views only index JSON documents
                    let Ok(doc) = serde_json::from_slice::<Value>(&raw) else {
                        continue;
                    };
                    for (key, value) in map(&id, &doc) {
                        rows.push((key, id.clone(), value));
                    }
                }
            }
        }

        let total_rows = rows.len();
        rows.sort_by(|a, b| collate(&a.0, &b.0).then_with(|| a.1.cmp(&b.1)));
        if query.descending {
            rows.reverse();
        }

        let rows: Vec<Value> = rows
            .into_iter()
            .filter(|(key, _, _)| query.matches(key))
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|(key, id, value)| json!({"id": id, "key": key, "value": value}))
            .collect();

        Ok(json!({"total_rows": total_rows, "rows": rows}))
    }

    fn send_body(&self, http_status: u16, body: &Value, sink: &CompletionSink) {
        let data = Bytes::from(body.to_string());
        let chunk_size = self.chunk_size.load(Ordering::Relaxed);
        let count = data.len().div_ceil(chunk_size).max(1);

        trace!(http_status, bytes = data.len(), chunks = count, "sending view response");
        for index in 0..count {
            let start = index * chunk_size;
            let end = (start + chunk_size).min(data.len());
            sink.complete(
                StatusCode::Success,
                CompletionBody::ViewChunk {
                    http_status,
                    data: data.slice(start..end),
                    is_final: index + 1 == count,
                },
            );
        }
    }

    fn send_script(&self, script: &ScriptedView, sink: &CompletionSink) {
        let last = script.chunks.len().saturating_sub(1);
        for (index, chunk) in script.chunks.iter().enumerate() {
            sink.complete(
                StatusCode::Success,
                CompletionBody::ViewChunk {
                    http_status: script.http_status,
                    data: chunk.clone(),
                    is_final: script.then_fail.is_none() && index == last,
                },
            );
        }

        match script.then_fail {
            Some(status) => {
                sink.fail(status);
            }
            None if script.chunks.is_empty() => {
                sink.complete(
                    StatusCode::Success,
                    CompletionBody::ViewChunk {
                        http_status: script.http_status,
                        data: Bytes::new(),
                        is_final: true,
                    },
                );
            }
            None => {}
        }
    }
}

impl Transport for MemoryCluster {
    fn connect(&self, params: &ConnectParams, config: &TransportConfig) -> Result<(), StatusCode> {
        if !self.reachable.load(Ordering::Relaxed) {
            return Err(StatusCode::ConnectError);
        }
        if params.bucket != self.bucket {
            return Err(StatusCode::BucketNotFound);
        }
        if let Some((username, password)) = &self.credentials {
            let offered = (params.username.as_deref(), params.password.as_deref());
            if offered != (Some(username.as_str()), Some(password.as_str())) {
                return Err(StatusCode::AuthError);
            }
        }

        *self.last_config.lock().unwrap() = Some(config.clone());
        {
            let mut sweeper = self.sweeper.lock().unwrap();
            if sweeper.is_none() {
                *sweeper = ExpirySweeper::try_start(Arc::clone(&self.engine), ExpiryConfig::default());
            }
        }
        self.connected.store(true, Ordering::Relaxed);

        info!(bucket = %self.bucket, servers = self.servers.len(), "in-process cluster connected");
        Ok(())
    }

    fn submit(&self, request: Request, sink: CompletionSink) -> Result<(), StatusCode> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(StatusCode::BadHandle);
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let target = match &request {
            Request::Get { key } | Request::Store { key, .. } => key.clone(),
            Request::Stat { group } => group.clone().unwrap_or_default(),
            Request::View { path, .. } => match ViewPath::parse(path) {
                Some(parsed) => parsed.name(),
                None => return Err(StatusCode::InvalidArgument),
            },
        };
        debug!(token = %sink.token(), kind = %request.kind(), target = %target, "request received");

        if !self.reachable.load(Ordering::Relaxed) {
            sink.fail(StatusCode::NetworkError);
            return Ok(());
        }
        if let Some(status) = self.fault_for(&target) {
            sink.fail(status);
            return Ok(());
        }
        if self.is_silent(&target) {
            return Ok(());
        }

        match request {
            Request::Get { key } => self.execute_get(&key, &sink),
            Request::Store {
                key,
                value,
                expiry,
                mode,
            } => self.execute_store(&key, value, expiry, mode, &sink),
            Request::Stat { group } => self.execute_stat(group.as_deref(), &sink),
            Request::View { path, post } => {
                // Parsed above
                if let Some(parsed) = ViewPath::parse(&path) {
                    self.execute_view(&parsed, post.as_deref(), &sink);
                }
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            sweeper.stop();
        }
        info!(bucket = %self.bucket, "in-process cluster destroyed");
    }
}

/// View query parameters.
#[derive(Debug, Default)]
struct ViewQuery {
    limit: Option<usize>,
    skip: usize,
    descending: bool,
    key: Option<Value>,
    keys: Option<Vec<Value>>,
}

impl ViewQuery {
    fn from_path(path: &ViewPath, post: Option<&str>) -> Result<ViewQuery, Value> {
        let mut query = ViewQuery::default();

        if let Some(limit) = path.param("limit") {
            query.limit = Some(parse_integer("limit", limit)?);
        }
        if let Some(skip) = path.param("skip") {
            query.skip = parse_integer("skip", skip)?;
        }
        if let Some(descending) = path.param("descending") {
            query.descending = match descending {
                "" | "true" => true,
                "false" => false,
                other => {
                    return Err(query_error(format!(
                        "Invalid boolean parameter: descending={}",
                        other
                    )))
                }
            };
        }
        if let Some(key) = path.param("key") {
            let key = serde_json::from_str(key)
                .map_err(|_| query_error(format!("Invalid JSON for parameter: key={}", key)))?;
            query.key = Some(key);
        }

        if let Some(post) = post {
            let body: Value = serde_json::from_str(post).map_err(|e| bad_request(e.to_string()))?;
            match body.get("keys") {
                Some(Value::Array(keys)) => query.keys = Some(keys.clone()),
                Some(_) => return Err(bad_request("`keys` member must be an array.".to_string())),
                None => {}
            }
        }

        Ok(query)
    }

    fn matches(&self, key: &Value) -> bool {
        if let Some(wanted) = &self.key {
            if wanted != key {
                return false;
            }
        }
        match &self.keys {
            Some(keys) => keys.contains(key),
            None => true,
        }
    }
}

fn parse_integer(name: &str, value: &str) -> Result<usize, Value> {
    value.parse().map_err(|_| {
        query_error(format!(
            "Invalid value for integer parameter: {}={}",
            name, value
        ))
    })
}

fn query_error(reason: String) -> Value {
    json!({"error": "query_parse_error", "reason": reason})
}

fn bad_request(reason: String) -> Value {
    json!({"error": "bad_request", "reason": reason})
}

/// View collation: null < false < true < numbers < strings < arrays < objects.
pub fn collate(a: &Value, b: &Value) -> CmpOrdering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| collate(x, y))
            .find(|ord| ord.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((xk, xv), (yk, yv))| xk.cmp(yk).then_with(|| collate(xv, yv)))
            .find(|ord| ord.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}
