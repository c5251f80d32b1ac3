use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => true,
        Some("0") | Some("false") | Some("FALSE") | Some("no") => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub aws: AwsConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `GREENOPS_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("GREENOPS_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        let store = StoreConfig::from_env_profiled(p);
        let queue = QueueConfig::from_env_profiled(p);
        let all_local =
            store.backend == StoreBackend::Memory && queue.backend == QueueBackend::Memory;
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            worker: WorkerConfig::from_env_profiled(p, all_local),
            store,
            queue,
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:  {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  aws:     region={}, endpoint={}",
            self.aws.region,
            self.aws.endpoint_url.as_deref().unwrap_or("(default)")
        );
        tracing::info!(
            "  store:   backend={}, table={}, ttl_days={}",
            self.store.backend,
            self.store.table_name,
            self.store.ttl_days
        );
        let queue_url = if self.queue.queue_url.is_empty() {
            "(none)"
        } else {
            &self.queue.queue_url
        };
        tracing::info!("  queue:   backend={}, url={}", self.queue.backend, queue_url);
        tracing::info!(
            "  worker:  concurrency={}, embedded={}, analyzers={}",
            self.worker.concurrency,
            self.worker.embedded,
            self.worker.analyzer_urls.len() + usize::from(self.worker.analyzer_url.is_some())
        );
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "PORT", 3001),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
        }
    }
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "eu-west-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    /// Endpoint override normalized to carry a scheme.
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint_url
            .as_deref()
            .filter(|e| !e.is_empty())
            .map(|e| {
                if e.starts_with("http://") || e.starts_with("https://") {
                    e.to_string()
                } else {
                    format!("https://{e}")
                }
            })
    }
}

// ── Job store ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    DynamoDb,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::DynamoDb => write!(f, "dynamodb"),
        }
    }
}

/// Upper bound on `JOB_TTL_DAYS` (ten years).
pub const MAX_JOB_TTL_DAYS: u32 = 3650;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub table_name: String,
    pub ttl_days: u32,
    /// How often the in-memory store sweeps expired jobs.
    pub sweep_interval_secs: u64,
}

impl StoreConfig {
    fn from_env_profiled(p: &str) -> Self {
        let backend = match profiled_env_or(p, "STORE_BACKEND", "memory").to_lowercase().as_str() {
            "dynamodb" | "dynamo" => StoreBackend::DynamoDb,
            _ => StoreBackend::Memory,
        };
        Self {
            backend,
            table_name: profiled_env_or(p, "JOBS_TABLE", "jobs"),
            ttl_days: profiled_env_u32(p, "JOB_TTL_DAYS", 7).clamp(1, MAX_JOB_TTL_DAYS),
            sweep_interval_secs: profiled_env_u64(p, "STORE_SWEEP_INTERVAL_SECS", 300),
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.ttl_days.clamp(1, MAX_JOB_TTL_DAYS)))
    }
}

// ── Work queue ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    Sqs,
}

impl std::fmt::Display for QueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueBackend::Memory => write!(f, "memory"),
            QueueBackend::Sqs => write!(f, "sqs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub queue_url: String,
    pub dlq_url: Option<String>,
    pub visibility_timeout_secs: u32,
    pub max_batch_size: u32,
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        let backend = match profiled_env_or(p, "QUEUE_BACKEND", "memory").to_lowercase().as_str() {
            "sqs" => QueueBackend::Sqs,
            _ => QueueBackend::Memory,
        };
        Self {
            backend,
            queue_url: profiled_env_or(p, "QUEUE_URL", ""),
            dlq_url: profiled_env_opt(p, "DLQ_URL"),
            visibility_timeout_secs: profiled_env_u32(p, "QUEUE_VISIBILITY_TIMEOUT_SECS", 180),
            max_batch_size: profiled_env_u32(p, "QUEUE_MAX_BATCH_SIZE", 10),
            poll_interval_ms: profiled_env_u64(p, "QUEUE_POLL_INTERVAL_MS", 1000),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.visibility_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ── Worker pool ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Overall deadline for one work item, analyzer call and recording included.
    pub invocation_timeout_secs: u64,
    /// Inner deadline for the analyzer call alone.
    pub analyzer_timeout_secs: u64,
    /// Default analyzer endpoint for every item type.
    pub analyzer_url: Option<String>,
    /// Per-type overrides from `ANALYZER_URL_<TYPE>`.
    pub analyzer_urls: BTreeMap<String, String>,
    /// Record a degraded result instead of a failure when analysis errors.
    pub analyzer_fallback: bool,
    /// Run the worker pool inside the server process.
    pub embedded: bool,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str, all_local: bool) -> Self {
        Self {
            concurrency: profiled_env_u32(p, "WORKER_CONCURRENCY", 5).max(1) as usize,
            invocation_timeout_secs: profiled_env_u64(p, "WORKER_INVOCATION_TIMEOUT_SECS", 120),
            analyzer_timeout_secs: profiled_env_u64(p, "ANALYZER_TIMEOUT_SECS", 45),
            analyzer_url: profiled_env_opt(p, "ANALYZER_URL"),
            analyzer_urls: analyzer_overrides(p),
            analyzer_fallback: profiled_env_bool(p, "ANALYZER_FALLBACK", true),
            embedded: profiled_env_bool(p, "EMBEDDED_WORKERS", all_local),
        }
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    pub fn analyzer_timeout(&self) -> Duration {
        Duration::from_secs(self.analyzer_timeout_secs)
    }
}

/// Collect `ANALYZER_URL_<TYPE>` (or `{PROFILE}_ANALYZER_URL_<TYPE>`) overrides.
/// Profiled keys win over plain ones.
fn analyzer_overrides(profile: &str) -> BTreeMap<String, String> {
    const KEY: &str = "ANALYZER_URL_";
    let mut plain = BTreeMap::new();
    let mut profiled = BTreeMap::new();
    let profiled_prefix = format!("{}_{}", profile, KEY);

    for (key, value) in env::vars() {
        if value.is_empty() {
            continue;
        }
        if !profile.is_empty() {
            if let Some(ty) = key.strip_prefix(&profiled_prefix) {
                profiled.insert(ty.to_lowercase(), value);
                continue;
            }
        }
        if let Some(ty) = key.strip_prefix(KEY) {
            plain.insert(ty.to_lowercase(), value);
        }
    }

    plain.extend(profiled);
    plain
}
