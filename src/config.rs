use std::time::Duration;

#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

/// where cached manifests and segments live
#[derive(clap::ValueEnum, Clone, Debug, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis,
}

// what a set top box player says it is, the origin's anti bot layer is fine with it
pub const DEFAULT_USER_AGENT: &str = "VLC/3.0.20 LibVLC/3.0.20";

#[derive(clap::Parser, Clone, Debug)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum, default_value = "development")]
    pub cargo_env: CargoEnv,

    // port that the proxy will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // stats, health and metrics get their own port so they never compete with viewers
    #[clap(long, env, default_value = "5001")]
    pub stats_port: u16,

    // path the proxy is mounted on, rewritten manifests point back at it
    #[clap(long, env, default_value = "/proxy")]
    pub proxy_path: String,

    // optional absolute prefix like https://edge.example.com for rewritten urls, leave empty to
    // keep them relative to whatever host the player used
    #[clap(long, env)]
    pub public_url: Option<String>,

    #[clap(long, env, value_enum, default_value = "memory")]
    pub cache_backend: CacheBackend,

    // redis url for the connection, only needed with the redis backend
    #[clap(long, env)]
    pub redis_url: Option<String>,

    #[clap(long, env, default_value = "5")]
    pub manifest_ttl_secs: u64,

    #[clap(long, env, default_value = "10")]
    pub segment_ttl_secs: u64,

    // anything bigger is streamed straight through without touching the cache
    #[clap(long, env, default_value = "33554432")]
    pub max_cached_segment_bytes: u64,

    #[clap(long, env, default_value = "3")]
    pub upstream_max_retries: u32,

    // comma seperated, like 2,4,8
    #[clap(long, env, value_delimiter = ',', default_value = "2,4,8")]
    pub upstream_backoff_secs: Vec<u64>,

    #[clap(long, env, value_delimiter = ',', default_value = "503,509")]
    pub upstream_retry_statuses: Vec<u16>,

    #[clap(long, env, default_value = "60")]
    pub upstream_timeout_secs: u64,

    // hard cap over every attempt and backoff, off by default
    #[clap(long, env)]
    pub upstream_deadline_secs: Option<u64>,

    #[clap(long, env, default_value = DEFAULT_USER_AGENT)]
    pub upstream_user_agent: String,

    // only used to build a Referer when a segment url doesn't carry /<user>/<pass>/ itself
    #[clap(long, env)]
    pub upstream_username: Option<String>,

    #[clap(long, env)]
    pub upstream_password: Option<String>,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl AppConfig {
    /// catch the mistakes clap can't, a bad proxy path would panic the router later
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.proxy_path.starts_with('/') || self.proxy_path.contains(['?', '#']) {
            anyhow::bail!("PROXY_PATH must be an absolute path, got {}", self.proxy_path);
        }
        if self.port == self.stats_port {
            anyhow::bail!("PORT and STATS_PORT must differ");
        }
        if self.cache_backend == CacheBackend::Redis && self.redis_url.is_none() {
            anyhow::bail!("REDIS_URL is required for the redis cache backend");
        }
        Ok(())
    }

    pub fn manifest_ttl(&self) -> Duration {
        Duration::from_secs(self.manifest_ttl_secs)
    }

    pub fn segment_ttl(&self) -> Duration {
        Duration::from_secs(self.segment_ttl_secs)
    }

    /// prefix used in front of `?url=` in everything the proxy hands back to a player
    pub fn proxy_base(&self) -> String {
        let public = self
            .public_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or("");
        format!("{}{}", public, self.proxy_path)
    }
}

impl Default for AppConfig {
    // mirrors the clap defaults, mostly handy for tests
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            stats_port: 5001,
            proxy_path: "/proxy".to_string(),
            public_url: None,
            cache_backend: CacheBackend::Memory,
            redis_url: None,
            manifest_ttl_secs: 5,
            segment_ttl_secs: 10,
            max_cached_segment_bytes: 32 * 1024 * 1024,
            upstream_max_retries: 3,
            upstream_backoff_secs: vec![2, 4, 8],
            upstream_retry_statuses: vec![503, 509],
            upstream_timeout_secs: 60,
            upstream_deadline_secs: None,
            upstream_user_agent: DEFAULT_USER_AGENT.to_string(),
            upstream_username: None,
            upstream_password: None,
            sentry_dsn: None,
        }
    }
}

/// everything the upstream client is allowed to be told, nothing else gets through
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
    pub retry_statuses: Vec<u16>,
    pub deadline: Option<Duration>,
    pub user_agent: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpstreamConfig {
    /// delay before retry number `retry` (1 based), the last step repeats if the schedule is
    /// shorter than the retry count
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if self.backoff.is_empty() {
            return Duration::ZERO;
        }
        let idx = (retry.saturating_sub(1) as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }

    pub fn is_retry_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for UpstreamConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.upstream_timeout_secs),
            max_retries: config.upstream_max_retries,
            backoff: config
                .upstream_backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            retry_statuses: config.upstream_retry_statuses.clone(),
            deadline: config.upstream_deadline_secs.map(Duration::from_secs),
            user_agent: config.upstream_user_agent.clone(),
            username: config.upstream_username.clone(),
            password: config.upstream_password.clone(),
        }
    }
}
