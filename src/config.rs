use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub fetcher: FetcherConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub otlp_grpc: OtlpGrpcConfig,
    #[serde(default)]
    pub exporters: ExportersConfig,
    #[serde(default)]
    pub audit_log: AuditLogConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
            otlp_grpc: OtlpGrpcConfig::default(),
            exporters: ExportersConfig::default(),
            audit_log: AuditLogConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            stdout: default_log_stdout(),
            file: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtlpGrpcConfig {
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otlp_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OtlpGrpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_otlp_endpoint(),
            timeout_ms: default_otlp_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExportersConfig {
    #[serde(default = "default_metrics_exporter")]
    pub metrics: String,
}

impl Default for ExportersConfig {
    fn default() -> Self {
        Self {
            metrics: default_metrics_exporter(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuditLogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_audit_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            max_file_bytes: default_audit_max_file_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub audience: String,
    #[serde(default = "default_auth_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer: String::new(),
            audience: String::new(),
            cache_ttl_ms: default_auth_cache_ttl_ms(),
        }
    }
}

impl AuthConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ratelimit_backend")]
    pub backend: String,
    #[serde(default = "default_redis_address")]
    pub redis_address: String,
    #[serde(default)]
    pub default: LimitConfig,
    #[serde(default)]
    pub groups: HashMap<String, LimitConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: default_ratelimit_backend(),
            redis_address: default_redis_address(),
            default: LimitConfig::default(),
            groups: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LimitConfig {
    #[serde(default = "default_limit_requests")]
    pub requests: i64,
    #[serde(default = "default_limit_window_ms")]
    pub window_ms: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            requests: default_limit_requests(),
            window_ms: default_limit_window_ms(),
        }
    }
}

impl LimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    #[serde(default)]
    pub providers: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    pub target_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FetcherConfig {
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl FetcherConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl Config {
    pub fn load() -> Result<Self, String> {
        let path = std::env::var("CONFIG_PATH")
            .map_err(|_| "CONFIG_PATH is required".to_string())?;
        let content = fs::read_to_string(&path)
            .map_err(|e| format!("CONFIG_PATH read error: {}", e))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, String> {
        let expanded = expand_env(content);
        let mut config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| format!("invalid yaml: {}", e))?;
        config.normalize()?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    fn normalize(&mut self) -> Result<(), String> {
        self.observability.logging.level = self.observability.logging.level.to_lowercase();
        self.observability.logging.format = self.observability.logging.format.to_lowercase();
        match self.observability.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(format!("logging.level invalid: {}", other)),
        }
        match self.observability.logging.format.as_str() {
            "text" | "json" => {}
            other => return Err(format!("logging.format invalid: {}", other)),
        }
        match self.observability.exporters.metrics.as_str() {
            "otlp_grpc" | "none" => {}
            other => return Err(format!("exporters.metrics invalid: {}", other)),
        }
        match self.ratelimit.backend.as_str() {
            "memory" | "redis" => {}
            other => return Err(format!("ratelimit.backend invalid: {}", other)),
        }
        if self.auth.enabled {
            if self.auth.issuer.trim().is_empty() {
                return Err("auth.issuer is required when auth is enabled".to_string());
            }
            if self.auth.audience.trim().is_empty() {
                return Err("auth.audience is required when auth is enabled".to_string());
            }
        }
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err("provider.name must not be empty".to_string());
            }
            if provider.enabled && provider.target_url.trim().is_empty() {
                return Err(format!("provider {} has no target_url", provider.name));
            }
        }
        Ok(())
    }
}

/// Replaces `${VAR}` references with the value of the environment variable,
/// or the empty string when unset.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Ok(value) = std::env::var(name) {
                    out.push_str(&value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_service_name() -> String {
    "llm-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_stdout() -> bool {
    true
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otlp_timeout_ms() -> u64 {
    3000
}

fn default_metrics_exporter() -> String {
    "none".to_string()
}

fn default_audit_max_file_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_auth_cache_ttl_ms() -> u64 {
    300_000
}

fn default_ratelimit_backend() -> String {
    "memory".to_string()
}

fn default_redis_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_limit_requests() -> i64 {
    60
}

fn default_limit_window_ms() -> u64 {
    60_000
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_refresh_interval_ms() -> u64 {
    600_000
}
