//! Configuration module for the gateway
//!
//! CLI arguments (with environment variable support) select the config
//! file and performance tunables; listener topology comes from a TOML
//! config file. Engines only ever see immutable snapshots.

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// CLI arguments for the gateway
///
/// Supports environment variables with GATEWAY_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Self-hosted network access gateway")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Path to the TOML configuration file
    #[arg(
        long = "config_file",
        short = 'c',
        env = "GATEWAY_CONFIG_FILE",
        default_value = "gateway.toml"
    )]
    pub config_file: PathBuf,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "GATEWAY_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(long, env = "GATEWAY_CONN_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub conn_idle_timeout: Duration,

    /// TCP connect timeout to backend servers (default: 5s)
    #[arg(long, env = "GATEWAY_TCP_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub tcp_connect_timeout: Duration,

    /// TLS handshake timeout (default: 10s)
    #[arg(long, env = "GATEWAY_TLS_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tls_handshake_timeout: Duration,

    /// Buffer size for data transfer in bytes (default: 32KB)
    #[arg(long, env = "GATEWAY_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// Maximum accumulated size of an HTTP request head (default: 1MB)
    #[arg(long, env = "GATEWAY_MAX_HEADER_SIZE", default_value_t = 1024 * 1024, help_heading = "Performance")]
    pub max_header_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "GATEWAY_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "GATEWAY_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!(
                "Config file not found: {}",
                self.config_file.display()
            ));
        }
        if self.conn_idle_timeout.is_zero() {
            return Err(anyhow!("conn_idle_timeout must be greater than 0"));
        }
        if self.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }
        if self.max_header_size == 0 {
            return Err(anyhow!("max_header_size must be greater than 0"));
        }
        Ok(())
    }
}

/// Connection performance configuration shared by all listeners
#[derive(Debug, Clone, Copy)]
pub struct ConnTuning {
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// TLS handshake timeout
    pub tls_handshake_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// Maximum accumulated HTTP request head size
    pub max_header_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl ConnTuning {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.conn_idle_timeout,
            connect_timeout: cli.tcp_connect_timeout,
            tls_handshake_timeout: cli.tls_handshake_timeout,
            buffer_size: cli.buffer_size,
            max_header_size: cli.max_header_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
        }
    }
}

impl Default for ConnTuning {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(10),
            buffer_size: 32 * 1024,
            max_header_size: 1024 * 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_blacklist_minutes() -> u32 {
    1440
}

fn default_true() -> bool {
    true
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

/// One auth rule: the proxy watches the backend's answer to a matching
/// request and treats the expected status as authorization success.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AuthRule {
    /// HTTP method, e.g. "POST"
    pub method: String,
    /// Path prefix; "/" requires an exact match
    pub target: String,
    /// Expected backend status code
    pub result: u16,
}

/// One routable site inside an HTTP reverse proxy listener
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site name (for logging)
    #[serde(default)]
    pub name: String,
    /// Domain used as the routing key (Host header, port stripped)
    pub domain: String,
    /// Backend host
    pub host: String,
    /// Backend port
    pub port: u16,
    /// Suppress the body of responses to HEAD requests
    #[serde(default)]
    pub skip_body_for_head_response: bool,
    /// Whether the auth rules are consulted at all
    #[serde(default)]
    pub requires_auth: bool,
    /// Ordered auth rules
    #[serde(default)]
    pub auth_rules: Vec<AuthRule>,
    /// Header rewrite rules: field name -> template string, applied in
    /// field-name order
    #[serde(default)]
    pub set_headers: BTreeMap<String, String>,
    /// Free-form proxy options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl SiteConfig {
    /// A site with no auth rules and no rewrite rules downgrades to a raw
    /// TCP splice after the first exchange.
    pub fn is_plain_passthrough(&self) -> bool {
        (!self.requires_auth || self.auth_rules.is_empty()) && self.set_headers.is_empty()
    }

    /// Whether auth rules apply to this site
    pub fn auth_enabled(&self) -> bool {
        self.requires_auth && !self.auth_rules.is_empty()
    }
}

/// HTTP reverse proxy listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpProxyConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    /// "http" or "https"
    pub protocol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    pub listen_port: u16,
    /// Blacklist duration once an IP exceeds the failure threshold
    #[serde(default = "default_blacklist_minutes")]
    pub ip_blacklist_minutes: u32,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Routable sites, keyed by domain at lookup time
    #[serde(default, rename = "site")]
    pub sites: Vec<SiteConfig>,
}

impl HttpProxyConfig {
    pub fn is_https(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("https")
    }

    /// Build the domain lookup map. Later duplicates are ignored.
    pub fn site_map(&self) -> HashMap<String, Arc<SiteConfig>> {
        let mut map = HashMap::with_capacity(self.sites.len());
        for site in &self.sites {
            map.entry(site.domain.clone())
                .or_insert_with(|| Arc::new(site.clone()));
        }
        map
    }
}

/// One username/password credential with optional expiry
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Unix epoch seconds; 0 means no expiry
    #[serde(default)]
    pub expires_at: u64,
}

/// Credential store: username -> (password, expiry). Expired entries are
/// treated as absent at lookup time; nothing purges them.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: HashMap<String, Credential>,
}

impl CredentialStore {
    pub fn from_credentials(creds: &[Credential]) -> Self {
        let mut entries = HashMap::with_capacity(creds.len());
        for cred in creds {
            entries.insert(cred.username.clone(), cred.clone());
        }
        Self { entries }
    }

    /// Check a username/password pair, honoring expiry
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.verify_at(username, password, SystemTime::now())
    }

    fn verify_at(&self, username: &str, password: &str, now: SystemTime) -> bool {
        let Some(cred) = self.entries.get(username) else {
            return false;
        };
        if cred.password != password {
            return false;
        }
        if cred.expires_at == 0 {
            return true;
        }
        let now_secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now_secs < cred.expires_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// SOCKS5 reverse proxy listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Socks5ProxyConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    pub listen_port: u16,
    #[serde(default = "default_blacklist_minutes")]
    pub ip_blacklist_minutes: u32,
    /// Supported SOCKS5 auth methods (0 = none, 2 = username/password)
    #[serde(default)]
    pub supported_methods: Vec<u8>,
    /// Credentials for username/password auth
    #[serde(default, rename = "user")]
    pub users: Vec<Credential>,
}

/// One supervised process
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Process supervisor configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SupervisorConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub auto_start_process: bool,
    #[serde(default)]
    pub stop_process_when_exit: bool,
    /// Milliseconds to wait for graceful exit before a hard kill
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_process_timeout: u64,
    #[serde(default, rename = "process")]
    pub process_list: Vec<ProcessConfig>,
}

/// Top-level gateway configuration loaded from TOML
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default, rename = "http_proxy")]
    pub http_proxies: Vec<HttpProxyConfig>,
    #[serde(default, rename = "socks5_proxy")]
    pub socks5_proxies: Vec<Socks5ProxyConfig>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl GatewayConfig {
    /// Parse from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
        Self::from_toml(&content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for proxy in &self.http_proxies {
            if !proxy.enable {
                continue;
            }
            if proxy.listen_port == 0 {
                return Err(anyhow!("http_proxy '{}': listen_port is required", proxy.name));
            }
            if !proxy.protocol.eq_ignore_ascii_case("http")
                && !proxy.protocol.eq_ignore_ascii_case("https")
            {
                return Err(anyhow!(
                    "http_proxy '{}': protocol must be 'http' or 'https', got '{}'",
                    proxy.name,
                    proxy.protocol
                ));
            }
            if proxy.is_https() && (proxy.cert_file.is_none() || proxy.key_file.is_none()) {
                return Err(anyhow!(
                    "http_proxy '{}': https requires cert_file and key_file",
                    proxy.name
                ));
            }
            for site in &proxy.sites {
                if site.domain.is_empty() {
                    return Err(anyhow!("http_proxy '{}': site domain is required", proxy.name));
                }
                if site.host.is_empty() || site.port == 0 {
                    return Err(anyhow!(
                        "http_proxy '{}': site '{}' needs backend host and port",
                        proxy.name,
                        site.domain
                    ));
                }
            }
        }
        for proxy in &self.socks5_proxies {
            if !proxy.enable {
                continue;
            }
            if proxy.listen_port == 0 {
                return Err(anyhow!(
                    "socks5_proxy '{}': listen_port is required",
                    proxy.name
                ));
            }
        }
        for process in &self.supervisor.process_list {
            if process.name.is_empty() {
                return Err(anyhow!("supervisor process name is required"));
            }
        }
        Ok(())
    }
}

/// Holder of the live config snapshot. Engines clone immutable pieces at
/// startup; `replace` swaps the whole structure for later listeners.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Arc<GatewayConfig>>>,
}

impl ConfigStore {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<GatewayConfig> {
        Arc::clone(&*self.inner.read().await)
    }

    /// Replace the whole configuration snapshot
    pub async fn replace(&self, config: GatewayConfig) {
        *self.inner.write().await = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[http_proxy]]
protocol = "http"
name = "web"
listen_port = 8080

[[http_proxy.site]]
domain = "app.example.com"
host = "127.0.0.1"
port = 3000
requires_auth = true

[[http_proxy.site.auth_rules]]
method = "POST"
target = "/api/login"
result = 200

[http_proxy.site.set_headers]
Host = "$http_host"
X-Real-IP = "$remote_addr"

[[socks5_proxy]]
name = "socks"
listen_port = 1080
supported_methods = [2]

[[socks5_proxy.user]]
username = "alice"
password = "secret"

[supervisor]
auto_start_process = true

[[supervisor.process]]
name = "media"
path = "/usr/bin/mediasrv"
args = ["--quiet"]
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = GatewayConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.http_proxies.len(), 1);
        assert_eq!(config.socks5_proxies.len(), 1);
        assert_eq!(config.supervisor.process_list.len(), 1);

        let proxy = &config.http_proxies[0];
        assert_eq!(proxy.listen_port, 8080);
        assert!(!proxy.is_https());
        assert_eq!(proxy.sites.len(), 1);

        let site = &proxy.sites[0];
        assert_eq!(site.domain, "app.example.com");
        assert_eq!(site.auth_rules.len(), 1);
        assert_eq!(site.auth_rules[0].result, 200);
        assert_eq!(site.set_headers.len(), 2);
        assert!(site.auth_enabled());
        assert!(!site.is_plain_passthrough());
    }

    #[test]
    fn test_site_map_lookup() {
        let config = GatewayConfig::from_toml(SAMPLE).unwrap();
        let map = config.http_proxies[0].site_map();
        assert!(map.contains_key("app.example.com"));
        assert!(!map.contains_key("other.example.com"));
    }

    #[test]
    fn test_plain_passthrough_site() {
        let site = SiteConfig {
            name: String::new(),
            domain: "plain.example.com".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            skip_body_for_head_response: false,
            requires_auth: false,
            auth_rules: vec![],
            set_headers: BTreeMap::new(),
            options: BTreeMap::new(),
        };
        assert!(site.is_plain_passthrough());
        assert!(!site.auth_enabled());
    }

    #[test]
    fn test_requires_auth_without_rules_is_passthrough() {
        // requires_auth with an empty rule list behaves like no auth at all
        let site = SiteConfig {
            name: String::new(),
            domain: "x.example.com".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            skip_body_for_head_response: false,
            requires_auth: true,
            auth_rules: vec![],
            set_headers: BTreeMap::new(),
            options: BTreeMap::new(),
        };
        assert!(site.is_plain_passthrough());
        assert!(!site.auth_enabled());
    }

    #[test]
    fn test_validate_rejects_https_without_cert() {
        let toml_str = r#"
[[http_proxy]]
protocol = "https"
listen_port = 8443
"#;
        assert!(GatewayConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_protocol() {
        let toml_str = r#"
[[http_proxy]]
protocol = "ftp"
listen_port = 8080
"#;
        assert!(GatewayConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let toml_str = r#"
[[socks5_proxy]]
name = "socks"
listen_port = 0
"#;
        assert!(GatewayConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_validate_skips_disabled_listeners() {
        let toml_str = r#"
[[http_proxy]]
enable = false
protocol = "ftp"
listen_port = 0
"#;
        assert!(GatewayConfig::from_toml(toml_str).is_ok());
    }

    #[test]
    fn test_credential_store_verify() {
        let store = CredentialStore::from_credentials(&[Credential {
            username: "alice".to_string(),
            password: "secret".to_string(),
            expires_at: 0,
        }]);
        assert!(store.verify("alice", "secret"));
        assert!(!store.verify("alice", "wrong"));
        assert!(!store.verify("bob", "secret"));
    }

    #[test]
    fn test_credential_store_expiry() {
        let now = SystemTime::now();
        let now_secs = now.duration_since(UNIX_EPOCH).unwrap().as_secs();
        let store = CredentialStore::from_credentials(&[
            Credential {
                username: "fresh".to_string(),
                password: "pw".to_string(),
                expires_at: now_secs + 3600,
            },
            Credential {
                username: "stale".to_string(),
                password: "pw".to_string(),
                expires_at: now_secs.saturating_sub(3600),
            },
        ]);
        assert!(store.verify_at("fresh", "pw", now));
        // Expired entries are treated as absent
        assert!(!store.verify_at("stale", "pw", now));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("120").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_conn_tuning_defaults() {
        let tuning = ConnTuning::default();
        assert_eq!(tuning.idle_timeout, Duration::from_secs(300));
        assert_eq!(tuning.buffer_size, 32 * 1024);
        assert!(tuning.tcp_nodelay);
    }

    #[tokio::test]
    async fn test_config_store_replace() {
        let store = ConfigStore::new(GatewayConfig::default());
        assert!(store.snapshot().await.http_proxies.is_empty());

        let replacement = GatewayConfig::from_toml(SAMPLE).unwrap();
        store.replace(replacement).await;
        assert_eq!(store.snapshot().await.http_proxies.len(), 1);
    }

    #[test]
    fn test_default_blacklist_minutes() {
        let toml_str = r#"
[[socks5_proxy]]
name = "socks"
listen_port = 1080
"#;
        let config = GatewayConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.socks5_proxies[0].ip_blacklist_minutes, 1440);
    }
}
