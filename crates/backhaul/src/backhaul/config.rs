use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::backhaul::{
    backoff::{DEFAULT_RETRY_DELAY, RetryPolicy},
    client::local::LocalOptions,
    server::{
        client::DEFAULT_GRACE, ingress::DEFAULT_HANDSHAKE_TIMEOUT, pool::DEFAULT_MAX_TCP_SOCKETS,
    },
};

pub const CONFIG_ENV: &str = "BACKHAUL_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Pick the config file: `--config`, then `$BACKHAUL_CONFIG`, then `backhaul.*` in the
/// working directory, then the OS default location.
pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    resolve_config_path_in(flag, std::env::var_os(CONFIG_ENV).map(PathBuf::from), Path::new("."))
}

fn resolve_config_path_in(
    flag: Option<PathBuf>,
    env: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = env.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(cwd) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("backhaul.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["backhaul.toml", "backhaul.yaml", "backhaul.yml"]
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/backhaul/backhaul.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "backhaul", "backhaul")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("backhaul.toml"))
    }
}

/// Write the commented template to `path` unless a file is already there.
///
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = template_for_path(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        other => anyhow::bail!(
            "config: unsupported config extension {other:?} (expected .toml or .yaml/.yml)"
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension_of(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    /// Prometheus scrape listener; disabled when empty.
    pub metrics_addr: String,
    pub server: ServerConfig,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub domains: Vec<String>,
    pub secure: bool,
    /// Shared ingress port; dedicated per-tunnel ports when unset.
    pub tunnel_port: Option<u16>,
    pub tunnel_bind: String,
    pub max_tcp_sockets: usize,
    pub bind_host: String,
    pub grace: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":8080".into(),
            domains: vec![],
            secure: false,
            tunnel_port: None,
            tunnel_bind: "0.0.0.0".into(),
            max_tcp_sockets: DEFAULT_MAX_TCP_SOCKETS,
            bind_host: "0.0.0.0".into(),
            grace: DEFAULT_GRACE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub subdomain: Option<String>,
    /// Set when the operator named a local host; also enables the Host rewrite.
    pub local_host: Option<String>,
    pub local: LocalOptions,
    pub headers: BTreeMap<String, String>,
    pub print_requests: bool,
    pub retry: RetryPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    #[serde(default)]
    metrics_addr: String,
    server: Option<FileServer>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    domains: Option<StringOrVec>,
    #[serde(default)]
    secure: bool,
    tunnel_port: Option<u16>,
    tunnel_bind: Option<String>,
    max_tcp_sockets: Option<i64>,
    bind_host: Option<String>,
    grace_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    host: Option<String>,
    subdomain: Option<String>,
    local_host: Option<String>,
    local_port: Option<u16>,
    #[serde(default)]
    local_https: bool,
    local_cert: Option<String>,
    local_key: Option<String>,
    local_ca: Option<String>,
    #[serde(default)]
    allow_invalid_cert: bool,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    print_requests: bool,
    retry: Option<FileRetry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRetry {
    strategy: Option<String>,
    delay_ms: Option<i64>,
    initial_ms: Option<i64>,
    max_ms: Option<i64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => default,
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            if let Some(level) = non_empty(l.level) {
                logging.level = level;
            }
            if let Some(format) = non_empty(l.format) {
                logging.format = format.to_ascii_lowercase();
            }
            if let Some(output) = non_empty(l.output) {
                logging.output = output;
            }
            logging.add_source = l.add_source;
        }

        let mut server = ServerConfig::default();
        if let Some(s) = fc.server {
            if let Some(addr) = non_empty(s.listen_addr) {
                server.listen_addr = addr;
            }
            server.domains = s
                .domains
                .map(StringOrVec::into_vec)
                .unwrap_or_default()
                .into_iter()
                .map(|d| d.trim().trim_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
            server.secure = s.secure;
            server.tunnel_port = s.tunnel_port.filter(|p| *p != 0);
            if let Some(bind) = non_empty(s.tunnel_bind) {
                server.tunnel_bind = bind;
            }
            if let Some(n) = s.max_tcp_sockets {
                if n <= 0 {
                    anyhow::bail!("config: server.max_tcp_sockets must be positive (got {n})");
                }
                server.max_tcp_sockets = n as usize;
            }
            if let Some(host) = non_empty(s.bind_host) {
                server.bind_host = host;
            }
            server.grace = millis(s.grace_ms, DEFAULT_GRACE);
            server.handshake_timeout = millis(s.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT);
        }

        let client = fc.client.map(ClientConfig::from_file).transpose()?;

        Ok(Config {
            logging,
            metrics_addr: fc.metrics_addr.trim().to_string(),
            server,
            client,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            metrics_addr: String::new(),
            server: ServerConfig::default(),
            client: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:8080".into(),
            subdomain: None,
            local_host: None,
            local: LocalOptions {
                host: "localhost".into(),
                port: 80,
                ..LocalOptions::default()
            },
            headers: BTreeMap::new(),
            print_requests: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    fn from_file(c: FileClient) -> anyhow::Result<ClientConfig> {
        let host = non_empty(c.host).unwrap_or_else(|| "http://localhost:8080".to_string());
        let local_host = non_empty(c.local_host);
        let retry = c.retry.map(retry_policy).transpose()?.unwrap_or_default();

        Ok(ClientConfig {
            host,
            subdomain: non_empty(c.subdomain),
            local: LocalOptions {
                host: local_host.clone().unwrap_or_else(|| "localhost".to_string()),
                port: c.local_port.unwrap_or(80),
                https: c.local_https,
                cert_file: non_empty(c.local_cert),
                key_file: non_empty(c.local_key),
                ca_file: non_empty(c.local_ca),
                allow_invalid_cert: c.allow_invalid_cert,
            },
            local_host,
            headers: c.headers,
            print_requests: c.print_requests,
            retry,
        })
    }
}

fn retry_policy(r: FileRetry) -> anyhow::Result<RetryPolicy> {
    let strategy = r
        .strategy
        .unwrap_or_else(|| "constant".into())
        .trim()
        .to_ascii_lowercase();
    match strategy.as_str() {
        "constant" | "" => Ok(RetryPolicy::Constant {
            delay: millis(r.delay_ms, DEFAULT_RETRY_DELAY),
            max_attempts: r.max_attempts,
        }),
        "exponential" => {
            let initial = millis(r.initial_ms.or(r.delay_ms), DEFAULT_RETRY_DELAY);
            let max = millis(r.max_ms, Duration::from_secs(60)).max(initial);
            Ok(RetryPolicy::Exponential {
                initial,
                max,
                max_attempts: r.max_attempts,
            })
        }
        other => anyhow::bail!(
            "config: client.retry.strategy {other:?} (expected \"constant\" or \"exponential\")"
        ),
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# backhaul configuration (auto-generated)
#
# This file was created because backhaul could not find a configuration file at
# the resolved config path. `backhaul server` reads [server]; `backhaul client`
# reads [client].

# metrics_addr = ":9100"

[logging]
level = "info"
format = "text" # text | json
output = "stderr" # stderr | stdout | discard | /path/to/file
add_source = false

[server]
listen_addr = ":8080"
# domains = ["tunnel.example.com"]
secure = false
# tunnel_port = 7000 # one shared port for all tunnels instead of one port each
max_tcp_sockets = 10
bind_host = "0.0.0.0"
grace_ms = 1000
handshake_timeout_ms = 5000

[client]
host = "http://localhost:8080"
# subdomain = "myapp"
local_port = 3000
# local_host = "localhost"
local_https = false
allow_invalid_cert = false
print_requests = false

[client.retry]
strategy = "constant" # constant | exponential
delay_ms = 1000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# backhaul configuration (auto-generated)
#
# This file was created because backhaul could not find a configuration file at
# the resolved config path. `backhaul server` reads server; `backhaul client`
# reads client.

# metrics_addr: ":9100"

logging:
  level: info
  format: text # text | json
  output: stderr # stderr | stdout | discard | /path/to/file
  add_source: false

server:
  listen_addr: ":8080"
  # domains: ["tunnel.example.com"]
  secure: false
  # tunnel_port: 7000
  max_tcp_sockets: 10
  bind_host: "0.0.0.0"
  grace_ms: 1000
  handshake_timeout_ms: 5000

client:
  host: "http://localhost:8080"
  local_port: 3000
  local_https: false
  allow_invalid_cert: false
  print_requests: false
  retry:
    strategy: constant
    delay_ms: 1000
"#;
