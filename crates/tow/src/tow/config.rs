use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::tow::tunnel::{conn::ConnOptions, session::SessionOptions};

pub const DEFAULT_PROTOCOL_VERSION: &str = "tow-v1";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
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

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("TOW_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
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
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join("tow.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["tow.toml", "tow.yaml", "tow.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no tow.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/tow/tow.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("com", "iineva", "tow")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("tow.toml"))
    }
}

/// Writes the default config to `path` when nothing exists there. Returns whether it did.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match extension(path).as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        other => anyhow::bail!("config: unsupported config extension {other:?}"),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
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

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension(path).as_str() {
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
    pub listen_addr: String,
    pub admin_addr: String,
    pub protocol_version: String,
    pub logging: LoggingConfig,
    pub session: SessionConfig,
    pub conn: ConnConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub keep_alive_interval: Duration,
    pub read_buffer_bytes: usize,
    /// How long a session without transport waits for a reconnect. Zero keeps it forever.
    pub linger: Duration,
}

#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub dial_timeout: Duration,
    pub read_buffer_bytes: usize,
}

impl Config {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            keep_alive: self.session.keep_alive_interval,
            read_buffer_bytes: self.session.read_buffer_bytes,
            conn: ConnOptions {
                dial_timeout: self.conn.dial_timeout,
                read_buffer_bytes: self.conn.read_buffer_bytes,
            },
        }
    }

    /// Applies `--host`/`--port` on top of `listen_addr`.
    pub fn override_listen(&mut self, host: Option<&str>, port: Option<&str>) {
        let host = host.map(str::trim).filter(|h| !h.is_empty());
        let port = port.map(str::trim).filter(|p| !p.is_empty());
        if host.is_none() && port.is_none() {
            return;
        }

        let (cur_host, cur_port) = split_host_port(&self.listen_addr);
        let host = host.unwrap_or(cur_host);
        let port = port.unwrap_or(cur_port);
        self.listen_addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
    }
}

fn split_host_port(addr: &str) -> (&str, &str) {
    match addr.rsplit_once(':') {
        Some((h, p)) => (if h.is_empty() { "0.0.0.0" } else { h }, p),
        None => (addr, "8080"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,
    #[serde(default)]
    admin_addr: String,
    protocol_version: Option<String>,
    logging: Option<FileLogging>,
    session: Option<FileSession>,
    conn: Option<FileConn>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSession {
    keep_alive_interval_ms: Option<i64>,
    read_buffer_bytes: Option<i64>,
    linger_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConn {
    dial_timeout_ms: Option<i64>,
    read_buffer_bytes: Option<i64>,
}

fn non_empty(v: &Option<String>, default: &str) -> String {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    match v {
        Some(n) if n > 0 => Duration::from_millis(n as u64),
        _ => Duration::from_millis(default),
    }
}

fn bytes_or(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let defaults = SessionOptions::default();

        let logging = match &fc.logging {
            Some(l) => LoggingConfig {
                level: non_empty(&l.level, "info"),
                format: non_empty(&l.format, "text"),
                output: non_empty(&l.output, "stderr"),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let session = fc.session.as_ref();
        // linger_ms = 0 disables reaping, so it is not defaulted like the others.
        let linger = match session.and_then(|s| s.linger_ms) {
            Some(n) => Duration::from_millis(n.max(0) as u64),
            None => Duration::from_secs(60),
        };
        let conn = fc.conn.as_ref();

        let cfg = Config {
            listen_addr: non_empty(&fc.listen_addr, ":8080"),
            admin_addr: fc.admin_addr.trim().to_string(),
            protocol_version: non_empty(&fc.protocol_version, DEFAULT_PROTOCOL_VERSION),
            logging,
            session: SessionConfig {
                keep_alive_interval: millis(
                    session.and_then(|s| s.keep_alive_interval_ms),
                    defaults.keep_alive.as_millis() as u64,
                ),
                read_buffer_bytes: bytes_or(
                    session.and_then(|s| s.read_buffer_bytes),
                    defaults.read_buffer_bytes,
                ),
                linger,
            },
            conn: ConnConfig {
                dial_timeout: millis(
                    conn.and_then(|c| c.dial_timeout_ms),
                    defaults.conn.dial_timeout.as_millis() as u64,
                ),
                read_buffer_bytes: bytes_or(
                    conn.and_then(|c| c.read_buffer_bytes),
                    defaults.conn.read_buffer_bytes,
                ),
            },
        };

        if cfg.protocol_version.contains(',') {
            anyhow::bail!("config: protocol_version must be a single token");
        }
        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# tow configuration (auto-generated)
#
# Clients upgrade to a WebSocket on listen_addr using the protocol_version
# subprotocol, then open TCP connections through it.

listen_addr = ":8080"
admin_addr = ""
protocol_version = "tow-v1"

[logging]
level = "info"
format = "text" # text | json
output = "stderr" # stderr | stdout | discard | <file path>
add_source = false

[session]
keep_alive_interval_ms = 1000
read_buffer_bytes = 6154
linger_ms = 60000

[conn]
dial_timeout_ms = 5000
read_buffer_bytes = 1024
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# tow configuration (auto-generated)
#
# Clients upgrade to a WebSocket on listen_addr using the protocol_version
# subprotocol, then open TCP connections through it.

listen_addr: ":8080"
admin_addr: ""
protocol_version: "tow-v1"

logging:
  level: "info"
  format: "text" # text | json
  output: "stderr" # stderr | stdout | discard | <file path>
  add_source: false

session:
  keep_alive_interval_ms: 1000
  read_buffer_bytes: 6154
  linger_ms: 60000

conn:
  dial_timeout_ms: 5000
  read_buffer_bytes: 1024
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("tow_cfg_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = temp_dir("defaults");
        let cfg_path = dir.join("tow.toml");
        std::fs::write(&cfg_path, "").expect("write");

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.listen_addr, ":8080");
        assert_eq!(cfg.protocol_version, DEFAULT_PROTOCOL_VERSION);
        assert_eq!(cfg.session.keep_alive_interval, Duration::from_secs(1));
        assert_eq!(cfg.session.read_buffer_bytes, 6 * 1024 + 10);
        assert_eq!(cfg.session.linger, Duration::from_secs(60));
        assert_eq!(cfg.conn.dial_timeout, Duration::from_secs(5));
        assert_eq!(cfg.conn.read_buffer_bytes, 1024);
        assert!(cfg.admin_addr.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_overrides_and_zero_linger() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("tow.yaml");
        let yaml = r#"
listen_addr: "127.0.0.1:9000"
protocol_version: " tow-v2 "
session:
  keep_alive_interval_ms: 250
  linger_ms: 0
conn:
  dial_timeout_ms: -5
"#;
        std::fs::write(&cfg_path, yaml).expect("write");

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.protocol_version, "tow-v2");
        assert_eq!(cfg.session.keep_alive_interval, Duration::from_millis(250));
        assert!(cfg.session.linger.is_zero());
        assert_eq!(cfg.conn.dial_timeout, Duration::from_secs(5));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("tow.toml");
        std::fs::write(&cfg_path, "listen_port = 1\n").expect("write");

        let err = load_config(&cfg_path).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("listen_port"), "got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn default_templates_parse() {
        let dir = temp_dir("templates");
        for name in ["tow.toml", "tow.yml"] {
            let p = dir.join(name);
            assert!(ensure_config_file(&p).expect("ensure"));
            assert!(!ensure_config_file(&p).expect("ensure twice"));
            let cfg = load_config(&p).expect("load_config");
            assert_eq!(cfg.listen_addr, ":8080");
            assert_eq!(cfg.session.read_buffer_bytes, 6154);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn host_and_port_override_listen_addr() {
        let dir = temp_dir("override");
        let cfg_path = dir.join("tow.toml");
        std::fs::write(&cfg_path, "").expect("write");
        let mut cfg = load_config(&cfg_path).expect("load_config");

        cfg.override_listen(None, Some("9999"));
        assert_eq!(cfg.listen_addr, "0.0.0.0:9999");

        cfg.override_listen(Some("127.0.0.1"), None);
        assert_eq!(cfg.listen_addr, "127.0.0.1:9999");

        cfg.override_listen(Some("::1"), Some(""));
        assert_eq!(cfg.listen_addr, "[::1]:9999");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
