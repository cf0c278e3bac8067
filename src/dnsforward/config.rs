//! Layered configuration: a raw, loosely-typed `FileConfig` is deserialized
//! from TOML or YAML, then validated and defaulted into a strongly-typed
//! `Config`. Path resolution follows flag > env > cwd > OS-default
//! precedence, with a scaffolded config file created on first run.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

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

pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("PROXY_CONFIG") {
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
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("dnsproxy.toml"));
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
    for candidate in ["dnsproxy.toml", "dnsproxy.yaml", "dnsproxy.yml"] {
        let p = dir.join(candidate);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no dnsproxy.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("", "", "dnsforward").context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("dnsproxy.toml"))
}

/// Creates a scaffold config file at `path` if none exists. Returns whether
/// a file was created, so the caller can warn that it did.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_template_for(path)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_template_for(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", path.extension()),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("config: read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("config: parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&s).with_context(|| format!("config: parse yaml {}", path.display()))?,
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub admin_addr: String,
    pub upstreams: Vec<UpstreamConfig>,
    pub transport: TransportTunables,
    pub read_timeout: Duration,
    pub max_timeout: Duration,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub proxy_name: String,
    pub addr: String,
    pub tls: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TransportTunables {
    pub min_dial_timeout: Duration,
    pub max_dial_timeout: Duration,
    pub expire: Duration,
}

impl Default for TransportTunables {
    fn default() -> Self {
        Self {
            min_dial_timeout: Duration::from_millis(100),
            max_dial_timeout: Duration::from_secs(30),
            expire: Duration::from_secs(10),
        }
    }
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
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,
    #[serde(default)]
    admin_addr: String,
    #[serde(default)]
    upstreams: Vec<FileUpstream>,
    transport: Option<FileTransport>,
    #[serde(default)]
    read_timeout_ms: i64,
    #[serde(default)]
    max_timeout_ms: i64,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileUpstream {
    addr: String,
    #[serde(default)]
    proxy_name: String,
    #[serde(default)]
    tls: bool,
}

#[derive(Debug, Deserialize, Default)]
struct FileTransport {
    min_dial_timeout_ms: Option<i64>,
    max_dial_timeout_ms: Option<i64>,
    expire_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        if fc.upstreams.is_empty() {
            anyhow::bail!("config: at least one [[upstreams]] entry is required");
        }

        let upstreams = fc
            .upstreams
            .into_iter()
            .map(|u| {
                let addr = u.addr.trim().to_string();
                if addr.is_empty() {
                    anyhow::bail!("config: upstream addr must not be empty");
                }
                let proxy_name = if u.proxy_name.trim().is_empty() {
                    addr.clone()
                } else {
                    u.proxy_name.trim().to_string()
                };
                Ok(UpstreamConfig {
                    proxy_name,
                    addr,
                    tls: u.tls,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let transport = TransportTunables {
            min_dial_timeout: millis_or(fc.transport.as_ref().and_then(|t| t.min_dial_timeout_ms), 100),
            max_dial_timeout: millis_or(fc.transport.as_ref().and_then(|t| t.max_dial_timeout_ms), 30_000),
            expire: millis_or(fc.transport.as_ref().and_then(|t| t.expire_ms), 10_000),
        };

        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.unwrap_or_else(|| "info".into()),
                format: l.format.unwrap_or_else(|| "json".into()),
                output: l.output.unwrap_or_else(|| "stderr".into()),
                add_source: l.add_source,
            },
            None => LoggingConfig::default(),
        };

        let listen_addr = if fc.listen_addr.trim().is_empty() {
            "0.0.0.0:53".to_string()
        } else {
            fc.listen_addr.trim().to_string()
        };

        let admin_addr = if fc.admin_addr.trim().is_empty() {
            "127.0.0.1:9090".to_string()
        } else {
            fc.admin_addr.trim().to_string()
        };

        Ok(Config {
            listen_addr,
            admin_addr,
            upstreams,
            transport,
            read_timeout: millis_or(Some(fc.read_timeout_ms), 2000),
            max_timeout: millis_or(Some(fc.max_timeout_ms), 2000),
            logging,
        })
    }
}

fn millis_or(ms: Option<i64>, default_ms: u64) -> Duration {
    match ms {
        Some(v) if v > 0 => Duration::from_millis(v as u64),
        _ => Duration::from_millis(default_ms),
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"listen_addr = "0.0.0.0:53"
admin_addr = "127.0.0.1:9090"

[[upstreams]]
addr = "1.1.1.1:53"
proxy_name = "cloudflare"
tls = false

[transport]
min_dial_timeout_ms = 100
max_dial_timeout_ms = 30000
expire_ms = 10000

[logging]
level = "info"
format = "json"
output = "stderr"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"listen_addr: "0.0.0.0:53"
admin_addr: "127.0.0.1:9090"

upstreams:
  - addr: "1.1.1.1:53"
    proxy_name: cloudflare
    tls: false

transport:
  min_dial_timeout_ms: 100
  max_dial_timeout_ms: 30000
  expire_ms: 10000

logging:
  level: info
  format: json
  output: stderr
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_file_config_applies_defaults() {
        let fc = FileConfig {
            upstreams: vec![FileUpstream {
                addr: "1.1.1.1:53".into(),
                proxy_name: "".into(),
                tls: false,
            }],
            ..Default::default()
        };
        let cfg = Config::from_file_config(fc).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:53");
        assert_eq!(cfg.admin_addr, "127.0.0.1:9090");
        assert_eq!(cfg.upstreams[0].proxy_name, "1.1.1.1:53");
        assert_eq!(cfg.transport.min_dial_timeout, Duration::from_millis(100));
        assert_eq!(cfg.read_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn from_file_config_rejects_no_upstreams() {
        let fc = FileConfig::default();
        assert!(Config::from_file_config(fc).is_err());
    }

    #[test]
    fn normalize_explicit_path_adds_toml_extension_when_missing() {
        let p = normalize_explicit_path(Path::new("/tmp/does-not-exist-dnsforward-cfg")).unwrap();
        assert_eq!(p.extension().unwrap(), "toml");
    }
}
