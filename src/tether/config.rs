use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::tether::{net, tunnel::wire};

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

pub const CONFIG_ENV: &str = "TETHER_CONFIG";

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps TETHER_CONFIG into the flag already; this covers callers that
    // bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
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
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("tether.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["tether.toml", "tether.yaml", "tether.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no tether.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/tether/tether.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("io", "tether", "tether")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("tether.toml"))
    }
}

/// Write the default template to `path` unless something is already there.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
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

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub relay: Option<RelayConfig>,
    pub origin: Option<OriginConfig>,
    pub tunnel: TunnelConfig,
    pub voice: VoiceConfig,
    pub status: StatusText,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub control_addr: String,
    pub voice_bridge_addr: String,
    pub public_game_addr: String,
    pub public_voice_addr: String,
}

#[derive(Debug, Clone)]
pub struct OriginConfig {
    pub relay_host: String,
    pub control_port: u16,
    pub voice_bridge_port: u16,
    pub local_host: String,
    pub local_game_port: u16,
    pub local_voice_port: u16,
    pub reconnect_delay: Duration,
    pub dial_timeout: Duration,
}

impl OriginConfig {
    pub fn relay_control_addr(&self) -> String {
        net::join_host_port(&self.relay_host, self.control_port)
    }

    pub fn relay_voice_addr(&self) -> String {
        net::join_host_port(&self.relay_host, self.voice_bridge_port)
    }

    pub fn local_game_addr(&self) -> String {
        net::join_host_port(&self.local_host, self.local_game_port)
    }

    pub fn local_voice_addr(&self) -> String {
        net::join_host_port(&self.local_host, self.local_voice_port)
    }
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub auth_token: String,
    pub hello_timeout: Duration,
    pub pending_timeout: Duration,
    pub max_pending: usize,
}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub enabled: bool,
    pub max_sessions: usize,
    pub session_idle_timeout: Duration,
    pub max_record_bytes: usize,
}

/// Texts shown in the server list while the origin is unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusText {
    pub version_name: String,
    pub description: String,
    pub footer: String,
}

impl Default for StatusText {
    fn default() -> Self {
        Self {
            version_name: "§4Offline".into(),
            description: "Server Is Offline".into(),
            footer: "View YOUR_DOMAIN_HERE".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    relay: Option<FileRelay>,
    origin: Option<FileOrigin>,
    tunnel: Option<FileTunnel>,
    voice: Option<FileVoice>,
    status: Option<FileStatus>,
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
struct FileRelay {
    control_addr: Option<String>,
    voice_bridge_addr: Option<String>,
    public_game_addr: Option<String>,
    public_voice_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOrigin {
    #[serde(default)]
    relay_host: String,
    control_port: Option<u16>,
    voice_bridge_port: Option<u16>,
    local_host: Option<String>,
    local_game_port: Option<u16>,
    local_voice_port: Option<u16>,
    reconnect_delay_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    auth_token: Option<String>,
    hello_timeout_ms: Option<i64>,
    pending_timeout_ms: Option<i64>,
    max_pending: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileVoice {
    enabled: Option<bool>,
    max_sessions: Option<i64>,
    session_idle_timeout_ms: Option<i64>,
    max_record_bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStatus {
    version_name: Option<String>,
    description: Option<String>,
    footer: Option<String>,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|v| v.max(0) as u64).unwrap_or(default))
}

fn count(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(v) if v > 0 => v as usize,
        _ => default,
    }
}

fn text(v: Option<String>, default: &str) -> String {
    v.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: text(l.level, "info"),
                format: text(l.format, "json"),
                output: text(l.output, "stderr"),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let relay = fc.relay.map(|r| RelayConfig {
            control_addr: text(r.control_addr, ":5000"),
            // An explicit empty string disables the voice side.
            voice_bridge_addr: r
                .voice_bridge_addr
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| ":5001".into()),
            public_game_addr: text(r.public_game_addr, ":25565"),
            public_voice_addr: r
                .public_voice_addr
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| ":24454".into()),
        });

        let origin = fc.origin.map(|o| OriginConfig {
            relay_host: o.relay_host.trim().to_string(),
            control_port: o.control_port.unwrap_or(5000),
            voice_bridge_port: o.voice_bridge_port.unwrap_or(5001),
            local_host: text(o.local_host, "127.0.0.1"),
            local_game_port: o.local_game_port.unwrap_or(25565),
            local_voice_port: o.local_voice_port.unwrap_or(24454),
            reconnect_delay: millis(o.reconnect_delay_ms, 5000),
            dial_timeout: millis(o.dial_timeout_ms, 5000),
        });

        let t = fc.tunnel;
        let tunnel = TunnelConfig {
            auth_token: text(
                t.as_ref().and_then(|t| t.auth_token.clone()),
                wire::DEFAULT_AUTH_TOKEN,
            ),
            hello_timeout: millis(t.as_ref().and_then(|t| t.hello_timeout_ms), 10_000),
            pending_timeout: millis(t.as_ref().and_then(|t| t.pending_timeout_ms), 30_000),
            max_pending: count(t.as_ref().and_then(|t| t.max_pending), 1024),
        };

        let v = fc.voice;
        let voice = VoiceConfig {
            enabled: v.as_ref().and_then(|v| v.enabled).unwrap_or(true),
            max_sessions: count(v.as_ref().and_then(|v| v.max_sessions), 1024),
            session_idle_timeout: millis(
                v.as_ref().and_then(|v| v.session_idle_timeout_ms),
                120_000,
            ),
            max_record_bytes: count(v.as_ref().and_then(|v| v.max_record_bytes), 256 * 1024),
        };

        let defaults = StatusText::default();
        let status = match fc.status {
            Some(s) => StatusText {
                version_name: s.version_name.unwrap_or(defaults.version_name),
                description: s.description.unwrap_or(defaults.description),
                footer: s.footer.unwrap_or(defaults.footer),
            },
            None => defaults,
        };

        let cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            relay,
            origin,
            tunnel,
            voice,
            status,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.relay.is_none() && self.origin.is_none() {
            anyhow::bail!("config: nothing to run (set [relay] and/or [origin])");
        }

        let token = &self.tunnel.auth_token;
        if token.contains(':') {
            anyhow::bail!("config: tunnel.auth_token must not contain ':'");
        }
        if wire::TUNNEL_FOR_PREFIX.starts_with(token.as_bytes()) {
            anyhow::bail!("config: tunnel.auth_token must not be a prefix of TUNNEL_FOR:");
        }

        if let Some(r) = &self.relay {
            if r.voice_bridge_addr.is_empty() != r.public_voice_addr.is_empty() {
                anyhow::bail!(
                    "config: relay.voice_bridge_addr and relay.public_voice_addr must both be set or both be empty"
                );
            }
        }

        if let Some(o) = &self.origin {
            if o.relay_host.is_empty() {
                anyhow::bail!("config: origin.relay_host is required");
            }
            let ports = [
                ("control_port", o.control_port),
                ("voice_bridge_port", o.voice_bridge_port),
                ("local_game_port", o.local_game_port),
                ("local_voice_port", o.local_voice_port),
            ];
            for (name, port) in ports {
                if port == 0 {
                    anyhow::bail!("config: origin.{name} must be non-zero");
                }
            }
        }

        Ok(())
    }

    /// Whether the relay should run its voice bridge.
    pub fn relay_voice_enabled(&self) -> bool {
        self.voice.enabled
            && self
                .relay
                .as_ref()
                .is_some_and(|r| !r.voice_bridge_addr.is_empty())
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# tether configuration.
#
# Run the public side with [relay], the side next to the game server with
# [origin]. One process may run both.

# Optional admin HTTP server (health, Prometheus metrics, state).
admin_addr = ""

[logging]
level = "info"     # trace | debug | info | warn (warning) | error
format = "json"    # json | text
output = "stderr"  # stderr | stdout | discard | /path/to/file.log
add_source = false

[relay]
control_addr = ":5000"
voice_bridge_addr = ":5001"
public_game_addr = ":25565"
public_voice_addr = ":24454"

# [origin]
# relay_host = "relay.example.com"
# control_port = 5000
# voice_bridge_port = 5001
# local_host = "127.0.0.1"
# local_game_port = 25565
# local_voice_port = 24454
# reconnect_delay_ms = 5000
# dial_timeout_ms = 5000

[tunnel]
auth_token = "AUTH_CONTROL"
hello_timeout_ms = 10000
pending_timeout_ms = 30000
max_pending = 1024

[voice]
enabled = true
max_sessions = 1024
session_idle_timeout_ms = 120000
max_record_bytes = 262144

[status]
version_name = "§4Offline"
description = "Server Is Offline"
footer = "View YOUR_DOMAIN_HERE"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# tether configuration.
#
# Run the public side with relay, the side next to the game server with
# origin. One process may run both.

# Optional admin HTTP server (health, Prometheus metrics, state).
admin_addr: ""

logging:
  level: info      # trace | debug | info | warn (warning) | error
  format: json     # json | text
  output: stderr   # stderr | stdout | discard | /path/to/file.log
  add_source: false

relay:
  control_addr: ":5000"
  voice_bridge_addr: ":5001"
  public_game_addr: ":25565"
  public_voice_addr: ":24454"

# origin:
#   relay_host: relay.example.com
#   control_port: 5000
#   voice_bridge_port: 5001
#   local_host: 127.0.0.1
#   local_game_port: 25565
#   local_voice_port: 24454
#   reconnect_delay_ms: 5000
#   dial_timeout_ms: 5000

tunnel:
  auth_token: AUTH_CONTROL
  hello_timeout_ms: 10000
  pending_timeout_ms: 30000
  max_pending: 1024

voice:
  enabled: true
  max_sessions: 1024
  session_idle_timeout_ms: 120000
  max_record_bytes: 262144

status:
  version_name: "§4Offline"
  description: Server Is Offline
  footer: View YOUR_DOMAIN_HERE
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
        p.push(format!(
            "tether_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn load_toml(name: &str, body: &str) -> anyhow::Result<Config> {
        let dir = temp_dir(name);
        let path = dir.join("tether.toml");
        std::fs::write(&path, body).expect("write");
        load_config(&path)
    }

    #[test]
    fn default_templates_load() {
        for name in ["tether.toml", "tether.yaml", "tether.yml"] {
            let dir = temp_dir("template");
            let path = dir.join(name);
            assert!(ensure_config_file(&path).unwrap());
            assert!(!ensure_config_file(&path).unwrap());

            let cfg = load_config(&path).unwrap();
            let relay = cfg.relay.as_ref().expect("relay role");
            assert_eq!(relay.control_addr, ":5000");
            assert_eq!(relay.public_voice_addr, ":24454");
            assert!(cfg.origin.is_none());
            assert!(cfg.relay_voice_enabled());
            assert_eq!(cfg.tunnel.auth_token, "AUTH_CONTROL");
            assert_eq!(cfg.tunnel.pending_timeout, Duration::from_secs(30));
            assert_eq!(cfg.status, StatusText::default());
        }
    }

    #[test]
    fn origin_defaults_and_addresses() {
        let cfg = load_toml(
            "origin",
            r#"
[origin]
relay_host = "relay.example.com"
"#,
        )
        .unwrap();
        let o = cfg.origin.unwrap();
        assert_eq!(o.relay_control_addr(), "relay.example.com:5000");
        assert_eq!(o.relay_voice_addr(), "relay.example.com:5001");
        assert_eq!(o.local_game_addr(), "127.0.0.1:25565");
        assert_eq!(o.local_voice_addr(), "127.0.0.1:24454");
        assert_eq!(o.reconnect_delay, Duration::from_secs(5));
        assert!(cfg.relay.is_none());
    }

    #[test]
    fn nothing_to_run_is_rejected() {
        let err = load_toml("empty", "admin_addr = \":9000\"\n").unwrap_err();
        assert!(err.to_string().contains("nothing to run"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(load_toml("unknown_top", "bogus = 1\n[relay]\n").is_err());
        assert!(load_toml("unknown_relay", "[relay]\nbogus = 1\n").is_err());
    }

    #[test]
    fn auth_token_rules() {
        let err = load_toml("tok_colon", "[relay]\n[tunnel]\nauth_token = \"a:b\"\n").unwrap_err();
        assert!(err.to_string().contains("':'"));

        let err = load_toml("tok_prefix", "[relay]\n[tunnel]\nauth_token = \"TUNNEL\"\n").unwrap_err();
        assert!(err.to_string().contains("prefix"));

        let cfg = load_toml("tok_ok", "[relay]\n[tunnel]\nauth_token = \"s3cret\"\n").unwrap();
        assert_eq!(cfg.tunnel.auth_token, "s3cret");

        // Blank falls back to the default.
        let cfg = load_toml("tok_blank", "[relay]\n[tunnel]\nauth_token = \"  \"\n").unwrap();
        assert_eq!(cfg.tunnel.auth_token, "AUTH_CONTROL");
    }

    #[test]
    fn origin_requires_relay_host_and_ports() {
        assert!(load_toml("no_host", "[origin]\n").is_err());
        let err = load_toml(
            "zero_port",
            "[origin]\nrelay_host = \"r\"\nlocal_game_port = 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("local_game_port"));
    }

    #[test]
    fn voice_can_be_disabled_on_relay() {
        let cfg = load_toml(
            "novoice",
            "[relay]\nvoice_bridge_addr = \"\"\npublic_voice_addr = \"\"\n",
        )
        .unwrap();
        assert!(!cfg.relay_voice_enabled());

        assert!(load_toml("halfvoice", "[relay]\nvoice_bridge_addr = \"\"\n").is_err());

        let cfg = load_toml("voiceoff", "[relay]\n[voice]\nenabled = false\n").unwrap();
        assert!(!cfg.relay_voice_enabled());
    }

    #[test]
    fn status_text_is_configurable() {
        let cfg = load_toml(
            "status",
            "[relay]\n[status]\ndescription = \"Back soon\"\nfooter = \"\"\n",
        )
        .unwrap();
        assert_eq!(cfg.status.description, "Back soon");
        assert_eq!(cfg.status.footer, "");
        assert_eq!(cfg.status.version_name, "§4Offline");
    }

    #[test]
    fn explicit_directory_resolves_inside() {
        let dir = temp_dir("explicit_dir");
        let resolved = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(resolved.path, dir.join("tether.toml"));
        assert!(matches!(resolved.source, ConfigPathSource::Flag));

        std::fs::write(dir.join("tether.yaml"), "relay: {}\n").unwrap();
        let resolved = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(resolved.path, dir.join("tether.yaml"));
    }

    #[test]
    fn explicit_path_without_extension_gets_toml() {
        let dir = temp_dir("noext");
        let resolved = resolve_config_path(Some(dir.join("custom"))).unwrap();
        assert_eq!(resolved.path, dir.join("custom.toml"));
    }
}
