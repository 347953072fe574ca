use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use docbridge_core::BridgeConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "docbridge.toml";
pub const CONFIG_ENV: &str = "DOCBRIDGE_CONFIG";

/// Channel the orchestrator uses to issue tool calls. The client-facing HTTP
/// surface runs in both cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorChannel {
    Stdio,
    Http,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub orchestrator: OrchestratorChannel,
    pub http: HttpSettings,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    pub sse_enabled: bool,
    pub auth: Option<AuthSettings>,
    pub cors: Option<CorsSettings>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            sse_enabled: true,
            auth: None,
            cors: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub tokens: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub orchestrator: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub enable_sse: Option<bool>,
    pub tokens: Vec<String>,
    pub tokens_file: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    pub result_timeout_secs: Option<u64>,
    pub max_repair_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub server: FileServerConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Default)]
pub struct FileServerConfig {
    pub orchestrator: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sse_enabled: Option<bool>,
    pub auth: Option<FileAuthConfig>,
    pub cors: Option<FileCorsConfig>,
}

#[derive(Debug, Clone)]
pub struct FileAuthConfig {
    pub enabled: Option<bool>,
    pub auth_type: Option<String>,
    pub tokens_file: Option<PathBuf>,
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FileCorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Deserialize, Default)]
struct RootConfig {
    #[serde(default)]
    server: Option<RawServerConfig>,
    #[serde(default)]
    bridge: Option<BridgeConfig>,
}

#[derive(Deserialize, Default)]
struct RawServerConfig {
    orchestrator: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    sse_enabled: Option<bool>,
    auth: Option<RawAuthConfig>,
    cors: Option<RawCorsConfig>,
}

#[derive(Deserialize, Default)]
struct RawAuthConfig {
    enabled: Option<bool>,
    #[serde(rename = "type")]
    auth_type: Option<String>,
    tokens_file: Option<String>,
    tokens: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
struct RawCorsConfig {
    allowed_origins: Option<Vec<String>>,
}

/// Config file to read: explicit path, then `DOCBRIDGE_CONFIG`, then `docbridge.toml`
/// in the working directory.
pub fn config_path(explicit: Option<&Path>, working_dir: &Path) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| working_dir.join(DEFAULT_CONFIG_FILE))
}

pub fn load_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read bridge config from {}", path.display()))?;
    let parsed: RootConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    let base = path.parent().unwrap_or(Path::new("."));
    Ok(Some(FileConfig {
        server: parsed
            .server
            .map(|raw| raw.into_runtime_config(base))
            .unwrap_or_default(),
        bridge: parsed.bridge.unwrap_or_default(),
    }))
}

/// Merges CLI flags over the file over built-in defaults.
pub fn resolve_settings(
    cli: &CliOverrides,
    file_cfg: Option<&FileConfig>,
    working_dir: &Path,
) -> Result<ServerSettings> {
    let server_cfg = file_cfg.map(|cfg| &cfg.server);

    let orchestrator = match cli
        .orchestrator
        .clone()
        .or_else(|| server_cfg.and_then(|cfg| cfg.orchestrator.clone()))
        .as_deref()
        .unwrap_or("stdio")
    {
        "stdio" => OrchestratorChannel::Stdio,
        "http" => OrchestratorChannel::Http,
        other => return Err(anyhow!("Unsupported orchestrator channel '{other}'")),
    };

    let defaults = HttpSettings::default();
    let host = cli
        .host
        .clone()
        .or_else(|| server_cfg.and_then(|cfg| cfg.host.clone()))
        .unwrap_or(defaults.host);
    let port = cli
        .port
        .or_else(|| server_cfg.and_then(|cfg| cfg.port))
        .unwrap_or(defaults.port);
    let sse_enabled = cli
        .enable_sse
        .or_else(|| server_cfg.and_then(|cfg| cfg.sse_enabled))
        .unwrap_or(defaults.sse_enabled);

    let mut bridge = file_cfg.map(|cfg| cfg.bridge.clone()).unwrap_or_default();
    if let Some(secs) = cli.result_timeout_secs {
        bridge.result_timeout_secs = secs;
        bridge.result_timeout_ms = None;
    }
    if let Some(attempts) = cli.max_repair_attempts {
        bridge.max_repair_attempts = attempts;
    }

    Ok(ServerSettings {
        orchestrator,
        http: HttpSettings {
            host,
            port,
            sse_enabled,
            auth: build_auth_settings(cli, server_cfg, working_dir)?,
            cors: build_cors_settings(cli, server_cfg),
        },
        bridge,
    })
}

fn build_auth_settings(
    cli: &CliOverrides,
    server_cfg: Option<&FileServerConfig>,
    working_dir: &Path,
) -> Result<Option<AuthSettings>> {
    let mut tokens: HashSet<String> = HashSet::new();
    let mut auth_enabled = false;

    if let Some(cfg) = server_cfg.and_then(|cfg| cfg.auth.as_ref()) {
        if let Some(auth_type) = cfg.auth_type.as_deref() {
            if auth_type != "bearer" {
                return Err(anyhow!(
                    "Unsupported auth type '{auth_type}'. Only 'bearer' is supported."
                ));
            }
        }

        auth_enabled = cfg.enabled.unwrap_or(!cfg.tokens.is_empty());
        tokens.extend(cfg.tokens.iter().cloned());

        if let Some(path) = cfg.tokens_file.as_ref() {
            let loaded = load_tokens_from_file(path)?;
            auth_enabled |= cfg.enabled.unwrap_or(!loaded.is_empty());
            tokens.extend(loaded);
        }
    }

    if let Some(path) = cli.tokens_file.as_ref() {
        let loaded = load_tokens_from_file(&resolve_relative(working_dir, path))?;
        auth_enabled |= !loaded.is_empty();
        tokens.extend(loaded);
    }

    if !cli.tokens.is_empty() {
        auth_enabled = true;
        tokens.extend(cli.tokens.iter().cloned());
    }

    if !auth_enabled {
        return Ok(None);
    }
    if tokens.is_empty() {
        tracing::warn!("bearer auth enabled but no tokens configured, every request will be refused");
    }
    Ok(Some(AuthSettings { tokens }))
}

fn build_cors_settings(
    cli: &CliOverrides,
    server_cfg: Option<&FileServerConfig>,
) -> Option<CorsSettings> {
    let mut origins: Vec<String> = server_cfg
        .and_then(|cfg| cfg.cors.as_ref())
        .map(|cors| cors.allowed_origins.clone())
        .unwrap_or_default();
    origins.extend(cli.cors_origins.iter().cloned());

    if origins.is_empty() {
        return None;
    }

    origins.sort();
    origins.dedup();
    Some(CorsSettings {
        allowed_origins: origins,
    })
}

fn load_tokens_from_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tokens file {}", path.display()))?;
    let parsed: TokenFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse tokens file {}", path.display()))?;
    Ok(parsed.tokens.into_iter().map(|entry| entry.token).collect())
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl RawServerConfig {
    fn into_runtime_config(self, base: &Path) -> FileServerConfig {
        FileServerConfig {
            orchestrator: self.orchestrator,
            host: self.host,
            port: self.port,
            sse_enabled: self.sse_enabled,
            auth: self.auth.map(|raw| FileAuthConfig {
                enabled: raw.enabled,
                auth_type: raw.auth_type,
                tokens_file: raw
                    .tokens_file
                    .map(|value| resolve_relative(base, Path::new(&value))),
                tokens: raw.tokens.unwrap_or_default(),
            }),
            cors: self.cors.map(|raw| FileCorsConfig {
                allowed_origins: raw.allowed_origins.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Deserialize)]
struct TokenFile {
    tokens: Vec<TokenEntry>,
}

#[derive(Deserialize)]
struct TokenEntry {
    token: String,
}
