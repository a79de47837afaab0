//! Environment configuration.
//!
//! Values come from `DEPLOY_HOOK_*` variables, with an optional `.env` file
//! loaded first. Parsing goes through a lookup function so tests never touch
//! the process environment.

use crate::error::ConfigError;
use crate::http_server::HEALTH_PATH;
use crate::journal::LogDestination;
use crate::types::SharedSecret;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_PATH: &str = "/hooks/deploy";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub secret: SharedSecret,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub bind: IpAddr,
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
    pub read_timeout: Duration,
    pub max_body_bytes: usize,
    pub output_limit: usize,
    pub log: LogDestination,
    pub accept_sha256: bool,
    pub branch: Option<String>,
    pub log_json: bool,
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let secret = lookup("DEPLOY_HOOK_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("DEPLOY_HOOK_SECRET"))?;
        let command = get("DEPLOY_HOOK_COMMAND")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("DEPLOY_HOOK_COMMAND"))?;
        let args = get("DEPLOY_HOOK_ARGS")
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let workdir = get("DEPLOY_HOOK_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        if !workdir.is_dir() {
            return Err(ConfigError::WorkdirMissing(workdir));
        }

        let bind = match get("DEPLOY_HOOK_BIND") {
            Some(v) => v.parse().map_err(|e| invalid("DEPLOY_HOOK_BIND", e))?,
            None => IpAddr::from([0, 0, 0, 0]),
        };
        let port = match get("DEPLOY_HOOK_PORT") {
            Some(v) => v.parse().map_err(|e| invalid("DEPLOY_HOOK_PORT", e))?,
            None => DEFAULT_PORT,
        };

        let path = get("DEPLOY_HOOK_PATH").unwrap_or_else(|| DEFAULT_PATH.to_string());
        if !path.starts_with('/') || path.contains(&['{', '}', '*'][..]) {
            return Err(ConfigError::Invalid {
                name: "DEPLOY_HOOK_PATH",
                reason: format!("'{path}' must be a literal path starting with '/'"),
            });
        }
        if path == HEALTH_PATH {
            return Err(ConfigError::Invalid {
                name: "DEPLOY_HOOK_PATH",
                reason: format!("'{path}' is reserved for the health check"),
            });
        }

        let timeout = duration_var(&get, "DEPLOY_HOOK_TIMEOUT", DEFAULT_TIMEOUT)?;
        let read_timeout = duration_var(&get, "DEPLOY_HOOK_READ_TIMEOUT", DEFAULT_READ_TIMEOUT)?;

        let max_body_bytes = match get("DEPLOY_HOOK_MAX_BODY_BYTES") {
            Some(v) => v.parse().map_err(|e| invalid("DEPLOY_HOOK_MAX_BODY_BYTES", e))?,
            None => DEFAULT_MAX_BODY_BYTES,
        };
        let output_limit = match get("DEPLOY_HOOK_OUTPUT_LIMIT") {
            Some(v) => v.parse().map_err(|e| invalid("DEPLOY_HOOK_OUTPUT_LIMIT", e))?,
            None => DEFAULT_OUTPUT_LIMIT,
        };

        let log = get("DEPLOY_HOOK_LOG")
            .and_then(|v| v.parse().ok())
            .unwrap_or(LogDestination::Stdout);

        Ok(Self {
            secret: SharedSecret::new(secret),
            command,
            args,
            workdir,
            bind,
            port,
            path,
            timeout,
            read_timeout,
            max_body_bytes,
            output_limit,
            log,
            accept_sha256: bool_var(&get, "DEPLOY_HOOK_ACCEPT_SHA256")?,
            branch: get("DEPLOY_HOOK_BRANCH"),
            log_json: bool_var(&get, "DEPLOY_HOOK_LOG_JSON")?,
        })
    }
}

fn invalid(name: &'static str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: err.to_string(),
    }
}

fn bool_var(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<bool, ConfigError> {
    let value = get(name).map(|v| v.to_ascii_lowercase());
    match value.as_deref() {
        None | Some("0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => Err(invalid(name, format!("'{other}' is not a boolean"))),
    }
}

fn duration_var(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(raw) = get(name) else {
        return Ok(default);
    };
    let d = parse_duration(&raw).ok_or_else(|| invalid(name, format!("'{raw}' is not a duration")))?;
    if d.is_zero() {
        return Err(invalid(name, "must be greater than zero"));
    }
    Ok(d)
}

/// Parse `90`, `90s`, `10m`, `1h` or `250ms`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (num, unit) = raw.split_at(split);
    let n: u64 = num.parse().ok()?;
    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(n)),
        "ms" => Some(Duration::from_millis(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
