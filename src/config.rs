//! Runtime configuration from the environment.
//! Defaults match the feeder's factory setup (mDNS name `tigerbox.local`).

use crate::services::status::PollingConfig;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::fs;

pub const DEFAULT_API_URL: &str = "http://tigerbox.local/api";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_MOCK_SEED: u64 = 0x7167_7262_7800_0001;
/// Upper bound for every configured duration.
pub const MAX_DURATION_SECS: f64 = 86_400.0;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the feeder's REST API.
    pub api_url: String,
    pub request_timeout: Duration,
    pub polling: PollingConfig,
    /// Talk to the in-memory mock feeder instead of a device.
    pub mock_device: bool,
    pub mock_seed: u64,
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match std::env::var(name) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} has an invalid value: {}", name, s.trim())),
        _ => Ok(default),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|s| matches!(s.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false)
}

fn seconds(name: &str, default: f64) -> Result<Duration, String> {
    let secs: f64 = env_or(name, default)?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("{} must be a positive number of seconds", name));
    }
    if secs > MAX_DURATION_SECS {
        return Err(format!("{} must not exceed {} seconds", name, MAX_DURATION_SECS));
    }
    Ok(Duration::from_secs_f64(secs))
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let defaults = PollingConfig::default();
        let api_url = std::env::var("API_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let polling = PollingConfig {
            normal: seconds("POLL_NORMAL_SECS", defaults.normal.as_secs_f64())?,
            fast: seconds("POLL_FAST_SECS", defaults.fast.as_secs_f64())?,
            change_threshold: env_or("FAST_CHANGE_THRESHOLD", defaults.change_threshold)?,
            slow_grace: seconds("SLOW_GRACE_SECS", defaults.slow_grace.as_secs_f64())?,
        };
        if !polling.change_threshold.is_finite() || polling.change_threshold < 0.0 {
            return Err("FAST_CHANGE_THRESHOLD must be a non-negative number".to_string());
        }
        if polling.fast > polling.normal {
            return Err("POLL_FAST_SECS must not exceed POLL_NORMAL_SECS".to_string());
        }

        Ok(Config {
            api_url,
            request_timeout: seconds("REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            polling,
            mock_device: env_flag("MOCK_DEVICE"),
            mock_seed: env_or("MOCK_SEED", DEFAULT_MOCK_SEED)?,
        })
    }
}

/// Load `KEY=value` lines from a `.env` file without overriding variables that are
/// already set in the process environment.
pub fn load_env_file(path: &Path) -> Result<usize, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let mut loaded = 0;
    for (index, line) in text.lines().enumerate() {
        let Some((key, value)) =
            parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(&key, value);
            }
            loaded += 1;
        }
    }
    Ok(loaded)
}

fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid variable name: {:?}", key));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let inner = &raw[1..];
            let end = inner.find(q).ok_or_else(|| format!("unterminated {} quote", q))?;
            let rest = inner[end + 1..].trim();
            if !rest.is_empty() && !rest.starts_with('#') {
                return Err("unexpected characters after closing quote".to_string());
            }
            inner[..end].to_string()
        }
        _ => raw.split(" #").next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}
