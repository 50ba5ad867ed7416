use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use murmur_core::PipelineConfig;
use murmur_core::provider::{DEFAULT_GEMINI_API_URL, GeminiConfig};
use murmur_core::worker::{RetryPolicy, WorkerConfig};

/// Placeholder secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub billing_secret: String,
    pub pipeline: PipelineConfig,
    pub workers: WorkerConfig,
    pub gemini: GeminiConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get: &dyn Fn(&str) -> Option<String> = &get;
        let pipeline = PipelineConfig::default();
        let retry = RetryPolicy::default();

        Ok(Self {
            host: get("MURMUR_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: var_or(get, "MURMUR_PORT", 3000)?,
            db_path: get("MURMUR_DB_PATH").unwrap_or_else(|| "murmur.db".into()).into(),
            jwt_secret: secret(get, "MURMUR_JWT_SECRET")?,
            billing_secret: secret(get, "MURMUR_BILLING_SECRET")?,
            pipeline: PipelineConfig {
                basic_daily_limit: var_or(get, "MURMUR_BASIC_DAILY_LIMIT", pipeline.basic_daily_limit)?,
                room_cache_ttl: Duration::from_secs(var_or(
                    get,
                    "MURMUR_ROOM_CACHE_TTL_SECS",
                    pipeline.room_cache_ttl.as_secs(),
                )?),
            },
            workers: WorkerConfig {
                workers: var_or(get, "MURMUR_WORKERS", 4)?,
                retry: RetryPolicy {
                    max_attempts: var_or(get, "MURMUR_PROVIDER_MAX_ATTEMPTS", retry.max_attempts)?,
                    base_delay: Duration::from_millis(var_or(
                        get,
                        "MURMUR_PROVIDER_RETRY_DELAY_MS",
                        retry.base_delay.as_millis() as u64,
                    )?),
                },
            },
            gemini: GeminiConfig {
                api_url: get("GEMINI_API_URL").unwrap_or_else(|| DEFAULT_GEMINI_API_URL.into()),
                api_key: get("GEMINI_API_KEY").unwrap_or_default(),
                timeout: Duration::from_secs(var_or(get, "MURMUR_PROVIDER_TIMEOUT_SECS", 30)?),
            },
        })
    }
}

fn secret(get: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    let value = get(key).unwrap_or_default();
    if value.is_empty() || PLACEHOLDER_SECRETS.contains(&value.as_str()) {
        bail!("{} is unset or still a placeholder", key);
    }
    Ok(value)
}

fn var_or<T>(get: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw.parse().with_context(|| format!("invalid {}: '{}'", key, raw)),
        None => Ok(default),
    }
}
