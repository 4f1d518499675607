use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::ExecutionLimits;
use crate::launcher::DockerConfig;
use crate::pool::PoolConfig;
use crate::protocol::Language;
use crate::{SandboxLaunchConfig, SandboxWorkerConfig};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SANDBOX_READY_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_INFLIGHT: usize = 128;
pub const DEFAULT_MAX_CODE_BYTES: usize = 64 * 1024;
pub const DEFAULT_RESULT_UPLOAD_URL: &str = "http://file-service:8080";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct LanguageConfig {
    pub language: Language,
    pub workers: usize,
    pub image: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub broker_url: String,
    pub result_upload_url: String,
    pub outbound_proxy: Option<String>,
    pub languages: Vec<LanguageConfig>,
    pub docker: DockerConfig,
    pub limits: ExecutionLimits,
    pub max_inflight: usize,
    pub max_code_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let broker_url = get("BROKER_URL")
            .or_else(|| get("AMQP_URL"))
            .ok_or(ConfigError::Missing("BROKER_URL"))?;
        let default_workers = parse_or(&get, "WORKER_COUNT", DEFAULT_WORKER_COUNT)?;

        let enabled = match get("LANGUAGES") {
            Some(list) => parse_languages(&list)?,
            None => Language::ALL.to_vec(),
        };
        let mut languages = Vec::with_capacity(enabled.len());
        for language in enabled {
            let workers = parse_or(
                &get,
                &format!("WORKER_COUNT_{}", language.env_suffix()),
                default_workers,
            )?;
            if workers == 0 {
                return Err(ConfigError::Invalid {
                    key: format!("WORKER_COUNT_{}", language.env_suffix()),
                    value: "0".to_owned(),
                    reason: "each enabled language needs at least one worker".to_owned(),
                });
            }
            let image_key = format!("SANDBOX_IMAGE_{}", language.env_suffix());
            let image = get(image_key.as_str())
                .unwrap_or_else(|| format!("sandpool/worker-{language}:latest"));
            languages.push(LanguageConfig {
                language,
                workers,
                image,
            });
        }

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_owned()),
            broker_url,
            result_upload_url: get("RESULT_UPLOAD_URL")
                .unwrap_or_else(|| DEFAULT_RESULT_UPLOAD_URL.to_owned()),
            outbound_proxy: get("OUTBOUND_PROXY"),
            languages,
            docker: DockerConfig {
                runtime: get("SANDBOX_RUNTIME"),
                network: get("SANDBOX_NETWORK"),
                ready_timeout: Duration::from_secs(parse_or(
                    &get,
                    "SANDBOX_READY_TIMEOUT_SECS",
                    DEFAULT_SANDBOX_READY_TIMEOUT_SECS,
                )?),
            },
            limits: ExecutionLimits {
                acquire_timeout: Duration::from_secs(parse_or(
                    &get,
                    "ACQUIRE_TIMEOUT_SECS",
                    DEFAULT_ACQUIRE_TIMEOUT_SECS,
                )?),
                execution_timeout: Duration::from_secs(parse_or(
                    &get,
                    "EXECUTION_TIMEOUT_SECS",
                    DEFAULT_EXECUTION_TIMEOUT_SECS,
                )?),
            },
            max_inflight: parse_or(&get, "MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT)?,
            max_code_bytes: parse_or(&get, "MAX_CODE_BYTES", DEFAULT_MAX_CODE_BYTES)?,
        })
    }

    fn to_worker_config(&self) -> SandboxWorkerConfig {
        SandboxWorkerConfig {
            broker_url: self.broker_url.clone(),
            result_upload_url: self.result_upload_url.clone(),
            outbound_proxy: self.outbound_proxy.clone(),
            execution_timeout: self.limits.execution_timeout,
        }
    }

    pub fn pool_configs(&self) -> Vec<PoolConfig> {
        self.languages
            .iter()
            .map(|language| PoolConfig {
                language: language.language,
                capacity: language.workers,
                launch: SandboxLaunchConfig {
                    image: language.image.clone(),
                    worker: self.to_worker_config(),
                },
            })
            .collect()
    }

    /// Upper bound for one `/run` request: both deadlines plus slack for I/O.
    pub fn request_timeout(&self) -> Duration {
        self.limits.acquire_timeout + self.limits.execution_timeout + Duration::from_secs(5)
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = get(key) else {
        return Ok(default);
    };
    value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        key: key.to_owned(),
        value,
        reason: err.to_string(),
    })
}

fn parse_languages(list: &str) -> Result<Vec<Language>, ConfigError> {
    let mut languages = Vec::new();
    for item in list.split(',').filter(|item| !item.trim().is_empty()) {
        let language: Language = item.parse().map_err(|err: crate::protocol::UnknownLanguage| {
            ConfigError::Invalid {
                key: "LANGUAGES".to_owned(),
                value: list.to_owned(),
                reason: err.to_string(),
            }
        })?;
        if !languages.contains(&language) {
            languages.push(language);
        }
    }
    if languages.is_empty() {
        return Err(ConfigError::Invalid {
            key: "LANGUAGES".to_owned(),
            value: list.to_owned(),
            reason: "no languages listed".to_owned(),
        });
    }
    Ok(languages)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn broker_url_is_required() {
        assert_eq!(config(&[]).unwrap_err(), ConfigError::Missing("BROKER_URL"));
        assert_eq!(
            config(&[("BROKER_URL", "  ")]).unwrap_err(),
            ConfigError::Missing("BROKER_URL")
        );
    }

    #[test]
    fn defaults_enable_every_language() {
        let config = config(&[("BROKER_URL", "amqp://rabbitmq:5672")]).unwrap();
        assert_eq!(config.languages.len(), Language::ALL.len());
        assert!(config.languages.iter().all(|l| l.workers == DEFAULT_WORKER_COUNT));
        assert_eq!(config.limits.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.limits.execution_timeout, Duration::from_secs(30));
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.languages[2].image, "sandpool/worker-python:latest");
    }

    #[test]
    fn per_language_overrides_apply() {
        let config = config(&[
            ("AMQP_URL", "amqp://rabbitmq:5672"),
            ("LANGUAGES", "python, javascript,python"),
            ("WORKER_COUNT", "2"),
            ("WORKER_COUNT_PYTHON", "6"),
            ("SANDBOX_IMAGE_JAVASCRIPT", "ghcr.io/acme/node-worker:1"),
            ("OUTBOUND_PROXY", "http://squid:3128"),
        ])
        .unwrap();
        let pools = config.pool_configs();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].language, Language::Python);
        assert_eq!(pools[0].capacity, 6);
        assert_eq!(pools[1].capacity, 2);
        assert_eq!(pools[1].launch.image, "ghcr.io/acme/node-worker:1");
        assert_eq!(
            pools[1].launch.worker.outbound_proxy.as_deref(),
            Some("http://squid:3128")
        );
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = config(&[("BROKER_URL", "amqp://x"), ("WORKER_COUNT", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "WORKER_COUNT"));

        let err = config(&[("BROKER_URL", "amqp://x"), ("LANGUAGES", "rust")]).unwrap_err();
        assert!(err.to_string().contains("unsupported language: rust"));

        let err = config(&[("BROKER_URL", "amqp://x"), ("WORKER_COUNT_JAVA", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "WORKER_COUNT_JAVA"));
    }
}
