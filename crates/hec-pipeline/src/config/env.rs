// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use figment::{providers::Env, Figment};

use crate::config::{merge_config, Config, ConfigSource, SourceConfig};
use crate::error::ConfigError;

/// Reads `HEC_*` environment variables, e.g. `HEC_HOST`, `HEC_TOKEN`,
/// `HEC_RETRY_INTERVAL` (seconds) or `HEC_METADATA` (`key=value` lines).
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed("HEC_"));

        let env_config = figment.extract::<SourceConfig>().map_err(|e| {
            ConfigError::ParseError(format!(
                "Failed to parse config from environment variables: {e}, using default config."
            ))
        })?;
        merge_config(config, &env_config);
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::log_level::LogLevel;
    use crate::event::EventKind;

    #[test]
    fn test_merge_config_overrides_with_environment_variables() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("HEC_ENABLED", "true");
            jail.set_env("HEC_HOST", "hec.internal");
            jail.set_env("HEC_PORT", "443");
            jail.set_env("HEC_USE_SSL", "false");
            jail.set_env("HEC_TOKEN", "abc-123");
            jail.set_env("HEC_RAW_EVENT_ENABLED", "false");
            jail.set_env("HEC_RETRY_INTERVAL", "5");
            jail.set_env("HEC_MAX_RETRIES", "7");
            jail.set_env("HEC_WORKER_COUNT", "3");
            jail.set_env("HEC_LOG_LEVEL", "debug");
            jail.set_env("HEC_METADATA", "index=ci\nfile.enabled=false");
            jail.set_env("HEC_IGNORED_JOBS", "sandbox");

            let mut config = Config::default();
            EnvConfigSource.load(&mut config).expect("Failed to load config");

            assert!(config.enabled);
            assert_eq!(config.host, "hec.internal");
            assert_eq!(config.port, 443);
            assert!(!config.use_ssl);
            assert_eq!(config.token, "abc-123");
            assert!(!config.raw_event_enabled);
            assert_eq!(config.retry_interval, Duration::from_secs(5));
            assert_eq!(config.max_retries, 7);
            assert_eq!(config.worker_count, 3);
            assert_eq!(config.log_level, LogLevel::Debug);
            assert_eq!(config.metadata.get("index"), Some("ci"));
            assert!(config.is_event_disabled(EventKind::File));
            assert!(config.is_build_ignored("job/sandbox/1/"));
            Ok(())
        });
    }

    #[test]
    fn test_numeric_token_is_kept_as_string() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("HEC_TOKEN", "12345");

            let mut config = Config::default();
            EnvConfigSource.load(&mut config).expect("Failed to load config");
            assert_eq!(config.token, "12345");
            Ok(())
        });
    }
}
