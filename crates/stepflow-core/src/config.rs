//! Configuration loader for Stepflow.
//!
//! Reads a TOML file into [`StepflowConfig`]. Falls back to defaults when the
//! file is missing or malformed, so a bad config never prevents startup.

use std::path::Path;

use stepflow_types::config::StepflowConfig;

/// Default file name looked up inside a data directory.
pub const CONFIG_FILE_NAME: &str = "stepflow.toml";

/// Load configuration from `path`.
///
/// - Missing file: defaults, logged at debug.
/// - Unreadable or unparsable file: defaults, logged at warn.
/// - Otherwise the parsed config, with out-of-range values clamped.
pub async fn load_config(path: &Path) -> StepflowConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return StepflowConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return StepflowConfig::default();
        }
    };

    match toml::from_str::<StepflowConfig>(&content) {
        Ok(config) => normalize(config),
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            StepflowConfig::default()
        }
    }
}

/// Load `{data_dir}/stepflow.toml`.
pub async fn load_config_from_dir(data_dir: &Path) -> StepflowConfig {
    load_config(&data_dir.join(CONFIG_FILE_NAME)).await
}

fn normalize(config: StepflowConfig) -> StepflowConfig {
    StepflowConfig {
        engine: config.engine.normalized(),
        backoff: config.backoff.normalized(),
        tracing: config.tracing,
    }
}

#[cfg(test)]
mod tests {
    use stepflow_types::config::LogFormat;
    use stepflow_types::workflow::BackoffStrategy;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn load_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config_from_dir(tmp.path()).await;
        assert_eq!(config.engine.max_concurrent_executions, 5);
        assert_eq!(config.backoff.cool_off_threshold, 5);
        assert_eq!(config.tracing.format, LogFormat::Pretty);
    }

    #[tokio::test]
    async fn load_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
[engine]
max_concurrent_executions = 2
max_parallel_steps = 4

[engine.default_retry]
max_attempts = 3
strategy = "exponential"
initial_delay_ms = 250

[backoff]
sample_rate = 0.5

[tracing]
format = "json"
filter = "stepflow_core=debug"
"#,
        )
        .await
        .unwrap();

        let config = load_config_from_dir(tmp.path()).await;
        assert_eq!(config.engine.max_concurrent_executions, 2);
        assert_eq!(config.engine.max_parallel_steps, 4);
        assert_eq!(config.engine.poll_interval_ms, 100, "unset fields keep defaults");
        assert_eq!(config.engine.default_retry.max_attempts, 3);
        assert_eq!(config.engine.default_retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(config.backoff.sample_rate, 0.5);
        assert_eq!(config.tracing.format, LogFormat::Json);
        assert_eq!(config.tracing.filter.as_deref(), Some("stepflow_core=debug"));
    }

    #[tokio::test]
    async fn load_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.toml");
        tokio::fs::write(&path, "[engine\nmax_concurrent_executions = ")
            .await
            .unwrap();

        let config = load_config(&path).await;
        assert_eq!(config.engine.max_concurrent_executions, 5);
    }

    #[tokio::test]
    async fn load_config_clamps_out_of_range_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("clamp.toml");
        tokio::fs::write(
            &path,
            "[engine]\nmax_concurrent_executions = 0\n\n[backoff]\nsample_rate = 7.5\n",
        )
        .await
        .unwrap();

        let config = load_config(&path).await;
        assert_eq!(config.engine.max_concurrent_executions, 1);
        assert_eq!(config.backoff.sample_rate, 1.0);
    }
}
