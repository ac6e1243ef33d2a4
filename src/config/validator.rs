use crate::config::{Config, SCHEMA_VERSION};
use crate::error::{Result, RetrievalError, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let errors = Self::collect_errors(config);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RetrievalError::ConfigValidation { errors })
        }
    }

    /// Every validation failure, in section order
    pub fn collect_errors(config: &Config) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_search(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_monitor(config, &mut errors);
        Self::validate_rerank(config, &mut errors);
        Self::validate_errors(config, &mut errors);

        errors
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        if let Err(field_errors) = config.retrieval.validate() {
            errors.extend(
                field_errors
                    .into_iter()
                    .map(|e| ValidationError::new(format!("retrieval.{}", e.path), e.message)),
            );
        }
    }

    fn validate_search(config: &Config, errors: &mut Vec<ValidationError>) {
        if let Err(RetrievalError::ConfigValidation { errors: fusion }) =
            config.search.fusion_config()
        {
            errors.extend(fusion);
        }

        if config.search.candidate_multiplier == 0 {
            errors.push(ValidationError::new(
                "search.candidate_multiplier",
                "Candidate multiplier must be greater than 0",
            ));
        }

        if config.search.timeout_ms == 0 {
            errors.push(ValidationError::new(
                "search.timeout_ms",
                "Search timeout must be greater than 0",
            ));
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        let cache = &config.cache;

        if cache.sqlite_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "cache.sqlite_path",
                "SQLite path cannot be empty",
            ));
        }

        if cache.capacity_mb == 0 {
            errors.push(ValidationError::new(
                "cache.capacity_mb",
                "Cache capacity must be greater than 0",
            ));
        }

        if cache.key_prefix.is_empty() {
            errors.push(ValidationError::new(
                "cache.key_prefix",
                "Key prefix cannot be empty",
            ));
        } else if cache.key_prefix.contains(['*', '?', '[']) {
            errors.push(ValidationError::new(
                "cache.key_prefix",
                "Key prefix cannot contain glob characters",
            ));
        }

        if cache.operation_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "cache.operation_timeout_ms",
                "Cache operation timeout must be greater than 0",
            ));
        }

        errors.extend(
            cache
                .policy
                .validation_errors()
                .into_iter()
                .map(|e| ValidationError::new(format!("cache.policy.{}", e.path), e.message)),
        );
    }

    fn validate_monitor(config: &Config, errors: &mut Vec<ValidationError>) {
        let monitor = &config.monitor;

        if monitor.failure_threshold == 0 {
            errors.push(ValidationError::new(
                "monitor.failure_threshold",
                "Failure threshold must be greater than 0",
            ));
        }

        if monitor.health_check_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "monitor.health_check_timeout_ms",
                "Health check timeout must be greater than 0",
            ));
        }

        if monitor.alert_window_secs == 0 {
            errors.push(ValidationError::new(
                "monitor.alert_window_secs",
                "Alert window must be greater than 0",
            ));
        }

        let thresholds = &monitor.alert_thresholds;
        for (name, value) in [
            ("connection_failures", thresholds.connection_failures),
            ("read_errors", thresholds.read_errors),
            ("write_errors", thresholds.write_errors),
            ("timeouts", thresholds.timeouts),
        ] {
            if value == 0 {
                errors.push(ValidationError::new(
                    format!("monitor.alert_thresholds.{}", name),
                    "Alert threshold must be greater than 0",
                ));
            }
        }
    }

    fn validate_rerank(config: &Config, errors: &mut Vec<ValidationError>) {
        let rerank = &config.rerank;

        if rerank.primary.name.is_empty() {
            errors.push(ValidationError::new(
                "rerank.primary.name",
                "Model name cannot be empty",
            ));
        }

        if let Some(fallback) = &rerank.fallback {
            if fallback.name.is_empty() {
                errors.push(ValidationError::new(
                    "rerank.fallback.name",
                    "Model name cannot be empty",
                ));
            }
        }

        if rerank.batch_size == 0 {
            errors.push(ValidationError::new(
                "rerank.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if rerank.max_length == 0 {
            errors.push(ValidationError::new(
                "rerank.max_length",
                "Max length must be greater than 0",
            ));
        }

        if rerank.timeout_ms == 0 {
            errors.push(ValidationError::new(
                "rerank.timeout_ms",
                "Rerank timeout must be greater than 0",
            ));
        }

        if rerank.max_concurrency == 0 {
            errors.push(ValidationError::new(
                "rerank.max_concurrency",
                "Max concurrency must be greater than 0",
            ));
        }
    }

    fn validate_errors(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.errors.repeated_error_threshold == 0 {
            errors.push(ValidationError::new(
                "errors.repeated_error_threshold",
                "Repeated error threshold must be greater than 0",
            ));
        }

        if config.errors.window_secs == 0 {
            errors.push(ValidationError::new(
                "errors.window_secs",
                "Error window must be greater than 0",
            ));
        }
    }
}
