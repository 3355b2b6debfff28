use thiserror::Error;

use complyd_core::config::ControllerConfig;
use complyd_model::Quantity;

/// Settings that would leave the controller unable to make progress.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("namespace must not be empty")]
    EmptyNamespace,
    #[error("reconcile.workers must be at least 1")]
    NoWorkers,
    #[error("reconcile.requeue_after_ms must be greater than zero")]
    ZeroRequeue,
    #[error("retry.max_attempts must be at least 1")]
    NoRetryAttempts,
    #[error("result_server.port must not be zero")]
    ZeroPort,
    #[error("storage.size {0:?} is not a valid quantity")]
    InvalidStorageSize(String),
    #[error("images.{0} must not be empty")]
    MissingImage(&'static str),
}

pub fn validate_controller(config: &ControllerConfig) -> Result<(), ConfigGuardRailError> {
    if config.namespace.trim().is_empty() {
        return Err(ConfigGuardRailError::EmptyNamespace);
    }
    if config.reconcile.workers == 0 {
        return Err(ConfigGuardRailError::NoWorkers);
    }
    if config.reconcile.requeue_after_ms == 0 {
        return Err(ConfigGuardRailError::ZeroRequeue);
    }
    if config.retry.max_attempts == 0 {
        return Err(ConfigGuardRailError::NoRetryAttempts);
    }
    if config.result_server.port == 0 {
        return Err(ConfigGuardRailError::ZeroPort);
    }
    if Quantity::parse(&config.storage.size).is_err() {
        return Err(ConfigGuardRailError::InvalidStorageSize(
            config.storage.size.clone(),
        ));
    }

    let images = &config.images;
    for (field, image) in [
        ("scanner", &images.scanner),
        ("aggregator", &images.aggregator),
        ("result_server", &images.result_server),
        ("log_collector", &images.log_collector),
        ("content", &images.content),
    ] {
        if image.trim().is_empty() {
            return Err(ConfigGuardRailError::MissingImage(field));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        assert_eq!(validate_controller(&ControllerConfig::default()), Ok(()));
    }

    #[test]
    fn zero_workers_are_rejected() {
        let mut config = ControllerConfig::default();
        config.reconcile.workers = 0;
        assert_eq!(validate_controller(&config), Err(ConfigGuardRailError::NoWorkers));
    }

    #[test]
    fn storage_size_must_parse() {
        let mut config = ControllerConfig::default();
        config.storage.size = "lots".into();
        assert_eq!(
            validate_controller(&config),
            Err(ConfigGuardRailError::InvalidStorageSize("lots".into()))
        );
    }

    #[test]
    fn blank_images_are_named() {
        let mut config = ControllerConfig::default();
        config.images.aggregator = " ".into();
        assert_eq!(
            validate_controller(&config),
            Err(ConfigGuardRailError::MissingImage("aggregator"))
        );
    }
}
