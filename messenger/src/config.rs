use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context};
use sipchat_crypto_core::KeyAlgorithm;

const MAX_CRYPTO_WORKERS: usize = 8;

/// Runtime configuration for the messaging core.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub keys_dir: PathBuf,
    pub crypto_workers: usize,
    pub event_capacity: usize,
    pub transports: Vec<String>,
    pub key_algorithm: KeyAlgorithm,
    pub composing_refresh: u32,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            keys_dir: PathBuf::from("./keys"),
            crypto_workers: default_workers(),
            event_capacity: 128,
            transports: vec!["tls".to_string(), "tcp".to_string(), "udp".to_string()],
            key_algorithm: KeyAlgorithm::Rsa4096,
            composing_refresh: sipchat_messaging::iscomposing::DEFAULT_REFRESH,
        }
    }
}

impl MessengerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let keys_dir = env::var("SIPCHAT_KEYS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.keys_dir);
        let crypto_workers = match env::var("SIPCHAT_CRYPTO_WORKERS") {
            Ok(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("invalid SIPCHAT_CRYPTO_WORKERS: {raw}"))?
                .clamp(1, MAX_CRYPTO_WORKERS),
            Err(_) => defaults.crypto_workers,
        };
        let event_capacity = env::var("SIPCHAT_EVENT_CAPACITY")
            .ok()
            .and_then(|c| c.parse().ok())
            .filter(|c: &usize| *c > 0)
            .unwrap_or(defaults.event_capacity);
        let transports = env::var("SIPCHAT_TRANSPORTS")
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.transports);
        if transports.is_empty() {
            bail!("SIPCHAT_TRANSPORTS lists no transports");
        }
        let key_algorithm = match env::var("SIPCHAT_KEY_ALGORITHM") {
            Ok(raw) => match raw.to_ascii_lowercase().as_str() {
                "rsa4096" => KeyAlgorithm::Rsa4096,
                "cv25519" => KeyAlgorithm::Cv25519,
                other => bail!("unknown SIPCHAT_KEY_ALGORITHM: {other}"),
            },
            Err(_) => defaults.key_algorithm,
        };
        let composing_refresh = env::var("SIPCHAT_COMPOSING_REFRESH")
            .ok()
            .and_then(|r| r.parse().ok())
            .unwrap_or(defaults.composing_refresh);

        Ok(Self {
            keys_dir,
            crypto_workers,
            event_capacity,
            transports,
            key_algorithm,
            composing_refresh,
        })
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_CRYPTO_WORKERS)
}
