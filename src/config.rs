//! Vault configuration.
//!
//! Settings only apply going forward: a version keeps the KDF parameters it
//! was written with, whatever the current config says.

use std::path::PathBuf;
use tracing::instrument;

use crate::crypt::DEFAULT_ITERATIONS;
use crate::error::{VaultError, VaultResult};

/// Fewest PBKDF2 rounds the vault accepts for new versions.
pub const MIN_ITERATIONS: u32 = 1_000;

/// Default cap on plaintext size (64 KiB).
pub const DEFAULT_MAX_SECRET_SIZE: usize = 64 * 1024;

const ENV_ITERATIONS: &str = "ZKVAULT_KDF_ITERATIONS";
const ENV_MAX_SECRET_SIZE: &str = "ZKVAULT_MAX_SECRET_SIZE";
const ENV_DATA_DIR: &str = "ZKVAULT_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    kdf_iterations: u32,
    max_secret_size: usize,
    data_dir: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_ITERATIONS,
            max_secret_size: DEFAULT_MAX_SECRET_SIZE,
            data_dir: None,
        }
    }
}

impl VaultConfig {
    pub fn new(
        kdf_iterations: u32,
        max_secret_size: usize,
        data_dir: Option<PathBuf>,
    ) -> VaultResult<Self> {
        if kdf_iterations < MIN_ITERATIONS {
            return Err(VaultError::InvalidInput(format!(
                "kdf iterations must be at least {MIN_ITERATIONS}"
            )));
        }
        if max_secret_size == 0 {
            return Err(VaultError::InvalidInput(
                "max secret size must be positive".into(),
            ));
        }
        Ok(Self {
            kdf_iterations,
            max_secret_size,
            data_dir,
        })
    }

    /// Load configuration from environment variables.
    ///
    /// - `ZKVAULT_KDF_ITERATIONS` - PBKDF2 rounds for new versions (default: 600000)
    /// - `ZKVAULT_MAX_SECRET_SIZE` - plaintext cap in bytes (default: 65536)
    /// - `ZKVAULT_DATA_DIR` - directory for the on-disk store
    #[instrument(skip_all)]
    pub fn from_env() -> VaultResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> VaultResult<Self> {
        let kdf_iterations = match lookup(ENV_ITERATIONS) {
            Some(raw) => raw.trim().parse().map_err(|_| {
                VaultError::InvalidInput(format!("{ENV_ITERATIONS} is not a number"))
            })?,
            None => DEFAULT_ITERATIONS,
        };
        let max_secret_size = match lookup(ENV_MAX_SECRET_SIZE) {
            Some(raw) => raw.trim().parse().map_err(|_| {
                VaultError::InvalidInput(format!("{ENV_MAX_SECRET_SIZE} is not a number"))
            })?,
            None => DEFAULT_MAX_SECRET_SIZE,
        };
        let data_dir = lookup(ENV_DATA_DIR)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Self::new(kdf_iterations, max_secret_size, data_dir)
    }

    pub fn with_kdf_iterations(mut self, iterations: u32) -> VaultResult<Self> {
        if iterations < MIN_ITERATIONS {
            return Err(VaultError::InvalidInput(format!(
                "kdf iterations must be at least {MIN_ITERATIONS}"
            )));
        }
        self.kdf_iterations = iterations;
        Ok(self)
    }

    pub fn kdf_iterations(&self) -> u32 {
        self.kdf_iterations
    }

    pub fn max_secret_size(&self) -> usize {
        self.max_secret_size
    }

    pub fn data_dir(&self) -> Option<&PathBuf> {
        self.data_dir.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = VaultConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, VaultConfig::default());
        assert_eq!(config.kdf_iterations(), DEFAULT_ITERATIONS);
        assert!(config.data_dir().is_none());
    }

    #[test]
    fn test_reads_values() {
        let config = VaultConfig::from_lookup(lookup_from(&[
            (ENV_ITERATIONS, "250000"),
            (ENV_MAX_SECRET_SIZE, " 1024 "),
            (ENV_DATA_DIR, "/var/lib/zkvault"),
        ]))
        .unwrap();
        assert_eq!(config.kdf_iterations(), 250_000);
        assert_eq!(config.max_secret_size(), 1024);
        assert_eq!(config.data_dir(), Some(&PathBuf::from("/var/lib/zkvault")));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(VaultConfig::from_lookup(lookup_from(&[(ENV_ITERATIONS, "lots")])).is_err());
        assert!(VaultConfig::from_lookup(lookup_from(&[(ENV_MAX_SECRET_SIZE, "-1")])).is_err());
    }

    #[test]
    fn test_rejects_weak_iterations() {
        assert!(VaultConfig::new(MIN_ITERATIONS - 1, 10, None).is_err());
        assert!(VaultConfig::default().with_kdf_iterations(10).is_err());
        assert!(VaultConfig::new(MIN_ITERATIONS, 10, None).is_ok());
    }
}
