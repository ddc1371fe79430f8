//! Bridge configuration: where to look for the generator and how long to
//! wait for it.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable holding an explicit path to the generator.
pub const ENV_GENERATOR: &str = "KSEF_PDF_GENERATOR";
/// Environment variable holding the wait limit in whole seconds (`0` = none).
pub const ENV_TIMEOUT_SECS: &str = "KSEF_PDF_TIMEOUT_SECS";

/// Base name of the generator executable, without the platform suffix.
pub const GENERATOR_STEM: &str = "ksef-pdf-generator";

/// Configuration for the generator bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// File name probed in each search location
    /// (default: `ksef-pdf-generator` plus the platform executable suffix).
    pub generator_name: String,
    /// Explicit generator path, probed before every other location.
    pub generator_path: Option<PathBuf>,
    /// Extra directories probed after the module and working directories.
    pub search_dirs: Vec<PathBuf>,
    /// Wait limit for the child in seconds. `None` or `0` waits forever.
    pub timeout_secs: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            generator_name: default_generator_name(),
            generator_path: None,
            search_dirs: Vec::new(),
            timeout_secs: None,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `KSEF_PDF_GENERATOR` and `KSEF_PDF_TIMEOUT_SECS`.
    ///
    /// An unparsable timeout is ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(path) = std::env::var_os(ENV_GENERATOR).filter(|p| !p.is_empty()) {
            config.generator_path = Some(PathBuf::from(path));
        }

        if let Ok(raw) = std::env::var(ENV_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => config.timeout_secs = Some(secs),
                Err(e) => log::warn!("Ignoring {ENV_TIMEOUT_SECS}={raw:?}: {e}"),
            }
        }

        config
    }

    /// Deserialise from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| e.to_string())
    }

    /// Serialise to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }
}

fn default_generator_name() -> String {
    format!("{GENERATOR_STEM}{}", std::env::consts::EXE_SUFFIX)
}
