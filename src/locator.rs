//! Finding the generator executable on disk.

use std::path::{Path, PathBuf};

use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Resolves the path of the generator executable.
pub trait GeneratorLocator {
    fn locate(&self) -> Result<PathBuf, BridgeError>;
}

/// Probes a fixed list of candidate paths; the first existing file wins.
#[derive(Debug, Clone)]
pub struct ProbeLocator {
    name: String,
    candidates: Vec<PathBuf>,
}

impl ProbeLocator {
    /// Probe exactly `candidates`, in order.
    pub fn new(name: impl Into<String>, candidates: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            candidates,
        }
    }

    /// Candidate order: the configured explicit path, the directory of the
    /// running module, the working directory, then `config.search_dirs`.
    /// Relative entries are resolved against the working directory when
    /// located.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let name = config.generator_name.clone();
        let mut candidates = Vec::new();

        if let Some(explicit) = &config.generator_path {
            candidates.push(explicit.clone());
        }
        if let Some(dir) = module_dir() {
            candidates.push(dir.join(&name));
        }
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(&name));
        }
        candidates.extend(config.search_dirs.iter().map(|dir| dir.join(&name)));

        Self { name, candidates }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }
}

impl GeneratorLocator for ProbeLocator {
    fn locate(&self) -> Result<PathBuf, BridgeError> {
        match self.candidates.iter().find(|p| is_file(p)) {
            Some(found) => {
                let found = absolute(found);
                log::debug!("Using generator at {}", found.display());
                Ok(found)
            }
            None => Err(BridgeError::Resolution {
                name: self.name.clone(),
                searched: self.candidates.clone(),
            }),
        }
    }
}

/// A locator that always answers with the same path, unchecked. The path
/// goes to the OS as given, so a bare name is looked up on `PATH`.
impl GeneratorLocator for PathBuf {
    fn locate(&self) -> Result<PathBuf, BridgeError> {
        Ok(self.clone())
    }
}

/// Directory holding the executable that loaded this library.
fn module_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// `Command` treats a slash-free program name as a `PATH` lookup, so a
/// probed file is always launched through an absolute path.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
