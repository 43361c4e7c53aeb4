use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CoreError, Error, Result};

/// Runtime configuration, loadable from a JSON file.
///
/// All keys are optional and default as documented. The transport keys
/// (`host`, `port`, `authKey`, `artificialLatency`, `processCount`) are
/// reserved for a future local-socket transport and are not used by the
/// in-memory hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Bind address of the reserved socket transport (default `127.0.0.1`)
    pub host: String,
    /// Port of the reserved socket transport (default `0`, ephemeral)
    pub port: u16,
    /// Shared authentication key of the reserved socket transport
    /// (default none)
    pub auth_key: Option<String>,
    /// Artificial latency in milliseconds added by the reserved socket
    /// transport (default `0`)
    pub artificial_latency: u64,
    /// Upper bound on host processes, `0` for unlimited (default `0`)
    pub process_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            auth_key: None,
            artificial_latency: 0,
            process_count: 0,
        }
    }
}

impl Config {
    /// Loads the configuration from a JSON file. Absent keys take their
    /// documented defaults.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path).map_err(|e| {
            Error::core(
                CoreError::Setup,
                format!("cannot open config '{}': {}", path.as_ref().display(), e),
            )
        })?;
        serde_json::from_reader(file).map_err(|e| {
            Error::core(
                CoreError::Setup,
                format!("cannot parse config '{}': {}", path.as_ref().display(), e),
            )
        })
    }
    /// The artificial latency as a [`Duration`]
    pub fn artificial_latency(&self) -> Duration {
        Duration::from_millis(self.artificial_latency)
    }
}

/// The filesystem layout of a runtime root: `<root>/logs` and
/// `<root>/persistence`, created on first controller instantiation.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Creates the directory layout under the given root
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.clone(), root.join("logs"), root.join("persistence")] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::core(
                    CoreError::Setup,
                    format!("cannot create '{}': {}", dir.display(), e),
                )
            })?;
        }
        Ok(Self { root })
    }
    /// The runtime root
    pub fn root(&self) -> &Path {
        &self.root
    }
    /// The log directory
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
    /// The persistence directory components may write their own files
    /// under
    pub fn persistence_dir(&self) -> PathBuf {
        self.root.join("persistence")
    }
}
