//! Store configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Environment variable that overrides the base directory when no explicit
/// override is configured.
pub const BASE_DIR_ENV: &str = "SAFEKEEP_HOME";

const DEFAULT_APP_DIR: &str = "safekeep";
const DEFAULT_FILE_SUFFIX: &str = ".p15";
const DEFAULT_SEED_FILENAME: &str = "randseed.dat";
const DEFAULT_MAX_PATH_LEN: usize = 4096;
const DEFAULT_MAX_NAME_LEN: usize = 64;
const DEFAULT_WIPE_CHUNK: usize = 16 * 1024;

/// Tunables for path resolution, wiping and open behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the per-user application directory.
    pub app_dir: String,
    /// Suffix appended to every named file.
    pub file_suffix: String,
    /// Reserved filename used by [`crate::PathBuildOption::FixedSeedFile`].
    pub seed_filename: String,
    /// Explicit base directory. Takes precedence over [`BASE_DIR_ENV`] and
    /// the host default.
    pub base_dir: Option<PathBuf>,
    /// Maximum length in bytes of any resolved path.
    pub max_path_len: usize,
    /// Maximum length in bytes of a logical name.
    pub max_name_len: usize,
    /// Size of the scratch buffer used while wiping.
    pub wipe_chunk_size: usize,
    /// Take a non-blocking lock at open: exclusive for handles opened
    /// exclusive, shared for every other handle, so open readers keep
    /// exclusive openers out.
    pub lock_on_open: bool,
    /// Restrict every file opened for writing to its owner, as if
    /// [`crate::OpenOptions::private`] had been requested.
    pub owner_only_files: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            app_dir: DEFAULT_APP_DIR.to_string(),
            file_suffix: DEFAULT_FILE_SUFFIX.to_string(),
            seed_filename: DEFAULT_SEED_FILENAME.to_string(),
            base_dir: None,
            max_path_len: DEFAULT_MAX_PATH_LEN,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            wipe_chunk_size: DEFAULT_WIPE_CHUNK,
            lock_on_open: true,
            owner_only_files: true,
        }
    }
}

impl StoreConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] if the JSON is malformed or the
    /// resulting configuration fails validation.
    pub fn from_json(json: &str) -> StoreResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| StoreError::invalid_input("config", err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the explicit base directory.
    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl AsRef<Path>) -> Self {
        self.base_dir = Some(base_dir.as_ref().to_path_buf());
        self
    }

    /// Sets the application directory name.
    #[must_use]
    pub fn with_app_dir(mut self, app_dir: impl Into<String>) -> Self {
        self.app_dir = app_dir.into();
        self
    }

    /// Sets the maximum resolved path length.
    #[must_use]
    pub const fn with_max_path_len(mut self, max_path_len: usize) -> Self {
        self.max_path_len = max_path_len;
        self
    }

    /// Sets the wipe scratch buffer size.
    #[must_use]
    pub const fn with_wipe_chunk_size(mut self, wipe_chunk_size: usize) -> Self {
        self.wipe_chunk_size = wipe_chunk_size;
        self
    }

    /// Enables or disables the lock taken at open.
    #[must_use]
    pub const fn with_lock_on_open(mut self, enabled: bool) -> Self {
        self.lock_on_open = enabled;
        self
    }

    /// Enables or disables owner-only permissions on every written file.
    #[must_use]
    pub const fn with_owner_only_files(mut self, enabled: bool) -> Self {
        self.owner_only_files = enabled;
        self
    }

    /// Returns the base directory override, from the config or the
    /// environment.
    #[must_use]
    pub fn base_dir_override(&self) -> Option<PathBuf> {
        self.base_dir.clone().or_else(|| {
            std::env::var_os(BASE_DIR_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] naming the first offending field.
    pub fn validate(&self) -> StoreResult<()> {
        if self.app_dir.is_empty() || self.app_dir.contains(['/', '\\']) {
            return Err(StoreError::invalid_input(
                "app_dir",
                "must be a single non-empty path component",
            ));
        }
        if self.seed_filename.is_empty() || self.seed_filename.contains(['/', '\\']) {
            return Err(StoreError::invalid_input(
                "seed_filename",
                "must be a single non-empty path component",
            ));
        }
        if self.file_suffix.contains(['/', '\\']) {
            return Err(StoreError::invalid_input(
                "file_suffix",
                "must not contain path separators",
            ));
        }
        if self.wipe_chunk_size == 0 {
            return Err(StoreError::invalid_input("wipe_chunk_size", "must be non-zero"));
        }
        if self.max_name_len == 0 || self.max_path_len == 0 {
            return Err(StoreError::invalid_input("max_*_len", "must be non-zero"));
        }
        Ok(())
    }
}
