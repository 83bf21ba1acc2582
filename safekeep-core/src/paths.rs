//! Resolution of where key files live.
//!
//! [`PathBuilder`] only computes locations. It does no race hardening; that
//! is [`crate::SecureOpener`]'s job once the path is known.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::backend::Backend;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// What [`PathBuilder::build`] should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathBuildOption<'a> {
    /// `<base>/<name><suffix>`, creating the base directory if missing.
    CreateNamed(&'a str),
    /// `<base>/<name><suffix>`. A missing base directory is not an error.
    GetNamed(&'a str),
    /// `<base>/<seed filename>`. Like [`Self::GetNamed`], the base directory
    /// is not created.
    FixedSeedFile,
}

impl PathBuildOption<'_> {
    const fn creates_base(self) -> bool {
        matches!(self, Self::CreateNamed(_))
    }
}

/// Computes absolute paths under the application's base directory.
#[derive(Debug)]
pub struct PathBuilder<'a, B: Backend> {
    backend: &'a B,
    config: &'a StoreConfig,
}

impl<'a, B: Backend> PathBuilder<'a, B> {
    /// Creates a builder over `backend` using `config`.
    #[must_use]
    pub const fn new(backend: &'a B, config: &'a StoreConfig) -> Self {
        Self { backend, config }
    }

    /// Resolves the base directory, creating it owner-only if `create` is set
    /// and it does not exist.
    ///
    /// The explicit override wins, then the host default. The fallback
    /// location is tried once, only when the host has no default.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if no location can be determined or the
    /// directory cannot be created.
    pub fn base_dir(&self, create: bool) -> StoreResult<PathBuf> {
        let app_dir = self.config.app_dir.as_str();
        let base = if let Some(dir) = self.config.base_dir_override() {
            dir
        } else if let Some(dir) = self.backend.default_root(app_dir) {
            dir
        } else {
            let dir = self.backend.fallback_root(app_dir).ok_or_else(|| {
                StoreError::open("no per-user or fallback storage location available")
            })?;
            warn!("no per-user storage location, falling back to {}", dir.display());
            dir
        };

        if !base.is_absolute() {
            return Err(StoreError::invalid_input(
                "base_dir",
                format!("{} is not absolute", base.display()),
            ));
        }

        if create && !self.backend.dir_exists(&base) {
            debug!("creating storage directory {}", base.display());
            self.backend
                .create_private_dir(&base)
                .map_err(|err| StoreError::open(format!("create {}: {err}", base.display())))?;
        }
        Ok(base)
    }

    /// Builds the absolute path for `option`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidInput`] for a malformed name.
    /// - [`StoreError::Overflow`] if the name or the resolved path exceeds
    ///   its configured maximum. Paths are never truncated.
    /// - [`StoreError::Open`] if the base directory cannot be resolved or
    ///   created.
    pub fn build(&self, option: PathBuildOption<'_>) -> StoreResult<PathBuf> {
        let filename = match option {
            PathBuildOption::CreateNamed(name) | PathBuildOption::GetNamed(name) => {
                self.validate_name(name)?;
                format!("{name}{}", self.config.file_suffix)
            }
            PathBuildOption::FixedSeedFile => self.config.seed_filename.clone(),
        };

        let base = self.base_dir(option.creates_base())?;
        let path = base.join(filename);
        self.check_length(&path)?;
        Ok(path)
    }

    fn validate_name(&self, name: &str) -> StoreResult<()> {
        if name.is_empty() {
            return Err(StoreError::invalid_input("name", "must not be empty"));
        }
        if name.len() > self.config.max_name_len {
            return Err(StoreError::overflow(
                "name",
                name.len(),
                self.config.max_name_len,
            ));
        }
        if name.contains(['/', '\\', '\0']) {
            return Err(StoreError::invalid_input(
                "name",
                "must not contain path separators or NUL",
            ));
        }
        if name == "." || name == ".." {
            return Err(StoreError::invalid_input(
                "name",
                "must not be a directory reference",
            ));
        }
        Ok(())
    }

    fn check_length(&self, path: &Path) -> StoreResult<()> {
        let length = path.as_os_str().len();
        if length > self.config.max_path_len {
            return Err(StoreError::overflow(
                format!("resolved path {}", path.display()),
                length,
                self.config.max_path_len,
            ));
        }
        Ok(())
    }
}
