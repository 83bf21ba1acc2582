//! Source of unpredictable fill bytes for wipe passes.

use rand::{rngs::OsRng, RngCore};

use crate::error::{StoreError, StoreResult};

/// Fills buffers with unpredictable bytes.
///
/// Wipe passes request a fresh fill for every chunk, so compressing or
/// deduplicating storage layers cannot collapse the overwrite pattern.
pub trait EntropySource: Send + Sync {
    /// Overwrites all of `buf` with unpredictable bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is unavailable.
    fn fill(&self, buf: &mut [u8]) -> StoreResult<()>;
}

/// Operating-system randomness.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> StoreResult<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|err| StoreError::write(format!("entropy source: {err}")))
    }
}
