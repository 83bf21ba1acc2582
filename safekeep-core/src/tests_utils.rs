//! Test helpers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;

use crate::entropy::EntropySource;
use crate::error::StoreResult;

/// Fresh scratch directory, removed on drop.
pub fn temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("safekeep-test-")
        .tempdir()
        .expect("create temp dir")
}

/// Routes `log` output to the test harness, honouring `RUST_LOG`.
#[allow(dead_code, reason = "enable when debugging a test")]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Deterministic fill source that counts how often it was asked.
#[derive(Debug, Default)]
pub struct CountingEntropy {
    fills: AtomicUsize,
}

impl CountingEntropy {
    pub fn fills(&self) -> usize {
        self.fills.load(Ordering::SeqCst)
    }
}

impl EntropySource for CountingEntropy {
    fn fill(&self, buf: &mut [u8]) -> StoreResult<()> {
        let round = self.fills.fetch_add(1, Ordering::SeqCst);
        let tag = (round % 251) as u8;
        for byte in buf.iter_mut() {
            *byte = 0xA5 ^ tag;
        }
        Ok(())
    }
}
