//! Forwarding of this crate's log records to a host logging system.
//!
//! The crate logs through the `log` facade. Security events (creation races,
//! probe/open identity mismatches, refused links) go out at `warn`; the
//! individual open, lock and erase steps at `debug`. A host that already
//! runs a `log` implementation needs nothing from this module. A host with
//! its own pipeline installs a [`Logger`] once with [`set_logger`].

use std::sync::{Arc, OnceLock};

/// Module prefix of records that are always forwarded, whatever their level.
const CRATE_PREFIX: &str = "safekeep";

/// Destination for forwarded records.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use safekeep_core::logger::{set_logger, LogLevel, Logger};
///
/// struct Syslog;
///
/// impl Logger for Syslog {
///     fn log(&self, level: LogLevel, message: String) {
///         eprintln!("keystore[{level:?}] {message}");
///     }
/// }
///
/// set_logger(Arc::new(Syslog));
/// ```
pub trait Logger: Send + Sync {
    /// Receives one record.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity of a forwarded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Very detailed tracing.
    Trace,
    /// Open, lock and erase steps.
    Debug,
    /// Progress messages.
    Info,
    /// Security events and swallowed cleanup failures.
    Warn,
    /// Errors.
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug => Self::Debug,
            log::Level::Trace => Self::Trace,
        }
    }
}

static HOST_LOGGER: OnceLock<Arc<dyn Logger>> = OnceLock::new();
static BRIDGE: HostBridge = HostBridge;

/// Everything from this crate; `info` and above from dependencies.
fn should_forward(record: &log::Record<'_>) -> bool {
    record.level() <= log::Level::Info
        || record
            .module_path()
            .is_some_and(|path| path.starts_with(CRATE_PREFIX))
}

fn forward(sink: &dyn Logger, record: &log::Record<'_>) {
    if should_forward(record) {
        sink.log(record.level().into(), record.args().to_string());
    }
}

/// `log` implementation handing records to the installed [`Logger`].
struct HostBridge;

impl log::Log for HostBridge {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        match HOST_LOGGER.get() {
            Some(sink) => forward(sink.as_ref(), record),
            None => eprintln!("safekeep: no host logger installed: {}", record.args()),
        }
    }

    fn flush(&self) {}
}

/// Installs `logger` as the destination for log records.
///
/// Only the first call takes effect. If the process already installed a
/// different `log` implementation, records keep going there; the notice is
/// printed to stderr since no logger is available to report it.
pub fn set_logger(logger: Arc<dyn Logger>) {
    if HOST_LOGGER.set(logger).is_err() {
        eprintln!("safekeep: host logger already installed, keeping the first one");
        return;
    }

    match log::set_logger(&BRIDGE) {
        Ok(()) => log::set_max_level(log::LevelFilter::Trace),
        Err(err) => eprintln!("safekeep: cannot install log bridge: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use log::Log;

    use super::*;

    #[derive(Default)]
    struct Capture {
        records: Mutex<Vec<(LogLevel, String)>>,
    }

    impl Capture {
        fn take(&self) -> Vec<(LogLevel, String)> {
            std::mem::take(&mut *self.records.lock().expect("capture lock"))
        }
    }

    impl Logger for Capture {
        fn log(&self, level: LogLevel, message: String) {
            self.records
                .lock()
                .expect("capture lock")
                .push((level, message));
        }
    }

    #[test]
    fn test_own_debug_records_are_forwarded() {
        let capture = Capture::default();
        forward(
            &capture,
            &log::Record::builder()
                .level(log::Level::Debug)
                .module_path(Some("safekeep_core::eraser"))
                .args(format_args!("erasing /keys/userkey.p15"))
                .build(),
        );
        assert_eq!(
            capture.take(),
            vec![(LogLevel::Debug, "erasing /keys/userkey.p15".to_string())]
        );
    }

    #[test]
    fn test_dependency_debug_records_are_dropped() {
        let capture = Capture::default();
        forward(
            &capture,
            &log::Record::builder()
                .level(log::Level::Debug)
                .module_path(Some("serde_json::de"))
                .args(format_args!("parsed config"))
                .build(),
        );
        forward(
            &capture,
            &log::Record::builder()
                .level(log::Level::Trace)
                .module_path(None)
                .args(format_args!("no module"))
                .build(),
        );
        assert!(capture.take().is_empty());

        forward(
            &capture,
            &log::Record::builder()
                .level(log::Level::Warn)
                .module_path(Some("serde_json::de"))
                .args(format_args!("dependency warning"))
                .build(),
        );
        assert_eq!(
            capture.take(),
            vec![(LogLevel::Warn, "dependency warning".to_string())]
        );
    }

    #[test]
    fn test_installed_logger_receives_bridge_records() {
        let capture = Arc::new(Capture::default());
        set_logger(Arc::clone(&capture) as Arc<dyn Logger>);

        BRIDGE.log(
            &log::Record::builder()
                .level(log::Level::Warn)
                .module_path(Some("safekeep_core::opener"))
                .args(format_args!("creation race on /keys/userkey.p15"))
                .build(),
        );
        assert_eq!(
            capture.take(),
            vec![(LogLevel::Warn, "creation race on /keys/userkey.p15".to_string())]
        );
    }
}
