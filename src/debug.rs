// Debug message routing
//
// Every backend owns one sink. Messages are mirrored to the `log` facade and,
// when set, to the user callback. The level decides what gets through.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use crate::types::{DebugLevel, Severity};

/// User callback receiving backend diagnostics
pub type DebugCallback = Arc<dyn Fn(Severity, &str) + Send + Sync>;

pub struct DebugSink {
    level: DebugLevel,
    callback: RwLock<Option<DebugCallback>>,
}

impl DebugSink {
    pub fn new(level: DebugLevel) -> Self {
        Self {
            level,
            callback: RwLock::new(None),
        }
    }

    pub fn level(&self) -> DebugLevel {
        self.level
    }

    pub fn set_callback(&self, callback: Option<DebugCallback>) {
        *self.callback.write() = callback;
    }

    /// Validation warnings and errors are reported from `Low` upwards
    pub fn is_low_level(&self) -> bool {
        self.level >= DebugLevel::Low
    }

    pub fn is_high_level(&self) -> bool {
        self.level >= DebugLevel::High
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.emit(Severity::Info, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.emit(Severity::Warning, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.emit(Severity::Error, message);
    }

    pub fn emit(&self, severity: Severity, message: impl fmt::Display) {
        let required = match severity {
            Severity::Info => DebugLevel::High,
            Severity::Warning | Severity::Error => DebugLevel::Low,
        };
        if self.level < required {
            return;
        }

        let severity = if self.level == DebugLevel::Paranoid && severity == Severity::Warning {
            Severity::Error
        } else {
            severity
        };

        let message = message.to_string();
        match severity {
            Severity::Info => log::info!(target: "pulse", "{}", message),
            Severity::Warning => log::warn!(target: "pulse", "{}", message),
            Severity::Error => log::error!(target: "pulse", "{}", message),
        }

        // Clone out of the lock so a callback may replace itself
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(severity, &message);
        }
    }
}

impl fmt::Debug for DebugSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSink")
            .field("level", &self.level)
            .field("has_callback", &self.callback.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn collecting(level: DebugLevel) -> (DebugSink, Arc<Mutex<Vec<(Severity, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = DebugSink::new(level);
        let target = seen.clone();
        sink.set_callback(Some(Arc::new(move |severity, message: &str| {
            target.lock().push((severity, message.to_string()));
        })));
        (sink, seen)
    }

    #[test]
    fn paranoid_promotes_warnings() {
        let (sink, seen) = collecting(DebugLevel::Paranoid);
        sink.warn("suspicious");
        sink.info("hello");
        let seen = seen.lock();
        assert_eq!(seen[0], (Severity::Error, "suspicious".to_string()));
        assert_eq!(seen[1], (Severity::Info, "hello".to_string()));
    }

    #[test]
    fn low_level_filters_info() {
        let (sink, seen) = collecting(DebugLevel::Low);
        sink.info("dropped");
        sink.warn("kept");
        assert_eq!(*seen.lock(), vec![(Severity::Warning, "kept".to_string())]);
    }

    #[test]
    fn no_debug_is_silent() {
        let (sink, seen) = collecting(DebugLevel::NoDebug);
        sink.error("nothing");
        assert!(seen.lock().is_empty());
    }
}
