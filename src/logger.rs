//! # Logger Module
//!
//! Every component of the pipeline receives a [`Logger`] handle when it is constructed rather
//! than reaching for a global. A handle carries the name its records are tagged with, a maximum
//! level, and optionally the [`log::Log`] implementation records are dispatched to. Handles
//! without an explicit sink forward to whatever logger was installed with the `log` facade.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::fmt;
use std::sync::Arc;

use log::{Level, LevelFilter, Log, Record};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Target name used when no other name is given.
pub const DEFAULT_TARGET: &str = "cv_stereocam";

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A cheap, cloneable logging handle.
#[derive(Clone)]
pub struct Logger {
    target: Arc<str>,

    max_level: LevelFilter,

    sink: Option<Arc<dyn Log>>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Logger {
    /// Create a new handle which forwards to the global `log` facade.
    pub fn new<S: Into<String>>(target: S) -> Self {
        Self {
            target: Arc::from(target.into()),
            max_level: LevelFilter::Info,
            sink: None
        }
    }

    /// Dispatch records to `sink` instead of the global logger.
    pub fn with_sink(mut self, sink: Arc<dyn Log>) -> Self {
        self.sink = Some(sink);

        self
    }

    /// Set the most verbose level this handle will emit.
    pub fn with_max_level(mut self, max_level: LevelFilter) -> Self {
        self.max_level = max_level;

        self
    }

    /// Create a handle for a sub-component, sharing the sink and level of this one.
    ///
    /// The new target is `<parent>::<name>`.
    pub fn child(&self, name: &str) -> Self {
        Self {
            target: Arc::from(format!("{}::{}", self.target, name)),
            max_level: self.max_level,
            sink: self.sink.clone()
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    pub fn set_max_level(&mut self, max_level: LevelFilter) {
        self.max_level = max_level;
    }

    /// Returns true if a record at `level` would be emitted by this handle.
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.max_level
    }

    /// Emit a single record with a pre-formatted message.
    pub fn log(&self, level: Level, message: &str) {
        if !self.enabled(level) {
            return;
        }

        self.dispatch(
            &Record::builder()
                .level(level)
                .target(&self.target)
                .module_path_static(Some(module_path!()))
                .args(format_args!("{}", message))
                .build()
        );
    }

    pub fn error<S: AsRef<str>>(&self, message: S) {
        self.log(Level::Error, message.as_ref());
    }

    pub fn warn<S: AsRef<str>>(&self, message: S) {
        self.log(Level::Warn, message.as_ref());
    }

    pub fn info<S: AsRef<str>>(&self, message: S) {
        self.log(Level::Info, message.as_ref());
    }

    pub fn debug<S: AsRef<str>>(&self, message: S) {
        self.log(Level::Debug, message.as_ref());
    }

    fn dispatch(&self, record: &Record) {
        match self.sink {
            Some(ref sink) => {
                if sink.enabled(record.metadata()) {
                    sink.log(record);
                }
            },
            None => {
                let global = log::logger();
                if global.enabled(record.metadata()) {
                    global.log(record);
                }
            }
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET)
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("target", &self.target)
            .field("max_level", &self.max_level)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

// -----------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Map the numeric log level used in camera configuration files to a level filter.
///
/// `1` outputs runtime information, `2` adds debug information.
pub fn level_from_config(level: u8) -> Option<LevelFilter> {
    match level {
        1 => Some(LevelFilter::Info),
        2 => Some(LevelFilter::Debug),
        _ => None
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemoryLog {
        records: Mutex<Vec<(Level, String, String)>>
    }

    impl Log for MemoryLog {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            self.records.lock().push((
                record.level(),
                record.target().to_string(),
                record.args().to_string()
            ));
        }

        fn flush(&self) {}
    }

    #[test]
    fn records_reach_injected_sink() {
        let sink = Arc::new(MemoryLog::default());
        let logger = Logger::new("camera").with_sink(sink.clone());

        logger.info(format!("opened /dev/video{}", 0));
        logger.error("read timed out");

        let records = sink.records.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (Level::Info, "camera".into(), "opened /dev/video0".into()));
        assert_eq!(records[1].0, Level::Error);
    }

    #[test]
    fn level_filter_drops_debug_by_default() {
        let sink = Arc::new(MemoryLog::default());
        let mut logger = Logger::new("camera").with_sink(sink.clone());

        logger.debug("hidden");
        assert!(sink.records.lock().is_empty());

        logger.set_max_level(LevelFilter::Debug);
        logger.debug("shown");
        assert_eq!(sink.records.lock().len(), 1);
    }

    #[test]
    fn child_shares_sink_and_extends_target() {
        let sink = Arc::new(MemoryLog::default());
        let logger = Logger::new("camera").with_sink(sink.clone());

        logger.child("capture").warn("retrying");

        let records = sink.records.lock();
        assert_eq!(records[0].1, "camera::capture");
    }

    #[test]
    fn config_levels() {
        assert_eq!(level_from_config(1), Some(LevelFilter::Info));
        assert_eq!(level_from_config(2), Some(LevelFilter::Debug));
        assert_eq!(level_from_config(0), None);
        assert_eq!(level_from_config(3), None);
    }
}
