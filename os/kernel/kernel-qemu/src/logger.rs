use crate::qemu_fmt::QemuSink;
use core::fmt::{self, Write};
use kernel_sync::{SpinLock, SyncOnceCell};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Reports the index of the calling core.
pub type CoreIdHook = fn() -> usize;

pub struct QemuLogger {
    max_level: LevelFilter,
    /// Serializes whole records.
    console: SpinLock<QemuSink>,
    core_id: SyncOnceCell<CoreIdHook>,
}

static LOGGER: SyncOnceCell<QemuLogger> = SyncOnceCell::new();

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level,
            console: SpinLock::new(QemuSink),
            core_id: SyncOnceCell::new(),
        }
    }

    /// Installs the logger. Call once during early boot.
    ///
    /// # Errors
    /// If a logger was already installed.
    pub fn init(self) -> Result<&'static Self, SetLoggerError> {
        let max_level = self.max_level;
        let logger = LOGGER.get_or_init(|| self);
        log::set_logger(logger)?;
        log::set_max_level(max_level);
        Ok(logger)
    }

    /// Tags records with the core from `hook` instead of core 0. Takes
    /// effect once per-core state exists.
    pub fn set_core_id_hook(&self, hook: CoreIdHook) {
        if self.core_id.set(hook).is_err() {
            log::warn!("core id hook installed twice");
        }
    }

    fn core(&self) -> usize {
        self.core_id.get().map_or(0, |hook| hook())
    }
}

/// Writes one record as `[LEVEL cpuN] target: message\n`.
///
/// # Errors
/// Whatever `out` reports.
pub fn format_record(out: &mut impl Write, core: usize, record: &Record) -> fmt::Result {
    writeln!(
        out,
        "[{:<5} cpu{core}] {}: {}",
        record.level(),
        record.target(),
        record.args()
    )
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let core = self.core();
        let mut console = self.console.lock();
        let _ = format_record(&mut *console, core, record);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn record_layout() {
        let mut out = String::new();
        format_record(
            &mut out,
            2,
            &Record::builder()
                .level(Level::Info)
                .target("kernel_alloc::pmm")
                .args(format_args!("{} frames free", 42))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[INFO  cpu2] kernel_alloc::pmm: 42 frames free\n");
    }

    #[test]
    fn level_filter() {
        let logger = QemuLogger::new(LevelFilter::Info);
        let debug = Metadata::builder().level(Level::Debug).build();
        let warn = Metadata::builder().level(Level::Warn).build();
        assert!(!logger.enabled(&debug));
        assert!(logger.enabled(&warn));
    }

    #[test]
    fn core_hook_tags_records() {
        let logger = QemuLogger::new(LevelFilter::Trace);
        assert_eq!(logger.core(), 0);
        logger.set_core_id_hook(|| 3);
        assert_eq!(logger.core(), 3);
    }
}
