use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Process-wide logger forwarding records to a replaceable implementation.
pub static LOGGER_SWITCHER: Lazy<LoggerSwitcher> = Lazy::new(LoggerSwitcher::default);

#[derive(Default)]
pub struct LoggerSwitcher {
    inner: RwLock<Option<Box<dyn Log>>>,
    installed: AtomicBool,
}

impl LoggerSwitcher {
    /// Replace the current logger. The first call installs the switcher as the global logger.
    pub fn switch(&'static self, logger: impl Log + 'static, filter: LevelFilter) {
        {
            let mut inner = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(old) = inner.as_ref() {
                old.flush();
            }
            *inner = Some(Box::new(logger));
        }

        if !self.installed.swap(true, Ordering::SeqCst) {
            if let Err(e) = log::set_logger(self) {
                eprintln!("install logger: {e}");
            }
        }
        log::set_max_level(filter);
    }
}

impl Log for LoggerSwitcher {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match self.inner.read() {
            Ok(inner) => inner.as_ref().map(|l| l.enabled(metadata)).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn log(&self, record: &Record) {
        if let Ok(inner) = self.inner.read() {
            if let Some(logger) = inner.as_ref() {
                logger.log(record)
            }
        }
    }

    fn flush(&self) {
        if let Ok(inner) = self.inner.read() {
            if let Some(logger) = inner.as_ref() {
                logger.flush()
            }
        }
    }
}
