use anyhow::Context;
use log::{LevelFilter, Metadata, Record};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

#[inline(always)]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

/// Mute all log records, used by interactive frontends while they own the terminal.
pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst)
}

pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst)
}

/// [`env_logger::Logger`] that can be switched off at runtime.
struct SwitchableLogger {
    inner: env_logger::Logger,
}

impl log::Log for SwitchableLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        is_enabled() && self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if is_enabled() {
            self.inner.log(record)
        }
    }

    fn flush(&self) {
        self.inner.flush()
    }
}

/// Install a global logger.
///
/// # Arguments
///
/// * `default_filter`: filter used when `RUST_LOG` is not set (env_logger syntax, like `info`
///   or `slink=debug,wire=trace`)
/// * `file`: append records to this file instead of stderr
///
/// Does nothing if a logger is already installed.
pub fn init(default_filter: &str, file: Option<&Path>) -> anyhow::Result<()> {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let mut builder = env_logger::Builder::from_env(env);
    builder.format_timestamp_millis();
    if let Some(path) = file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    let inner = builder.build();
    let filter: LevelFilter = inner.filter();

    if log::set_boxed_logger(Box::new(SwitchableLogger { inner })).is_ok() {
        log::set_max_level(filter);
    }
    Ok(())
}
