//! Engine log setup. The executor installs the process-wide subscriber at run
//! entry from the [`LogOptions`] it carries; the first run wins and every
//! later call is a no-op, so embedders that install their own subscriber
//! beforehand are never clobbered.
//!
//! Environment overrides: `FLOWRUN_LOG` (filter directives; `off` silences
//! everything), `FLOWRUN_LOG_FORMAT` (`console` or `json`), `FLOWRUN_LOG_FILE`
//! (write to this file instead of stdout). `RUST_LOG` applies when no filter
//! is set anywhere else.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INSTALLED: OnceCell<bool> = OnceCell::new();

/// Output format for engine logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Console,
    /// One JSON event per line; pairs with the `BlockLog` record for
    /// machine ingestion.
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "console" | "compact" | "text" => Some(LogFormat::Console),
            "json" | "jsonl" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration carried in
/// [`ExecutorOptions`](crate::executor::ExecutorOptions).
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Never install a subscriber from this executor (for embedders that own
    /// the process-wide dispatch).
    pub disabled: bool,
    /// Filter directives, e.g. `flowrun_core=debug`. Unset falls back to
    /// `RUST_LOG`, then to the engine-scoped default.
    pub filter: Option<String>,
    pub format: LogFormat,
    /// Log destination; stdout when unset.
    pub file: Option<PathBuf>,
}

impl LogOptions {
    /// Block and layer events from the engine and handler crates at `info`,
    /// third-party noise capped at `warn`.
    fn default_filter() -> EnvFilter {
        EnvFilter::new("warn,flowrun_core=info,flowrun_handlers=info")
    }

    fn overlaid(&self) -> Self {
        let mut resolved = self.clone();
        if let Ok(raw) = std::env::var("FLOWRUN_LOG") {
            resolved.filter = Some(raw);
        }
        if let Ok(raw) = std::env::var("FLOWRUN_LOG_FORMAT")
            && let Some(format) = LogFormat::parse(&raw)
        {
            resolved.format = format;
        }
        if let Ok(raw) = std::env::var("FLOWRUN_LOG_FILE") {
            resolved.file = Some(PathBuf::from(raw));
        }
        resolved
    }

    fn filter(&self) -> EnvFilter {
        match &self.filter {
            Some(directives) => {
                EnvFilter::try_new(directives).unwrap_or_else(|_| Self::default_filter())
            }
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| Self::default_filter()),
        }
    }

    fn writer(&self) -> BoxMakeWriter {
        match self.file.as_deref() {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    let _ = std::fs::create_dir_all(parent);
                }
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("flowrun.log");
                BoxMakeWriter::new(tracing_appender::rolling::never(dir, name))
            }
            None => BoxMakeWriter::new(std::io::stdout),
        }
    }
}

/// Install the process-wide subscriber for engine logs. Idempotent: only the
/// first caller's options take effect. Returns whether this call installed it.
pub fn init_logging(options: &LogOptions) -> bool {
    *INSTALLED.get_or_init(|| {
        let options = options.overlaid();
        if options.disabled {
            return false;
        }
        let base = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(options.writer());
        let registry = tracing_subscriber::registry().with(options.filter());
        match options.format {
            LogFormat::Json => registry
                .with(base.json().with_current_span(true))
                .try_init()
                .is_ok(),
            LogFormat::Console => registry.with(base.compact()).try_init().is_ok(),
        }
    })
}
