//! Console and file logging in the bot's line format:
//! `2026-01-01 12:00:00 - INFO - message`.

use chrono::Local;
use serde::Deserialize;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Built-in pairs of console and file levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogProfile {
    /// Console INFO, file DEBUG
    Standard,
    /// Console DEBUG, file INFO
    Verbose,
}

impl FromStr for LogProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(LogProfile::Standard),
            "verbose" => Ok(LogProfile::Verbose),
            other => Err(anyhow::anyhow!(
                "LOG_PROFILE must be `standard` or `verbose`, got {:?}",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub console_level: Level,
    pub file_level: Level,
    /// Appended to, never truncated
    pub file: PathBuf,
}

impl LoggingConfig {
    pub fn from_profile(profile: LogProfile) -> Self {
        let (console_level, file_level) = match profile {
            LogProfile::Standard => (Level::INFO, Level::DEBUG),
            LogProfile::Verbose => (Level::DEBUG, Level::INFO),
        };
        Self {
            console_level,
            file_level,
            file: PathBuf::from("bot.log"),
        }
    }

    /// Overrides the keys present in a `logging.toml` document.
    pub fn merge_toml(mut self, content: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct LoggingFile {
            console_level: Option<String>,
            file_level: Option<String>,
            file: Option<PathBuf>,
        }

        let parsed: LoggingFile = toml::from_str(content)?;
        if let Some(level) = parsed.console_level {
            self.console_level = parse_level(&level)?;
        }
        if let Some(level) = parsed.file_level {
            self.file_level = parse_level(&level)?;
        }
        if let Some(file) = parsed.file {
            self.file = file;
        }
        Ok(self)
    }
}

/// Accepts tracing level names plus `WARNING` and `CRITICAL`.
pub fn parse_level(raw: &str) -> anyhow::Result<Level> {
    match raw.trim().to_uppercase().as_str() {
        "WARNING" => Ok(Level::WARN),
        "CRITICAL" => Ok(Level::ERROR),
        other => other
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown log level {:?}", raw)),
    }
}

/// Level names as the bot has always printed them.
pub fn level_label(level: &Level) -> &'static str {
    if *level == Level::WARN {
        "WARNING"
    } else {
        level.as_str()
    }
}

/// Renders `<local time> - <LEVEL> - <fields>` on one line.
pub struct BotLogFormat;

impl<S, N> FormatEvent<S, N> for BotLogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} - {} - ",
            Local::now().format(TIMESTAMP_FORMAT),
            level_label(event.metadata().level())
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Opens `path` for appending, creating it and its directory if needed.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn file_layer(config: &LoggingConfig) -> io::Result<impl Layer<Registry>> {
    let file = open_log_file(&config.file)?;
    Ok(tracing_subscriber::fmt::layer()
        .event_format(BotLogFormat)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .with_filter(LevelFilter::from_level(config.file_level)))
}

/// Installs the global subscriber: console plus append-mode log file.
///
/// `RUST_LOG`, when set, replaces the console level.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let file_layer = file_layer(config)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.console_level.as_str().to_lowercase()));

    let console = tracing_subscriber::fmt::layer()
        .event_format(BotLogFormat)
        .with_writer(std::io::stdout)
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console)
        .try_init()?;
    Ok(())
}
