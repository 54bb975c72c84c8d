// Logging setup
//
// Everything goes to stderr with a colored level. While a case runs, the same
// lines are also appended to `<logs>/<case>.log`; the file sink is switched
// between cases without reinstalling the logger.

use anyhow::{Context, Result};
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Log level selectable on the command line
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Switchable per-case log file
#[derive(Clone, Default)]
pub struct CaseLog {
    file: Arc<Mutex<Option<File>>>,
}

impl CaseLog {
    /// Route file output to `<logs_path>/<case>.log`
    pub fn switch_to(&self, logs_path: &Path, case: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(logs_path)
            .with_context(|| format!("Failed to create logs directory {}", logs_path.display()))?;
        let path = logs_path.join(format!("{}.log", case));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open case log {}", path.display()))?;
        *self.file.lock() = Some(file);
        Ok(path)
    }

    /// Stop writing to the current case file
    pub fn close(&self) {
        if let Some(mut file) = self.file.lock().take() {
            let _ = file.flush();
        }
    }

    fn write(&self, record: &log::Record) {
        if let Some(file) = self.file.lock().as_mut() {
            let _ = writeln!(file, "{}", record.args());
        }
    }
}

/// Install the global logger
pub fn init(level: LevelFilter, color: bool, case_log: CaseLog) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Cyan)
        .trace(Color::BrightBlack);

    let stderr = fern::Dispatch::new()
        .format(move |out, message, record| {
            let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            if color {
                out.finish(format_args!(
                    "[{}] [{}] [{}] {}",
                    time,
                    colors.color(record.level()),
                    record.target(),
                    message
                ))
            } else {
                out.finish(format_args!(
                    "[{}] [{}] [{}] {}",
                    time,
                    record.level(),
                    record.target(),
                    message
                ))
            }
        })
        .chain(std::io::stderr());

    let file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                message
            ))
        })
        .chain(fern::Output::call(move |record| case_log.write(record)));

    fern::Dispatch::new()
        .level(level)
        // Keep HTTP client chatter out of case logs
        .level_for("hyper", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .chain(stderr)
        .chain(file)
        .apply()
        .context("Failed to install logger")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_log_switches_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CaseLog::default();

        let first = sink.switch_to(dir.path(), "CaseA").unwrap();
        sink.write(&log::Record::builder().args(format_args!("one")).build());
        let second = sink.switch_to(dir.path(), "CaseB").unwrap();
        sink.write(&log::Record::builder().args(format_args!("two")).build());
        sink.close();
        sink.write(&log::Record::builder().args(format_args!("dropped")).build());

        assert_eq!(std::fs::read_to_string(first).unwrap(), "one\n");
        assert_eq!(std::fs::read_to_string(second).unwrap(), "two\n");
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(LevelFilter::from(LogLevel::Debug), LevelFilter::Debug);
        assert_eq!(LevelFilter::from(LogLevel::Off), LevelFilter::Off);
    }
}
