//! Logging setup shared by the CLI entry point: tracing-subscriber with a
//! daily-rotating file layer (ANSI stripped so the file stays plain text)
//! and a plain stderr layer for interactive use.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn strip_ansi_bytes(buf: &[u8]) -> Vec<u8> {
    let s = match std::str::from_utf8(buf) {
        Ok(s) => s,
        Err(_) => return buf.to_vec(),
    };
    let mut result = String::new();
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' {
            in_escape = true;
        } else if in_escape {
            if c == 'm' || c.is_ascii_alphabetic() {
                in_escape = false;
            }
        } else {
            result.push(c);
        }
    }
    result.into_bytes()
}

struct StripAnsiWriter<W: Write + Send> {
    buffer: Vec<u8>,
    inner: Mutex<W>,
}

impl<W: Write + Send> StripAnsiWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            buffer: Vec::new(),
            inner: Mutex::new(inner),
        }
    }
}

impl<W: Write + Send> Write for StripAnsiWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        while let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=i).collect();
            let stripped = strip_ansi_bytes(&line);
            let mut w = self.inner.lock().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            w.write_all(&stripped)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut w = self.inner.lock().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        w.flush()
    }
}

unsafe impl<W: Write + Send> Send for StripAnsiWriter<W> {}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub max_files: usize,
    pub level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir().join("videosentinel"),
            max_files: 5,
            level: Level::INFO,
        }
    }
}

impl LogConfig {
    pub fn with_log_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.log_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

/// Initializes the global tracing subscriber: a plain-text daily log file
/// plus a colored stderr layer for interactive runs.
pub fn init_logging(program_name: &str, config: LogConfig) -> Result<()> {
    std::fs::create_dir_all(&config.log_dir).with_context(|| format!("failed to create log directory: {:?}", config.log_dir))?;

    let log_file_name = format!("{program_name}.log");
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, &log_file_name);
    let file_writer = Mutex::new(StripAnsiWriter::new(file_appender));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{program_name}={},videosentinel_core={}", config.level, config.level)));

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_line_number(false);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .with_level(false)
        .with_line_number(false)
        .without_time();

    tracing_subscriber::registry().with(env_filter).with(file_layer).with(stderr_layer).init();

    cleanup_old_logs(&config.log_dir, program_name, config.max_files)?;

    Ok(())
}

fn cleanup_old_logs(log_dir: &Path, program_name: &str, max_files: usize) -> Result<()> {
    let entries = std::fs::read_dir(log_dir).with_context(|| format!("failed to read log directory: {log_dir:?}"))?;

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with(program_name) && name.ends_with(".log") {
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    log_files.push((path, modified));
                }
            }
        }
    }

    if log_files.len() > max_files {
        log_files.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _) in log_files.iter().skip(max_files) {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = ?path, error = %e, "failed to remove old log file");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_points_at_temp_dir() {
        let config = LogConfig::default();
        assert_eq!(config.max_files, 5);
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn cleanup_keeps_only_the_newest_files() {
        let temp = TempDir::new().unwrap();
        for i in 0..10 {
            std::fs::write(temp.path().join(format!("vs.{i}.log")), b"x").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        cleanup_old_logs(temp.path(), "vs", 3).unwrap();
        let remaining: Vec<_> = std::fs::read_dir(temp.path()).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(remaining.len(), 3);
    }
}
