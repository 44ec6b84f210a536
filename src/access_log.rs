use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;

/// One served request.
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
    pub client: &'a str,
    pub method: &'a str,
    pub target: &'a str,
    pub status: u16,
    pub bytes: Option<u64>,
    pub duration_ms: u128,
    pub cache_status: Option<&'a str>,
    pub request_id: &'a str,
}

impl AccessRecord<'_> {
    /// Space separated; missing values are `-`, spaces inside fields become `+`.
    pub fn format_line(&self, time: &str) -> String {
        let bytes = self.bytes.map(|n| n.to_string());
        let fields = [
            field(self.client),
            field(time),
            field(self.method),
            field(self.target),
            self.status.to_string(),
            field(bytes.as_deref().unwrap_or("")),
            self.duration_ms.to_string(),
            field(self.cache_status.unwrap_or("")),
            field(self.request_id),
        ];
        let mut line = fields.join(" ");
        line.push('\n');
        line
    }
}

fn field(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.replace(' ', "+")
    }
}

enum Sink {
    File { file: File, path: PathBuf, hour: String },
    Stdout,
}

pub struct AccessLogger {
    sink: Mutex<Sink>,
}

impl AccessLogger {
    /// Logs to stdout when `path` is empty. Files are rotated hourly by
    /// renaming the current one with a `.YYYYmmddHH` suffix.
    pub fn new(path: &str) -> Result<Self> {
        let sink = if path.trim().is_empty() {
            Sink::Stdout
        } else {
            let path = PathBuf::from(path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
            }
            Sink::File {
                file: open_append(&path)?,
                path,
                hour: current_hour(),
            }
        };
        Ok(Self { sink: Mutex::new(sink) })
    }

    pub fn log(&self, record: &AccessRecord<'_>) {
        let line = record.format_line(&Local::now().format("[%d/%b/%Y:%H:%M:%S %z]").to_string());
        let Ok(mut sink) = self.sink.lock() else { return };
        match &mut *sink {
            Sink::Stdout => {
                let _ = std::io::stdout().write_all(line.as_bytes());
            }
            Sink::File { file, path, hour } => {
                let now = current_hour();
                if *hour != now {
                    let rotated = PathBuf::from(format!("{}.{}", path.display(), hour));
                    let _ = fs::rename(&*path, rotated);
                    match open_append(path) {
                        Ok(fresh) => *file = fresh,
                        Err(err) => log::warn!("access log rotation failed: {err}"),
                    }
                    *hour = now;
                }
                let _ = file.write_all(line.as_bytes());
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open access log {}", path.display()))
}

fn current_hour() -> String {
    Local::now().format("%Y%m%d%H").to_string()
}
