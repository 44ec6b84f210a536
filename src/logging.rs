use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Logger as FlexiLogger, Naming, WriteMode};
use log::LevelFilter;
use tokio::task_local;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Clone, Copy)]
struct LineFormat {
    pid: bool,
    caller: bool,
    trace_id: bool,
}

const DEFAULT_LINE_FORMAT: LineFormat = LineFormat {
    pid: true,
    caller: false,
    trace_id: true,
};

static LINE_FORMAT: OnceLock<LineFormat> = OnceLock::new();

task_local! {
    static TRACE_ID: String;
}

pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        parse_level(&config.level)
    };

    LINE_FORMAT.get_or_init(|| LineFormat {
        pid: !config.nopid,
        caller: config.caller,
        trace_id: config.traceid,
    });

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .format_for_stdout(log_format);

    if !config.path.trim().is_empty() {
        let spec = FileSpec::try_from(Path::new(&config.path)).context("logger.path")?;
        logger = logger
            .log_to_file(spec)
            .format(log_format)
            .duplicate_to_stderr(Duplicate::Warn);
        if config.max_size > 0 {
            logger = logger.rotate(
                Criterion::Size(config.max_size * 1024 * 1024),
                Naming::Numbers,
                cleanup_policy(config),
            );
        }
        logger = logger.write_mode(WriteMode::BufferAndFlush);
    }

    // The handle flushes on drop; the logger lives as long as the process.
    std::mem::forget(logger.start().context("start logger")?);
    Ok(())
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

fn cleanup_policy(config: &Logger) -> Cleanup {
    if config.max_backups > 0 {
        Cleanup::KeepLogFiles(config.max_backups as usize)
    } else {
        Cleanup::Never
    }
}

fn log_format(writer: &mut dyn Write, now: &mut DeferredNow, record: &log::Record) -> std::io::Result<()> {
    let fmt = LINE_FORMAT.get().copied().unwrap_or(DEFAULT_LINE_FORMAT);
    write!(writer, "{} [{}]", now.now_utc_owned().format(TIMESTAMP_FORMAT), record.level())?;
    if fmt.pid {
        write!(writer, " pid={}", std::process::id())?;
    }
    if fmt.trace_id {
        match current_trace_id() {
            Some(id) => write!(writer, " trace_id={id}")?,
            None => write!(writer, " trace_id=-")?,
        }
    }
    if fmt.caller {
        write!(writer, " {}:{}", record.file().unwrap_or("-"), record.line().unwrap_or(0))?;
    }
    write!(writer, " {}", record.args())
}

/// Runs `fut` with `trace_id` attached to every log line it emits.
pub async fn with_trace_id<T>(trace_id: String, fut: impl Future<Output = T>) -> T {
    TRACE_ID.scope(trace_id, fut).await
}

pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|val| val.clone()).ok()
}
