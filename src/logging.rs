// Logging setup: env_logger to stderr, plus a record.log in the output directory

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use anyhow::Context;

use crate::cli::LogLevel;

/// Log file written next to the recordings
pub const RECORD_LOG_NAME: &str = "record.log";

/// Sends every log line to stderr and to the run's log file
pub struct TeeWriter {
    file: File,
}

impl TeeWriter {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // stderr is best effort, the file is the record
        let _ = io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}

/// `12:30:05.042 - WARN - message`
fn log_line(time: chrono::NaiveTime, level: log::Level, message: impl std::fmt::Display) -> String {
    format!("{} - {} - {}", time.format("%H:%M:%S%.3f"), level, message)
}

/// Initialize env_logger; `RUST_LOG` takes precedence over `level`.
///
/// With `log_dir`, the log is also written to `<log_dir>/record.log`,
/// replacing the file of a previous run.
pub fn init_logging(level: LogLevel, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.filter())
    );
    builder.format(|buf, record| {
        writeln!(buf, "{}", log_line(chrono::Local::now().time(), record.level(), record.args()))
    });

    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(RECORD_LOG_NAME);
        let file = File::create(&path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        builder
            .target(env_logger::Target::Pipe(Box::new(TeeWriter::new(file))))
            .write_style(env_logger::WriteStyle::Never);
    }

    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_millisecond_timestamps() {
        let time = chrono::NaiveTime::from_hms_milli_opt(12, 30, 5, 42).unwrap();
        assert_eq!(
            log_line(time, log::Level::Warn, "Frame dropped"),
            "12:30:05.042 - WARN - Frame dropped"
        );
    }

    #[test]
    fn tee_writes_through_to_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(RECORD_LOG_NAME);
        let mut tee = TeeWriter::new(File::create(&path).unwrap());

        writeln!(tee, "first").unwrap();
        writeln!(tee, "second").unwrap();
        tee.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
