//! Command line parsing
//!
//! Usage:
//!   chunkcam record -c <config> [OPTIONS]
//!   chunkcam check <dir> [--json]
//!
//! Record options:
//!   -c, --config <path>        Configuration file (TOML)
//!   -o, --output <dir>         Output directory (default: recordings/<timestamp>)
//!   -i, --camera-id <n>        Apply the n-th `cam_specific` section
//!   -t, --test                 Record from the simulated trigger camera
//!   -f, --force                Delete videos and ledgers left in the output directory
//!   -l, --log <level>          debug | info | warning | error (default: info)
//!   --gst-debug-level <n>      GStreamer debug level, 0-9
//!   --ignore-exposure          Record even if the exposure is too long for the frame rate

use std::path::PathBuf;

pub const USAGE: &str = "\
Usage:
  chunkcam record -c <config> [-o <dir>] [-i <cam-id>] [-t] [-f] [-l <level>] [--gst-debug-level <n>] [--ignore-exposure]
  chunkcam check <dir> [--json]";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CliError {
    #[error("missing command\n{usage}", usage = USAGE)]
    MissingCommand,

    #[error("unknown command '{0}'\n{usage}", usage = USAGE)]
    UnknownCommand(String),

    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("option '{0}' requires a value")]
    MissingValue(String),

    #[error("invalid value '{value}' for '{option}'")]
    InvalidValue { option: String, value: String },

    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),
}

/// Log verbosity accepted by `--log`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Default filter for env_logger
    pub fn filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordArgs {
    pub config: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub camera_id: Option<usize>,
    pub test: bool,
    pub force: bool,
    pub log_level: LogLevel,
    pub gst_debug_level: Option<u8>,
    pub ignore_exposure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckArgs {
    pub dir: PathBuf,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Record(RecordArgs),
    Check(CheckArgs),
    Help,
}

/// Parse arguments, without the program name
pub fn parse_args<I, S>(args: I) -> Result<Command, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let Some((command, rest)) = args.split_first() else {
        return Err(CliError::MissingCommand);
    };

    match command.as_str() {
        "record" => parse_record(rest).map(Command::Record),
        "check" => parse_check(rest).map(Command::Check),
        "-h" | "--help" | "help" => Ok(Command::Help),
        other => Err(CliError::UnknownCommand(other.to_string())),
    }
}

fn value<'a>(option: &str, iter: &mut impl Iterator<Item = &'a String>) -> Result<&'a String, CliError> {
    iter.next().ok_or_else(|| CliError::MissingValue(option.to_string()))
}

fn parsed<T: std::str::FromStr>(option: &str, value: &str) -> Result<T, CliError> {
    value.parse().map_err(|_| CliError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
    })
}

fn parse_record(args: &[String]) -> Result<RecordArgs, CliError> {
    let mut record = RecordArgs::default();
    let mut config = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => config = Some(PathBuf::from(value(arg, &mut iter)?)),
            "-o" | "--output" => record.output_dir = Some(PathBuf::from(value(arg, &mut iter)?)),
            "-i" | "--camera-id" => record.camera_id = Some(parsed(arg, value(arg, &mut iter)?)?),
            "-l" | "--log" => record.log_level = parsed(arg, value(arg, &mut iter)?)?,
            "--gst-debug-level" => {
                let level: u8 = parsed(arg, value(arg, &mut iter)?)?;
                if level > 9 {
                    return Err(CliError::InvalidValue {
                        option: arg.clone(),
                        value: level.to_string(),
                    });
                }
                record.gst_debug_level = Some(level);
            }
            "-t" | "--test" => record.test = true,
            "-f" | "--force" => record.force = true,
            "--ignore-exposure" => record.ignore_exposure = true,
            other => return Err(CliError::UnknownOption(other.to_string())),
        }
    }

    record.config = config.ok_or(CliError::MissingArgument("--config <path>"))?;
    Ok(record)
}

fn parse_check(args: &[String]) -> Result<CheckArgs, CliError> {
    let json = args.iter().any(|a| a == "--json");
    let mut positional = args.iter().filter(|a| *a != "--json");

    let dir = positional.next().ok_or(CliError::MissingArgument("<dir>"))?;
    if let Some(extra) = positional.next() {
        return Err(CliError::UnknownOption(extra.clone()));
    }

    Ok(CheckArgs {
        dir: PathBuf::from(dir),
        json,
    })
}
