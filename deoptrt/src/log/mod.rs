//! The implementation of the `DEOPTD_LOG` environment variable.

use std::{env, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

use crate::errors::DeoptError;

pub mod stats;

/// How verbose should the deoptimiser's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log the start and end of each deoptimisation and each invalidated code object.
    DeoptEvent,
    /// Log each output frame built and the translation it was built from.
    Translation,
}

#[derive(Debug)]
pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    /// Configure logging from `DEOPTD_LOG`, which must be of the form `[<path|->:]<level>`.
    pub fn from_env() -> Result<Self, DeoptError> {
        match env::var("DEOPTD_LOG") {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    fn parse(s: &str) -> Result<Self, DeoptError> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any previous log so that later appends start from a clean file.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => {
                return Err(DeoptError::Config(
                    "DEOPTD_LOG must be of the format `[<path|->:]<level>`".into(),
                ));
            }
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| DeoptError::Config(format!("Invalid DEOPTD_LOG level '{s}': {e}")))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level).ok_or_else(|| {
            DeoptError::Config(format!(
                "DEOPTD_LOG level {level} exceeds maximum {max_level}"
            ))
        })?;
        Ok(Self { path, level })
    }

    /// A log which records nothing.
    pub fn disabled() -> Self {
        Self {
            path: None,
            level: Verbosity::Disabled,
        }
    }

    /// Would a message at `level` be recorded?
    pub fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "deopt-error",
                Verbosity::Warning => "deopt-warning",
                Verbosity::DeoptEvent => "deopt-event",
                Verbosity::Translation => "deopt-translation",
            };
            match &self.path {
                Some(p) => {
                    let s = msg
                        .lines()
                        .map(|x| format!("{prefix}: {x}\n"))
                        .collect::<String>();
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    for x in msg.lines() {
                        eprintln!("{prefix}: {x}");
                    }
                }
            }
        }
    }
}
