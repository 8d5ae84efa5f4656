use log::{info, LevelFilter, SetLoggerError};
use log4rs::{
  append::console::ConsoleAppender,
  config::{runtime::ConfigErrors, Appender, Root},
  Config,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggingError {
  #[error("invalid log level: {0}")]
  InvalidLevel(String),

  #[error(transparent)]
  Config(#[from] ConfigErrors),

  #[error(transparent)]
  Init(#[from] SetLoggerError),
}

/// Logs to stdout at the level named by `LOG_LEVEL` (debug by default).
pub fn initialize() -> Result<log4rs::Handle, LoggingError> {
  let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "DEBUG".into());
  let level_filter = parse_level_filter(&log_level).ok_or_else(|| LoggingError::InvalidLevel(log_level.clone()))?;

  let stdout = ConsoleAppender::builder().build();
  let config = Config::builder()
    .appender(Appender::builder().build("stdout", Box::new(stdout)))
    .build(Root::builder().appender("stdout").build(level_filter))?;

  let handle = log4rs::init_config(config)?;
  info!("Logging Level: {}", &level_filter);
  Ok(handle)
}

pub fn parse_level_filter(str: &str) -> Option<LevelFilter> {
  match str.to_lowercase().as_str() {
    "off" => Some(LevelFilter::Off),
    "error" => Some(LevelFilter::Error),
    "warn" => Some(LevelFilter::Warn),
    "info" => Some(LevelFilter::Info),
    "debug" => Some(LevelFilter::Debug),
    "trace" => Some(LevelFilter::Trace),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  pub fn level_names_are_case_insensitive() {
    assert_eq!(parse_level_filter("WARN"), Some(LevelFilter::Warn));
    assert_eq!(parse_level_filter("trace"), Some(LevelFilter::Trace));
  }

  #[test]
  pub fn unknown_level_is_rejected() {
    assert_eq!(parse_level_filter("verbose"), None);
  }
}
