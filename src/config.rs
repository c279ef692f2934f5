use rust_decimal::Error as DecimalParseError;
use std::env;
use std::fmt;
use std::num::{ParseFloatError, ParseIntError};
use std::path::PathBuf;

/// How decisions leave the engine. Dry journals instead of trading; Live
/// requires an interactive confirmation per entry; LiveTest submits without
/// confirmation and is meant for rehearsals against the paper broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Dry,
    Live,
    LiveTest,
}

impl RunMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "dry" | "dry_run" => Some(RunMode::Dry),
            "live" => Some(RunMode::Live),
            "live_test" | "livetest" => Some(RunMode::LiveTest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Dry => "dry",
            RunMode::Live => "live",
            RunMode::LiveTest => "live_test",
        }
    }

    pub fn submits_orders(self) -> bool {
        !matches!(self, RunMode::Dry)
    }

    pub fn requires_confirmation(self) -> bool {
        matches!(self, RunMode::Live)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ParseIntError(ParseIntError),
    ParseFloatError(ParseFloatError),
    DecimalParseError(DecimalParseError),
    OtherError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseIntError(e) => write!(f, "Parse int error: {}", e),
            ConfigError::ParseFloatError(e) => write!(f, "Parse float error: {}", e),
            ConfigError::DecimalParseError(e) => write!(f, "Decimal parse error: {}", e),
            ConfigError::OtherError(e) => write!(f, "{}", e),
        }
    }
}

impl From<ParseIntError> for ConfigError {
    fn from(err: ParseIntError) -> ConfigError {
        ConfigError::ParseIntError(err)
    }
}

impl From<ParseFloatError> for ConfigError {
    fn from(err: ParseFloatError) -> ConfigError {
        ConfigError::ParseFloatError(err)
    }
}

impl From<rust_decimal::Error> for ConfigError {
    fn from(err: rust_decimal::Error) -> ConfigError {
        ConfigError::DecimalParseError(err)
    }
}

pub fn get_run_mode_from_env() -> Result<RunMode, ConfigError> {
    match env::var("RUN_MODE") {
        Ok(value) => RunMode::parse(&value).ok_or_else(|| {
            ConfigError::OtherError(format!(
                "RUN_MODE '{}' not recognized (dry, live, live_test)",
                value
            ))
        }),
        Err(_) => Ok(RunMode::Dry),
    }
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub broker_name: String,
    pub replay_file: Option<PathBuf>,
}

impl BrokerSettings {
    fn from_parts(broker_name: String, replay_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        if broker_name == "replay" && replay_file.is_none() {
            return Err(ConfigError::OtherError(
                "REPLAY_FILE must be set for the replay broker".to_string(),
            ));
        }
        if broker_name != "replay" && replay_file.is_some() {
            log::warn!("[CONFIG] REPLAY_FILE is set but broker is '{}'", broker_name);
        }
        Ok(Self {
            broker_name,
            replay_file,
        })
    }
}

pub fn get_broker_settings_from_env() -> Result<BrokerSettings, ConfigError> {
    let broker_name = env::var("BROKER").unwrap_or_else(|_| "paper".to_string());
    let replay_file = env::var("REPLAY_FILE")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    BrokerSettings::from_parts(broker_name, replay_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_parses_known_values() {
        assert_eq!(RunMode::parse("dry"), Some(RunMode::Dry));
        assert_eq!(RunMode::parse("DRY"), Some(RunMode::Dry));
        assert_eq!(RunMode::parse("live"), Some(RunMode::Live));
        assert_eq!(RunMode::parse("live_test"), Some(RunMode::LiveTest));
        assert_eq!(RunMode::parse("backtest"), None);
    }

    #[test]
    fn run_mode_behavior_split() {
        assert!(!RunMode::Dry.submits_orders());
        assert!(RunMode::Live.submits_orders());
        assert!(RunMode::LiveTest.submits_orders());
        assert!(RunMode::Live.requires_confirmation());
        assert!(!RunMode::LiveTest.requires_confirmation());
    }

    #[test]
    fn replay_broker_requires_a_file() {
        assert!(BrokerSettings::from_parts("replay".to_string(), None).is_err());
        let ok = BrokerSettings::from_parts(
            "replay".to_string(),
            Some(PathBuf::from("/tmp/tape.jsonl")),
        )
        .unwrap();
        assert_eq!(ok.broker_name, "replay");
    }
}
