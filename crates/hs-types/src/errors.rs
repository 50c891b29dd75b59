use thiserror::Error;

/// Main error type for the Hypersweep system
#[derive(Error, Debug)]
pub enum HsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Malformed sweep definitions. Always surfaced before any run is dispatched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Duplicate parameter: {name}")]
    DuplicateParameter { name: String },

    #[error("Parameter {name} has no candidate values")]
    EmptyCandidateSet { name: String },

    #[error("Parameter {name} lists candidate {value} more than once")]
    DuplicateCandidate { name: String, value: String },

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },

    #[error("Command template references unknown parameter: {name}")]
    UnboundPlaceholder { name: String },

    #[error("Search space has no parameters")]
    NoParameters,

    #[error("Search space too large to enumerate")]
    SpaceTooLarge,

    #[error("{0}")]
    Invalid(String),
}

/// Per-trial failures. These are recorded against the trial, never raised past
/// the worker boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("Failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    #[error("Run exited with status {}", exit_label(.exit_code))]
    Failed { exit_code: Option<i32> },

    #[error("Metric {name} was never reported")]
    MissingMetric { name: String },

    #[error("Run {run_id} cancelled")]
    Cancelled { run_id: String },

    #[error("Run IO error: {message}")]
    Io { message: String },
}

/// Search-strategy errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("Requested {requested} trials but only {available} remain")]
    ExhaustedSpace { requested: usize, available: usize },
}

/// Result type alias for Hypersweep operations
pub type HsResult<T> = Result<T, HsError>;

/// Result alias for launching and awaiting runs.
pub type DispatchResult<T> = Result<T, RunError>;

fn exit_label(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl From<std::io::Error> for RunError {
    fn from(err: std::io::Error) -> Self {
        RunError::Io {
            message: err.to_string(),
        }
    }
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ConfigError::Invalid(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HsError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SearchError::ExhaustedSpace {
            requested: 50,
            available: 42,
        };

        assert!(error.to_string().contains("50"));
        assert!(error.to_string().contains("42"));

        let failed = RunError::Failed { exit_code: Some(3) };
        assert_eq!(failed.to_string(), "Run exited with status 3");

        let killed = RunError::Failed { exit_code: None };
        assert_eq!(killed.to_string(), "Run exited with status signal");
    }

    #[test]
    fn test_error_conversion() {
        let config_error = ConfigError::DuplicateParameter {
            name: "decorr_lr".to_string(),
        };
        let hs_error: HsError = config_error.into();

        match hs_error {
            HsError::Config(ConfigError::DuplicateParameter { name }) => {
                assert_eq!(name, "decorr_lr")
            }
            _ => panic!("Expected Config error"),
        }

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let run_error: RunError = io.into();
        assert!(matches!(run_error, RunError::Io { .. }));
    }

    #[test]
    fn test_macros() {
        let config_err = config_error!("Missing required field: {}", "metric");
        assert_eq!(
            config_err,
            ConfigError::Invalid("Missing required field: metric".to_string())
        );
        let internal_err = internal_error!("worker {} vanished", 3);
        assert!(internal_err.to_string().contains("worker 3"));
    }
}
