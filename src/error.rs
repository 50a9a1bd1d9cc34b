// Error types shared by the backend, drivers and tank controller

/// Errors raised by the actuator stack
#[derive(Debug, thiserror::Error)]
pub enum TankError {
    #[error("No GPIO provider available: {0}")]
    ResourceUnavailable(String),

    #[error("Missing pin mapping for {role}")]
    ConfigurationMissing { role: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid stepper speed {0} (must be a positive number of steps/s)")]
    InvalidSpeed(f64),

    #[error("Hardware already released")]
    UseAfterRelease,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TankError>;
