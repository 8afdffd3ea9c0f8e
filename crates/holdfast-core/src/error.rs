use thiserror::Error;

#[derive(Error, Debug)]
pub enum HoldfastError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Device registry error: {0}")]
    Registry(String),

    #[error("Command dispatch failed: {0}")]
    Dispatch(String),
}

pub type Result<T> = std::result::Result<T, HoldfastError>;
