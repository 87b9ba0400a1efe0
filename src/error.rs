use thiserror::Error;

#[derive(Error, Debug)]
pub enum JenkinsError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Jenkins API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("build for job {job} already started{}", .build_number.map(|n| format!(" as #{n}")).unwrap_or_default())]
    AlreadyStarted {
        job: String,
        build_number: Option<u64>,
    },

    #[error("could not start build: {job} #{number} not found after {retries} attempts")]
    BuildNotFound {
        job: String,
        number: u64,
        retries: u32,
    },

    #[error("build {job} #{number} finished with result {result}")]
    BuildFailed {
        job: String,
        number: u64,
        result: String,
    },

    #[error("log stream error: {0}")]
    Stream(String),

    #[error("invalid job config XML: {0}")]
    Xml(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, JenkinsError>;
