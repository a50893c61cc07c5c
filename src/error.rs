use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArrivalsError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Upstream returned status {status} for {url}")]
    UpstreamStatus { status: u16, url: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("File error: {0}")]
    FileError(String),

    #[error("Invalid stop id {0:?}")]
    InvalidStopId(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl From<reqwest::Error> for ArrivalsError {
    fn from(e: reqwest::Error) -> Self {
        ArrivalsError::NetworkError(e.to_string())
    }
}

impl From<csv::Error> for ArrivalsError {
    fn from(e: csv::Error) -> Self {
        ArrivalsError::FileError(e.to_string())
    }
}

impl From<zip::result::ZipError> for ArrivalsError {
    fn from(e: zip::result::ZipError) -> Self {
        ArrivalsError::FileError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ArrivalsError>;
