use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<AdapterError>,
    },
    #[error("API returned an empty response")]
    EmptyResponse,
}

impl AdapterError {
    pub fn retry_exhausted(attempts: usize, source: AdapterError) -> Self {
        AdapterError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Configuration mistakes and client errors other than 408/429 fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::InvalidConfig(_) | AdapterError::RetryExhausted { .. } => false,
            AdapterError::HttpStatus { status, .. } => {
                !status.is_client_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retried() {
        let status = |code: u16| AdapterError::HttpStatus {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        };
        assert!(!status(401).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!AdapterError::InvalidConfig("x".into()).is_retryable());
        assert!(AdapterError::EmptyResponse.is_retryable());
    }
}
