use crate::HubError;

/// Converts transport results into `HubError`, keeping the retryable/permanent split intact
pub trait Catch<T>: Send + Sized {
    fn catch(self) -> Result<T, HubError>;
}

impl<T: Send> Catch<T> for Result<T, reqwest::Error> {
    fn catch(self) -> Result<T, HubError> {
        self.map_err(classify)
    }
}

fn classify(e: reqwest::Error) -> HubError {
    // Bot API URLs embed the token
    let e = e.without_url();
    if e.is_timeout() {
        HubError::Timeout(e.to_string())
    } else if e.is_connect() {
        HubError::ConnectionFailed(e.to_string())
    } else if e.is_decode() {
        HubError::ApiError(format!("malformed response body: {e}"))
    } else if e.is_builder() {
        HubError::ConfigurationError(e.to_string())
    } else {
        HubError::TransportError(e.to_string())
    }
}
