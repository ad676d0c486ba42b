use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed market data: {0}")]
    MalformedData(String),
    #[error("feed session rejected: {0}")]
    Session(String),
    #[error("feed channel closed: {0}")]
    ChannelClosed(&'static str),
    #[error("ledger request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("feed socket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("payload decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("numeric parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_convert_with_context() {
        let error: AppError = "1e".parse::<f64>().unwrap_err().into();
        assert!(error.to_string().starts_with("numeric parse error"));
    }

    #[test]
    fn socket_errors_are_boxed() {
        let error: AppError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(error, AppError::WebSocket(_)));
    }
}
