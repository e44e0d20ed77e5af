use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Channel(#[from] moltis_channels::Error),

    #[error("account {account_id} is not connected")]
    NotConnected { account_id: String },

    #[error("invalid wechat config: {message}")]
    Config { message: String },

    #[error("delivery failed: {message}")]
    Delivery { message: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_connected(account_id: impl Into<String>) -> Self {
        Self::NotConnected {
            account_id: account_id.into(),
        }
    }
}

impl moltis_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

impl From<Error> for moltis_channels::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Channel(inner) => inner,
            Error::Json(inner) => Self::SerdeJson(inner),
            Error::NotConnected { .. } => Self::unavailable(err),
            Error::Config { .. } | Error::Delivery { .. } => Self::invalid_input(err),
            other => Self::external("wechat", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

moltis_common::impl_context!();
