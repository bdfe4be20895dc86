//! Error kinds per the error handling design: each variant maps to an
//! HTTP status and a JSON error envelope `{error_code, reason}`.

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal I/O error: {0}")]
    InternalIo(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("parse warning: {0}")]
    ParseWarning(String),
}

impl ServerError {
    pub fn http_status(&self) -> u16 {
        match self {
            ServerError::BadRequest(_) => 400,
            ServerError::NotFound(_) => 404,
            ServerError::InternalIo(_) => 500,
            ServerError::NotImplemented(_) => 501,
            ServerError::ParseWarning(_) => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::BadRequest(_) => "BadRequest",
            ServerError::NotFound(_) => "NotFound",
            ServerError::InternalIo(_) => "InternalIO",
            ServerError::NotImplemented(_) => "NotImplemented",
            ServerError::ParseWarning(_) => "ParseWarning",
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::InternalIo(e.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::BadRequest(format!("invalid json: {e}"))
    }
}
