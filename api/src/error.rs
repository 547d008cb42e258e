use color_eyre::Report;
use poem::http::StatusCode;
use portal_data::account::SlurmUser;
use thiserror::Error;
use tracing::{error, warn};

/// Everything a handler can fail with. Each variant maps to one HTTP status; upstream
/// problems are never retried and no partial payload is sent.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("{requester} may not access {target}")]
    Forbidden { requester: SlurmUser, target: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("fetching from metrics store: {0:#}")]
    Upstream(Report),
    #[error("querying job database: {0:#}")]
    Database(Report),
    #[error("looking up allocation: {0:#}")]
    Allocation(Report),
}

impl PortalError {
    pub fn status(&self) -> StatusCode {
        match self {
            PortalError::Forbidden { .. } => StatusCode::FORBIDDEN,
            PortalError::NotFound(_) => StatusCode::NOT_FOUND,
            PortalError::Upstream(_) => StatusCode::BAD_GATEWAY,
            PortalError::Database(_) | PortalError::Allocation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        PortalError::NotFound(what.into())
    }
}

impl From<PortalError> for poem::Error {
    fn from(value: PortalError) -> Self {
        let status = value.status();
        if status.is_server_error() {
            error!("Error generated during API call: {value:#}");
        } else {
            warn!(%status, "rejected request: {value}");
        }
        poem::Error::from_string(format!("{value:#}"), status)
    }
}
