use std::error::Error;
use std::fmt::{Display, Formatter};

/// Taxonomy of errors produced by the transfer manager (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    NetworkUnreachable,
    TransportFailure,
    AuthenticationFailure,
    ClientRestorationFailure,
    DecompositionFailure,
    PersistenceFailure,
    Canceled,
    InvalidState,
}

impl TransferErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferErrorKind::NetworkUnreachable => "transfer/network-unreachable",
            TransferErrorKind::TransportFailure => "transfer/transport-failure",
            TransferErrorKind::AuthenticationFailure => "transfer/authentication-failure",
            TransferErrorKind::ClientRestorationFailure => "transfer/client-restoration-failure",
            TransferErrorKind::DecompositionFailure => "transfer/decomposition-failure",
            TransferErrorKind::PersistenceFailure => "transfer/persistence-failure",
            TransferErrorKind::Canceled => "transfer/canceled",
            TransferErrorKind::InvalidState => "transfer/invalid-state",
        }
    }

    /// Whether this kind should cause the owning transfer to transition to `Failed`
    /// (spec §7: `NetworkUnreachable`, `Canceled` and `InvalidState` never fail a transfer).
    pub fn is_fatal_to_transfer(&self) -> bool {
        !matches!(
            self,
            TransferErrorKind::NetworkUnreachable
                | TransferErrorKind::Canceled
                | TransferErrorKind::InvalidState
        )
    }
}

#[derive(Debug, Clone)]
pub struct TransferError {
    pub kind: TransferErrorKind,
    message: String,
    pub status: Option<u16>,
    pub server_response: Option<String>,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            server_response: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_server_response(mut self, response: impl Into<String>) -> Self {
        self.server_response = Some(response.into());
        self
    }

    pub fn code_str(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(server) = &self.server_response {
            write!(f, "{} ({}): {}", self.message, self.code_str(), server)
        } else {
            write!(f, "{} ({})", self.message, self.code_str())
        }
    }
}

impl Error for TransferError {}

pub type TransferResult<T> = Result<T, TransferError>;

pub fn network_unreachable() -> TransferError {
    TransferError::new(
        TransferErrorKind::NetworkUnreachable,
        "the network is currently unreachable",
    )
}

pub fn transport_failure(message: impl Into<String>) -> TransferError {
    TransferError::new(TransferErrorKind::TransportFailure, message)
}

pub fn authentication_failure(message: impl Into<String>) -> TransferError {
    TransferError::new(TransferErrorKind::AuthenticationFailure, message)
}

pub fn client_restoration_failure(restoration_id: &str) -> TransferError {
    TransferError::new(
        TransferErrorKind::ClientRestorationFailure,
        format!("no HTTP client could be restored for restoration id '{restoration_id}'"),
    )
}

pub fn decomposition_failure(message: impl Into<String>) -> TransferError {
    TransferError::new(TransferErrorKind::DecompositionFailure, message)
}

pub fn persistence_failure(message: impl Into<String>) -> TransferError {
    TransferError::new(TransferErrorKind::PersistenceFailure, message)
}

pub fn canceled() -> TransferError {
    TransferError::new(TransferErrorKind::Canceled, "the transfer was canceled")
}

pub fn invalid_state(message: impl Into<String>) -> TransferError {
    TransferError::new(TransferErrorKind::InvalidState, message)
}
