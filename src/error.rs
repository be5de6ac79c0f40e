//! Error taxonomy for bus operations.
//!
//! Every failure in a registration pipeline ends up as exactly one of these
//! variants. The type is `Clone` because readiness outcomes and pipeline
//! results are replayed to every subscriber.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus or the private socket could not be reached.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Elevated privilege was required and is not available.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The remote method returned a fault.
    #[error("Remote call failed: {0}")]
    RemoteCall(String),

    /// The remote side answered with a value of an unexpected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A readiness wait or a remote call did not finish in time.
    #[error("Timed out after {0:?} while {1}")]
    Timeout(Duration, String),

    /// The pipeline was cancelled before it produced a value.
    #[error("Operation cancelled")]
    Cancelled,
}

impl BusError {
    /// Short machine-friendly name of the variant, used in logs and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::Connection(_) => "connection",
            BusError::Permission(_) => "permission",
            BusError::RemoteCall(_) => "remote_call",
            BusError::Protocol(_) => "protocol",
            BusError::Timeout(..) => "timeout",
            BusError::Cancelled => "cancelled",
        }
    }
}

impl From<zbus::Error> for BusError {
    fn from(e: zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(name, detail, _) => {
                let message = detail.unwrap_or_else(|| name.to_string());
                if is_access_denied(name.as_str()) {
                    BusError::Permission(message)
                } else {
                    BusError::RemoteCall(message)
                }
            }
            zbus::Error::FDO(fdo) => match *fdo {
                zbus::fdo::Error::AccessDenied(msg) | zbus::fdo::Error::AuthFailed(msg) => {
                    BusError::Permission(msg)
                }
                zbus::fdo::Error::ServiceUnknown(msg)
                | zbus::fdo::Error::NameHasNoOwner(msg)
                | zbus::fdo::Error::NoServer(msg)
                | zbus::fdo::Error::Disconnected(msg) => BusError::Connection(msg),
                other => BusError::RemoteCall(other.to_string()),
            },
            zbus::Error::InputOutput(io) => BusError::Connection(io.to_string()),
            zbus::Error::Address(msg) => BusError::Connection(format!("bad address: {}", msg)),
            zbus::Error::Handshake(msg) => BusError::Connection(format!("handshake: {}", msg)),
            zbus::Error::Variant(v) => BusError::Protocol(v.to_string()),
            zbus::Error::InvalidReply => BusError::Protocol("invalid reply".to_string()),
            other => BusError::Connection(other.to_string()),
        }
    }
}

fn is_access_denied(error_name: &str) -> bool {
    error_name.ends_with(".AccessDenied")
        || error_name.ends_with(".AuthFailed")
        || error_name.ends_with(".InteractiveAuthorizationRequired")
}
