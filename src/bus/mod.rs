//! Transport seam between the registration pipeline and the bus.
//!
//! The pipeline never talks to D-Bus directly. It asks a [`ProxyFactory`]
//! for a [`RemoteObject`] handle and drives it through three operations:
//! wait until ready, invoke a method, dispose.
//!
//! ```text
//!  ProxyFactory::create_proxy(target, ConnectionDescriptor)
//!        │
//!        ▼
//!  Arc<dyn RemoteObject> ── wait_ready() ──> ()
//!                        ── invoke(method, args) ──> Reply
//!                        ── dispose(reason)
//! ```
//!
//! The production implementation lives in [`zbus_transport`]; tests plug in
//! a fake that records call order.

#[cfg(test)]
pub(crate) mod testing;
pub mod zbus_transport;

use crate::endpoints::Endpoint;
use crate::error::BusError;
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use zbus_transport::ZbusProxyFactory;

/// Which well-known bus to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BusScope {
    #[default]
    System,
    Session,
    User,
    /// No well-known bus; only meaningful together with an explicit address.
    #[value(skip)]
    None,
}

/// How to behave when elevated privilege is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SuperuserPolicy {
    /// Fail outright when not privileged.
    #[default]
    Require,
    /// Proceed unprivileged when elevation is unavailable.
    Try,
}

impl fmt::Display for SuperuserPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuperuserPolicy::Require => f.write_str("require"),
            SuperuserPolicy::Try => f.write_str("try"),
        }
    }
}

/// Where a proxy's connection goes.
///
/// A private socket descriptor carries only an address: the scope of a
/// well-known bus cannot be expressed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    WellKnown {
        scope: BusScope,
        superuser: Option<SuperuserPolicy>,
    },
    PrivateSocket {
        /// Transport address received from a prior remote call.
        address: String,
        superuser: Option<SuperuserPolicy>,
    },
}

impl ConnectionDescriptor {
    pub fn system(superuser: SuperuserPolicy) -> Self {
        ConnectionDescriptor::WellKnown {
            scope: BusScope::System,
            superuser: Some(superuser),
        }
    }

    pub fn private_socket(address: impl Into<String>, superuser: Option<SuperuserPolicy>) -> Self {
        ConnectionDescriptor::PrivateSocket {
            address: address.into(),
            superuser,
        }
    }

    pub fn requires_elevation(&self) -> bool {
        self.superuser_policy().is_some()
    }

    pub fn superuser_policy(&self) -> Option<SuperuserPolicy> {
        match self {
            ConnectionDescriptor::WellKnown { superuser, .. }
            | ConnectionDescriptor::PrivateSocket { superuser, .. } => *superuser,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, ConnectionDescriptor::PrivateSocket { .. })
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDescriptor::WellKnown { scope, .. } => write!(f, "{:?} bus", scope),
            ConnectionDescriptor::PrivateSocket { address, .. } => {
                write!(f, "private socket {}", address)
            }
        }
    }
}

/// A value in a registration option map.
///
/// Options are `bool | string`, connection options also allow numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl OptionValue {
    /// Parse a CLI value: `true`/`false` become booleans, integers become numbers.
    pub fn infer(raw: &str) -> Self {
        match raw {
            "true" => OptionValue::Bool(true),
            "false" => OptionValue::Bool(false),
            _ => raw
                .parse::<i64>()
                .map(OptionValue::Int)
                .unwrap_or_else(|_| OptionValue::Str(raw.to_string())),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Str(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Str(s)
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

impl From<i64> for OptionValue {
    fn from(n: i64) -> Self {
        OptionValue::Int(n)
    }
}

/// String-keyed option map sent as `a{sv}`.
pub type OptionMap = BTreeMap<String, OptionValue>;

/// One positional method argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Str(String),
    StrList(Vec<String>),
    Dict(OptionMap),
    /// Sent wrapped in a variant.
    Variant(OptionValue),
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

/// Decoded body of a method reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The method returns nothing.
    Unit,
    Str(String),
    StrList(Vec<String>),
    /// A variant: its type signature and a printed value.
    Variant { signature: String, value: String },
}

impl Reply {
    fn describe(&self) -> &'static str {
        match self {
            Reply::Unit => "no value",
            Reply::Str(_) => "a string",
            Reply::StrList(_) => "a string list",
            Reply::Variant { .. } => "a variant",
        }
    }

    /// Expect a single string.
    pub fn into_string(self) -> Result<String, BusError> {
        match self {
            Reply::Str(s) => Ok(s),
            other => Err(BusError::Protocol(format!(
                "expected a string, got {}",
                other.describe()
            ))),
        }
    }

    /// Expect a list of strings.
    pub fn into_string_list(self) -> Result<Vec<String>, BusError> {
        match self {
            Reply::StrList(v) => Ok(v),
            other => Err(BusError::Protocol(format!(
                "expected a string list, got {}",
                other.describe()
            ))),
        }
    }

    /// Expect no value. Any value is tolerated and discarded.
    pub fn into_unit(self) -> Result<(), BusError> {
        Ok(())
    }
}

/// A handle to one remote object.
///
/// A handle is created lazily: connection problems surface from the first
/// `wait_ready` or `invoke`, never from construction.
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// Where this handle points, for logs.
    fn describe(&self) -> String;

    /// Resolve once the remote object is usable.
    async fn wait_ready(&self) -> Result<(), BusError>;

    /// Call `method` on the object's interface with positional arguments.
    async fn invoke(&self, method: &str, args: Vec<Arg>) -> Result<Reply, BusError>;

    /// Release the handle and its connection. Later operations fail.
    /// Disposing twice is a no-op.
    fn dispose(&self, reason: Option<&str>);
}

/// Produces remote-object handles.
///
/// `target` is the bus name of the peer; `None` addresses the only peer on
/// a private connection.
pub trait ProxyFactory: Send + Sync {
    fn create_proxy(
        &self,
        target: Option<&str>,
        endpoint: &Endpoint,
        connection: &ConnectionDescriptor,
    ) -> Arc<dyn RemoteObject>;
}
