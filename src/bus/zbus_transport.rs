//! `zbus`-backed remote-object handles.
//!
//! Each handle owns its own connection, opened on first use:
//! - well-known handles connect to the system or session bus and address
//!   the peer by bus name;
//! - private-socket handles open a peer-to-peer connection to the address
//!   handed out by `RegisterServer.Start` and address the only peer on it.

use super::{
    Arg, BusScope, ConnectionDescriptor, OptionValue, ProxyFactory, RemoteObject, Reply,
    SuperuserPolicy,
};
use crate::endpoints::Endpoint;
use crate::error::BusError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use zbus::zvariant::{OwnedValue, Structure, StructureBuilder, Value};
use zbus::Connection;

const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Factory for [`ZbusObject`] handles.
#[derive(Debug, Clone, Default)]
pub struct ZbusProxyFactory;

impl ZbusProxyFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ProxyFactory for ZbusProxyFactory {
    fn create_proxy(
        &self,
        target: Option<&str>,
        endpoint: &Endpoint,
        connection: &ConnectionDescriptor,
    ) -> Arc<dyn RemoteObject> {
        Arc::new(ZbusObject::new(
            target.map(str::to_string),
            endpoint.clone(),
            connection.clone(),
        ))
    }
}

/// A remote object reached through `zbus`.
pub struct ZbusObject {
    destination: Option<String>,
    endpoint: Endpoint,
    descriptor: ConnectionDescriptor,
    connection: OnceCell<Connection>,
    disposed: AtomicBool,
}

impl ZbusObject {
    pub fn new(destination: Option<String>, endpoint: Endpoint, descriptor: ConnectionDescriptor) -> Self {
        Self {
            destination,
            endpoint,
            descriptor,
            connection: OnceCell::new(),
            disposed: AtomicBool::new(false),
        }
    }

    fn disposed_error(&self) -> BusError {
        BusError::Connection(format!("{} has been disposed", self.describe()))
    }

    async fn connection(&self) -> Result<&Connection, BusError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(self.disposed_error());
        }
        let connection = self
            .connection
            .get_or_try_init(|| connect(&self.descriptor))
            .await?;

        // Disposed while connecting: `dispose` found nothing to close.
        if self.disposed.load(Ordering::SeqCst) {
            if let Err(e) = connection.clone().close().await {
                debug!("Closing connection failed: {}", e);
            }
            return Err(self.disposed_error());
        }
        Ok(connection)
    }
}

#[async_trait]
impl RemoteObject for ZbusObject {
    fn describe(&self) -> String {
        format!(
            "{} at {} on {}",
            self.endpoint.interface, self.endpoint.object_path, self.descriptor
        )
    }

    async fn wait_ready(&self) -> Result<(), BusError> {
        let connection = self.connection().await?;
        // Pinging the object activates the service on the system bus and
        // proves the peer answers on a private socket.
        connection
            .call_method(
                self.destination.as_deref(),
                self.endpoint.object_path.as_str(),
                Some(PEER_INTERFACE),
                "Ping",
                &(),
            )
            .await?;
        debug!("{} is ready", self.describe());
        Ok(())
    }

    async fn invoke(&self, method: &str, args: Vec<Arg>) -> Result<Reply, BusError> {
        let connection = self.connection().await?;
        let destination = self.destination.as_deref();
        let path = self.endpoint.object_path.as_str();
        let interface = Some(self.endpoint.interface.as_str());

        let reply = if args.is_empty() {
            connection
                .call_method(destination, path, interface, method, &())
                .await?
        } else {
            let body = build_body(args)?;
            connection
                .call_method(destination, path, interface, method, &body)
                .await?
        };

        decode_reply(&reply)
    }

    fn dispose(&self, reason: Option<&str>) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            "Disposing {} ({})",
            self.describe(),
            reason.unwrap_or("no reason given")
        );

        let Some(connection) = self.connection.get().cloned() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = connection.close().await {
                        debug!("Closing connection failed: {}", e);
                    }
                });
            }
            // Without a runtime the connection closes once the last clone drops.
            Err(_) => drop(connection),
        }
    }
}

async fn connect(descriptor: &ConnectionDescriptor) -> Result<Connection, BusError> {
    check_elevation(descriptor.superuser_policy(), descriptor)?;

    let connection = match descriptor {
        ConnectionDescriptor::WellKnown { scope, .. } => match scope {
            BusScope::System => Connection::system().await?,
            BusScope::Session | BusScope::User => Connection::session().await?,
            BusScope::None => {
                return Err(BusError::Connection(
                    "no bus scope and no address given".to_string(),
                ))
            }
        },
        ConnectionDescriptor::PrivateSocket { address, .. } => {
            if address.trim().is_empty() {
                return Err(BusError::Protocol(
                    "private socket address is empty".to_string(),
                ));
            }
            zbus::connection::Builder::address(address.as_str())?
                .p2p()
                .build()
                .await?
        }
    };

    debug!("Connected to {}", descriptor);
    Ok(connection)
}

fn check_elevation(
    policy: Option<SuperuserPolicy>,
    descriptor: &ConnectionDescriptor,
) -> Result<(), BusError> {
    match policy {
        None => Ok(()),
        Some(_) if is_privileged() => Ok(()),
        Some(SuperuserPolicy::Require) => Err(BusError::Permission(format!(
            "superuser access is required for {}",
            descriptor
        ))),
        Some(SuperuserPolicy::Try) => {
            warn!(
                "Superuser access unavailable, continuing unprivileged on {}",
                descriptor
            );
            Ok(())
        }
    }
}

#[cfg(unix)]
fn is_privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn is_privileged() -> bool {
    false
}

fn option_value(value: OptionValue) -> Value<'static> {
    match value {
        OptionValue::Bool(b) => Value::from(b),
        OptionValue::Int(n) => Value::from(n),
        OptionValue::Str(s) => Value::from(s),
    }
}

/// Pack positional arguments into a message body.
fn build_body(args: Vec<Arg>) -> Result<Structure<'static>, BusError> {
    let mut builder = StructureBuilder::new();
    for arg in args {
        builder = match arg {
            Arg::Str(s) => builder.append_field(Value::from(s)),
            Arg::StrList(items) => builder.append_field(Value::from(items)),
            Arg::Dict(map) => {
                let dict: HashMap<String, Value<'static>> = map
                    .into_iter()
                    .map(|(k, v)| (k, option_value(v)))
                    .collect();
                builder.append_field(Value::from(dict))
            }
            Arg::Variant(v) => builder.append_field(Value::new(option_value(v))),
        };
    }
    builder
        .build()
        .map_err(|e| BusError::Protocol(format!("cannot encode arguments: {}", e)))
}

fn decode_reply(message: &zbus::Message) -> Result<Reply, BusError> {
    let body = message.body();
    let signature = body.signature().to_string();
    match signature.as_str() {
        "" => Ok(Reply::Unit),
        "s" => Ok(Reply::Str(body.deserialize::<String>()?)),
        "as" => Ok(Reply::StrList(body.deserialize::<Vec<String>>()?)),
        "v" => {
            let value: OwnedValue = body.deserialize()?;
            reply_from_value(Value::new(Value::from(value)))
        }
        _ => {
            let structure: Structure<'_> = body.deserialize()?;
            match structure.into_fields().into_iter().next() {
                Some(first) => reply_from_value(first),
                None => Ok(Reply::Unit),
            }
        }
    }
}

fn reply_from_value(value: Value<'_>) -> Result<Reply, BusError> {
    match value {
        Value::Str(s) => Ok(Reply::Str(s.to_string())),
        Value::Array(array) => {
            let items = Vec::<String>::try_from(array)
                .map_err(|e| BusError::Protocol(format!("expected a string list: {}", e)))?;
            Ok(Reply::StrList(items))
        }
        Value::Value(inner) => {
            let signature = inner.value_signature().to_string();
            let value = match *inner {
                Value::Str(s) => s.to_string(),
                other => other.to_string(),
            };
            Ok(Reply::Variant { signature, value })
        }
        other => Ok(Reply::Variant {
            signature: other.value_signature().to_string(),
            value: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::OptionMap;
    use crate::endpoints::endpoint;

    #[test]
    fn test_reply_from_plain_string() {
        let reply = reply_from_value(Value::from("unix:abstract=test-socket")).unwrap();
        assert_eq!(reply, Reply::Str("unix:abstract=test-socket".to_string()));
    }

    #[test]
    fn test_reply_from_string_list() {
        let reply = reply_from_value(Value::from(vec!["server", "rhsm"])).unwrap();
        assert_eq!(
            reply,
            Reply::StrList(vec!["server".to_string(), "rhsm".to_string()])
        );
    }

    #[test]
    fn test_reply_from_variant() {
        let reply = reply_from_value(Value::new(Value::from("subscription.rhsm.redhat.com"))).unwrap();
        assert_eq!(
            reply,
            Reply::Variant {
                signature: "s".to_string(),
                value: "subscription.rhsm.redhat.com".to_string(),
            }
        );
    }

    #[test]
    fn test_build_body_fields() {
        let mut connect = OptionMap::new();
        connect.insert("host".into(), "sub.example.com".into());
        connect.insert("port".into(), 443i64.into());

        let body = build_body(vec![
            Arg::Str("org".into()),
            Arg::StrList(vec!["key-1".into()]),
            Arg::Dict(connect),
        ])
        .unwrap();
        assert_eq!(body.fields().len(), 3);
        assert_eq!(body.signature().to_string(), "(sasa{sv})");
    }

    #[test]
    fn test_build_body_wraps_variant() {
        let body = build_body(vec![
            Arg::Str("server.insecure".into()),
            Arg::Variant(OptionValue::Int(1)),
        ])
        .unwrap();
        assert!(matches!(body.fields()[1], Value::Value(_)));
    }

    #[test]
    fn test_elevation_try_never_fails() {
        let descriptor = ConnectionDescriptor::system(SuperuserPolicy::Try);
        assert!(check_elevation(Some(SuperuserPolicy::Try), &descriptor).is_ok());
        assert!(check_elevation(None, &descriptor).is_ok());
    }

    #[test]
    fn test_elevation_require() {
        let descriptor = ConnectionDescriptor::system(SuperuserPolicy::Require);
        let result = check_elevation(Some(SuperuserPolicy::Require), &descriptor);
        if is_privileged() {
            assert!(result.is_ok());
        } else {
            assert_eq!(result.unwrap_err().kind(), "permission");
        }
    }

    #[tokio::test]
    async fn test_empty_private_address_is_protocol_error() {
        let handle = ZbusProxyFactory::new().create_proxy(
            None,
            &endpoint("Register"),
            &ConnectionDescriptor::private_socket("  ", None),
        );
        let err = handle.wait_ready().await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[tokio::test]
    async fn test_no_bus_scope_is_connection_error() {
        let handle = ZbusProxyFactory::new().create_proxy(
            None,
            &endpoint("Config"),
            &ConnectionDescriptor::WellKnown {
                scope: BusScope::None,
                superuser: None,
            },
        );
        let err = handle.invoke("GetAll", vec!["server".into()]).await.unwrap_err();
        assert_eq!(err.kind(), "connection");
    }

    #[tokio::test]
    async fn test_disposed_handle_fails() {
        let handle = ZbusProxyFactory::new().create_proxy(
            None,
            &endpoint("Register"),
            &ConnectionDescriptor::private_socket("unix:abstract=gone", None),
        );
        handle.dispose(Some("test"));
        // Disposing twice is a no-op.
        handle.dispose(None);
        let err = handle.wait_ready().await.unwrap_err();
        assert_eq!(err.kind(), "connection");
        assert!(err.to_string().contains("disposed"));
    }
}
