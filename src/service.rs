//! Ready-gated wrappers around remote-object handles.
//!
//! A [`ReadyGated`] owns one handle and exposes a [`Ready`] signal that asks
//! the handle to become usable exactly once and replays the outcome to every
//! waiter. The role parameter decides which typed operations are available:
//!
//! - [`RegisterServerRole`]: `Start(locale)`, `Stop()`
//! - [`RegisterRole`]: `Register(...)`, `RegisterWithActivationKeys(...)`
//! - [`ConfigRole`]: `Get`, `GetAll`, `Set`
//!
//! Typed operations do not wait for readiness themselves; callers sequence
//! `ready().wait()` before the first call.

use crate::bus::{Arg, ConnectionDescriptor, OptionValue, ProxyFactory, RemoteObject, Reply};
use crate::endpoints::endpoint;
use crate::error::BusError;
use crate::orchestrator::{ActivationKeyArgs, RegistrationArgs};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

/// Per-step time bounds. `None` waits indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub ready: Option<Duration>,
    pub call: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: Some(Duration::from_secs(30)),
            call: Some(Duration::from_secs(90)),
        }
    }
}

impl Timeouts {
    pub fn unbounded() -> Self {
        Self {
            ready: None,
            call: None,
        }
    }
}

pub(crate) async fn bounded<T, F>(limit: Option<Duration>, what: String, fut: F) -> Result<T, BusError>
where
    F: Future<Output = Result<T, BusError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| BusError::Timeout(limit, what))?,
        None => fut.await,
    }
}

/// Single-fire readiness signal.
///
/// The underlying wait starts as soon as the signal is created (when a
/// runtime is available) and its outcome is cached: every clone and every
/// `wait()` sees the same success or the same error.
#[derive(Clone)]
pub struct Ready {
    outcome: Shared<BoxFuture<'static, Result<(), BusError>>>,
    driver: Option<AbortHandle>,
}

impl Ready {
    pub fn new(handle: Arc<dyn RemoteObject>, limit: Option<Duration>) -> Self {
        let what = format!("waiting for {}", handle.describe());
        let outcome = async move { bounded(limit, what, handle.wait_ready()).await }
            .boxed()
            .shared();

        let driver = tokio::runtime::Handle::try_current()
            .ok()
            .map(|runtime| runtime.spawn(outcome.clone()).abort_handle());

        Self { outcome, driver }
    }

    /// Stop driving the wait in the background.
    ///
    /// The background task holds the handle; once it is aborted the handle
    /// lives only as long as the `Ready` clones do.
    pub fn abort(&self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }

    /// Wait for the cached outcome.
    pub async fn wait(&self) -> Result<(), BusError> {
        self.outcome.clone().await
    }

    /// The outcome, once the background task or a waiter has observed it.
    pub fn peek(&self) -> Option<Result<(), BusError>> {
        self.outcome.peek().cloned()
    }
}

/// Marker for the set of operations a wrapped object offers.
pub trait Role: Send + Sync + 'static {
    /// Logical endpoint name, resolved through [`crate::endpoints`].
    const NAME: &'static str;
}

/// The long-lived `RegisterServer` object on the system bus.
pub struct RegisterServerRole;

impl Role for RegisterServerRole {
    const NAME: &'static str = "RegisterServer";
}

/// The short-lived `Register` object behind a private socket.
pub struct RegisterRole;

impl Role for RegisterRole {
    const NAME: &'static str = "Register";
}

/// The `Config` object.
pub struct ConfigRole;

impl Role for ConfigRole {
    const NAME: &'static str = "Config";
}

/// A remote handle gated by its readiness signal.
///
/// Dropping the wrapper disposes the handle.
pub struct ReadyGated<R: Role> {
    handle: Arc<dyn RemoteObject>,
    ready: Ready,
    call_timeout: Option<Duration>,
    _role: PhantomData<R>,
}

impl<R: Role> ReadyGated<R> {
    pub fn new(handle: Arc<dyn RemoteObject>, timeouts: Timeouts) -> Self {
        let ready = Ready::new(handle.clone(), timeouts.ready);
        Self {
            handle,
            ready,
            call_timeout: timeouts.call,
            _role: PhantomData,
        }
    }

    /// Create the handle through `factory` for this role's endpoint.
    pub fn open(
        factory: &dyn ProxyFactory,
        target: Option<&str>,
        connection: &ConnectionDescriptor,
        timeouts: Timeouts,
    ) -> Self {
        let handle = factory.create_proxy(target, &endpoint(R::NAME), connection);
        debug!("Opened {} proxy on {}", R::NAME, connection);
        Self::new(handle, timeouts)
    }

    pub fn ready(&self) -> &Ready {
        &self.ready
    }

    pub fn describe(&self) -> String {
        self.handle.describe()
    }

    pub fn dispose(&self, reason: Option<&str>) {
        self.ready.abort();
        self.handle.dispose(reason);
    }

    async fn call(&self, method: &str, args: Vec<Arg>) -> Result<Reply, BusError> {
        let what = format!("calling {}.{}", R::NAME, method);
        bounded(self.call_timeout, what, self.handle.invoke(method, args)).await
    }
}

impl<R: Role> Drop for ReadyGated<R> {
    fn drop(&mut self) {
        self.dispose(Some("released"));
    }
}

impl ReadyGated<RegisterServerRole> {
    /// Spawn a registration object; returns its private socket address.
    pub async fn start(&self, locale: &str) -> Result<String, BusError> {
        self.call("Start", vec![locale.into()]).await?.into_string()
    }

    pub async fn stop(&self) -> Result<String, BusError> {
        self.call("Stop", Vec::new()).await?.into_string()
    }
}

impl ReadyGated<RegisterRole> {
    /// Register with username and password; returns the consumer identity.
    pub async fn register(&self, args: &RegistrationArgs) -> Result<String, BusError> {
        let call_args = vec![
            Arg::Str(args.org.clone()),
            Arg::Str(args.user.clone()),
            Arg::Str(args.password.clone()),
            Arg::Dict(args.options.clone()),
            Arg::Dict(args.connect_options.clone()),
        ];
        self.call("Register", call_args).await?.into_string()
    }

    pub async fn register_with_activation_keys(
        &self,
        args: &ActivationKeyArgs,
    ) -> Result<String, BusError> {
        let call_args = vec![
            Arg::Str(args.org.clone()),
            Arg::StrList(args.activation_keys.clone()),
            Arg::Dict(args.options.clone()),
            Arg::Dict(args.connect_options.clone()),
        ];
        self.call("RegisterWithActivationKeys", call_args)
            .await?
            .into_string()
    }
}

pub type ConfigService = ReadyGated<ConfigRole>;

/// A configuration value as reported by `Config.Get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValue {
    /// D-Bus type signature of the value.
    pub type_name: String,
    pub value: String,
}

impl ReadyGated<ConfigRole> {
    pub async fn get(&self, section: &str, name: &str) -> Result<ConfigValue, BusError> {
        match self.call("Get", vec![section.into(), name.into()]).await? {
            Reply::Variant { signature, value } => Ok(ConfigValue {
                type_name: signature,
                value,
            }),
            Reply::Str(value) => Ok(ConfigValue {
                type_name: "s".to_string(),
                value,
            }),
            other => Err(BusError::Protocol(format!(
                "Config.Get returned {:?}",
                other
            ))),
        }
    }

    pub async fn get_all(&self, section: &str) -> Result<Vec<String>, BusError> {
        self.call("GetAll", vec![section.into()])
            .await?
            .into_string_list()
    }

    pub async fn set(&self, name: &str, value: OptionValue) -> Result<(), BusError> {
        self.call("Set", vec![name.into(), Arg::Variant(value)])
            .await?
            .into_unit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{FakeFactory, FakeObject, Journal};
    use crate::bus::SuperuserPolicy;

    fn config_service(object: FakeObject) -> ReadyGated<ConfigRole> {
        ReadyGated::new(Arc::new(object), Timeouts::unbounded())
    }

    #[tokio::test]
    async fn test_ready_resolves_once_for_many_waiters() {
        let journal = Journal::default();
        let object = Arc::new(FakeObject::new("Config", journal.clone()));
        let svc: ReadyGated<ConfigRole> = ReadyGated::new(object.clone(), Timeouts::unbounded());

        let (a, b) = tokio::join!(svc.ready().wait(), svc.ready().wait());
        assert!(a.is_ok());
        assert!(b.is_ok());
        // Late subscriber sees the cached outcome.
        assert!(svc.ready().wait().await.is_ok());
        assert_eq!(svc.ready().peek(), Some(Ok(())));
        assert_eq!(object.ready_calls(), 1);
    }

    #[tokio::test]
    async fn test_ready_failure_is_shared() {
        let journal = Journal::default();
        let object = Arc::new(
            FakeObject::new("Config", journal)
                .ready_with(Err(BusError::Connection("bus unreachable".into()))),
        );
        let svc: ReadyGated<ConfigRole> = ReadyGated::new(object.clone(), Timeouts::unbounded());

        let first = svc.ready().wait().await.unwrap_err();
        let second = svc.ready().wait().await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(first.kind(), "connection");
        assert_eq!(object.ready_calls(), 1);
    }

    #[tokio::test]
    async fn test_ready_timeout() {
        let object = FakeObject::new("RegisterServer", Journal::default()).ready_never();
        let timeouts = Timeouts {
            ready: Some(Duration::from_millis(20)),
            call: None,
        };
        let svc: ReadyGated<RegisterServerRole> = ReadyGated::new(Arc::new(object), timeouts);

        let err = svc.ready().wait().await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("RegisterServer"));
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let object = FakeObject::new("RegisterServer", Journal::default()).pending("Start");
        let timeouts = Timeouts {
            ready: None,
            call: Some(Duration::from_millis(20)),
        };
        let svc: ReadyGated<RegisterServerRole> = ReadyGated::new(Arc::new(object), timeouts);

        let err = svc.start("en_US").await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("RegisterServer.Start"));
    }

    #[tokio::test]
    async fn test_register_server_start_passes_locale() {
        let journal = Journal::default();
        let object = FakeObject::new("RegisterServer", journal.clone())
            .respond("Start", Ok(Reply::Str("unix:abstract=abc".into())));
        let svc: ReadyGated<RegisterServerRole> =
            ReadyGated::new(Arc::new(object), Timeouts::unbounded());

        assert_eq!(svc.start("de_DE").await.unwrap(), "unix:abstract=abc");
        assert!(journal.contains("call RegisterServer.Start [Str(\"de_DE\")]"));
    }

    #[tokio::test]
    async fn test_start_with_wrong_reply_shape() {
        let object = FakeObject::new("RegisterServer", Journal::default())
            .respond("Start", Ok(Reply::Unit));
        let svc: ReadyGated<RegisterServerRole> =
            ReadyGated::new(Arc::new(object), Timeouts::unbounded());

        assert_eq!(svc.start("en_US").await.unwrap_err().kind(), "protocol");
    }

    #[tokio::test]
    async fn test_config_operations() {
        let journal = Journal::default();
        let object = FakeObject::new("Config", journal.clone())
            .respond(
                "Get",
                Ok(Reply::Variant {
                    signature: "s".into(),
                    value: "subscription.rhsm.redhat.com".into(),
                }),
            )
            .respond(
                "GetAll",
                Ok(Reply::StrList(vec!["hostname".into(), "port".into()])),
            )
            .respond("Set", Ok(Reply::Unit));
        let svc = config_service(object);

        svc.ready().wait().await.unwrap();
        let value = svc.get("server", "hostname").await.unwrap();
        assert_eq!(value.type_name, "s");
        assert_eq!(value.value, "subscription.rhsm.redhat.com");

        let names = svc.get_all("server").await.unwrap();
        assert_eq!(names, vec!["hostname", "port"]);

        svc.set("server.port", OptionValue::Int(8443)).await.unwrap();
        assert!(journal.contains("call Config.Set"));
    }

    #[tokio::test]
    async fn test_open_resolves_role_endpoint() {
        let journal = Journal::default();
        let factory = FakeFactory::new(journal.clone());
        let _svc: ReadyGated<RegisterServerRole> = ReadyGated::open(
            &factory,
            Some("com.redhat.RHSM1"),
            &ConnectionDescriptor::system(SuperuserPolicy::Require),
            Timeouts::unbounded(),
        );
        assert!(journal.contains("create /com/redhat/RHSM1/RegisterServer target=com.redhat.RHSM1"));
    }

    #[tokio::test]
    async fn test_drop_disposes_handle() {
        let journal = Journal::default();
        let object = Arc::new(FakeObject::new("Config", journal.clone()));
        {
            let _svc: ReadyGated<ConfigRole> =
                ReadyGated::new(object.clone(), Timeouts::unbounded());
        }
        assert!(journal.contains("dispose Config released"));
        assert!(object.is_disposed());
    }

    #[tokio::test]
    async fn test_drop_stops_background_ready_wait() {
        let object = Arc::new(FakeObject::new("Register", Journal::default()).ready_never());
        let svc: ReadyGated<RegisterRole> = ReadyGated::new(object.clone(), Timeouts::unbounded());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(object.ready_calls(), 1);

        drop(svc);
        for _ in 0..100 {
            if Arc::strong_count(&object) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(Arc::strong_count(&object), 1);
        assert!(object.is_disposed());
    }
}
