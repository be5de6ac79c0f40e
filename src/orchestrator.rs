//! Registration pipeline driven through the `RegisterServer` object.
//!
//! The RHSM1 service registers a system in two hops. The long-lived
//! `RegisterServer` object on the system bus spawns a private D-Bus server
//! and returns its address; the actual `Register` object is only reachable
//! over a peer-to-peer connection to that address.
//!
//! # Pipeline
//!
//! ```text
//!  AwaitingServerReady ──ready──> Starting ──address──> ConnectingPrivate
//!        ──proxy──> AwaitingPrivateReady ──ready──> Registering ──result──> Done
//!
//!  any state ──error──> Failed
//! ```
//!
//! Every run is independent: a fresh private connection, no shared address,
//! no deduplication of concurrent runs. The private connection is disposed
//! when the run completes, fails, or is cancelled.

use crate::bus::{BusScope, ConnectionDescriptor, OptionMap, ProxyFactory, SuperuserPolicy};
use crate::endpoints::RHSM_SERVICE;
use crate::error::BusError;
use crate::service::{ReadyGated, RegisterRole, RegisterServerRole, Timeouts};
use crate::stream::{StreamInfo, StreamRegistry, ValueStream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Component name used when publishing pipeline streams.
pub const COMPONENT: &str = "RegisterServerService";

/// Stream name under which every run is published.
pub const STREAM_NAME: &str = "register-socket";

pub const STREAM_TYPE: &str = "string";

pub const ACTION_MOUNTED: &str = "mounted";

/// Username/password registration request.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RegistrationArgs {
    pub org: String,
    pub user: String,
    pub password: String,
    /// Registration options such as `force`, `name`, `consumerid`, `environment`.
    #[serde(default)]
    pub options: OptionMap,
    /// Server connection options such as `host`, `port`, `handler`, `insecure`.
    #[serde(default)]
    pub connect_options: OptionMap,
}

impl fmt::Debug for RegistrationArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationArgs")
            .field("org", &self.org)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("options", &self.options)
            .field("connect_options", &self.connect_options)
            .finish()
    }
}

/// Activation-key registration request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivationKeyArgs {
    pub org: String,
    pub activation_keys: Vec<String>,
    #[serde(default)]
    pub options: OptionMap,
    #[serde(default)]
    pub connect_options: OptionMap,
}

enum Credentials {
    Password(RegistrationArgs),
    ActivationKeys(ActivationKeyArgs),
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    AwaitingServerReady,
    Starting,
    ConnectingPrivate,
    AwaitingPrivateReady,
    Registering,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineState::AwaitingServerReady => "waiting for RegisterServer",
            PipelineState::Starting => "starting private registration server",
            PipelineState::ConnectingPrivate => "connecting to private socket",
            PipelineState::AwaitingPrivateReady => "waiting for Register object",
            PipelineState::Registering => "registering",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Settings for reaching the RegisterServer object.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Well-known bus name of the service.
    pub service: String,
    pub scope: BusScope,
    pub superuser: SuperuserPolicy,
    /// Locale passed to `RegisterServer.Start`.
    pub locale: String,
    pub timeouts: Timeouts,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            service: RHSM_SERVICE.to_string(),
            scope: BusScope::System,
            superuser: SuperuserPolicy::Require,
            locale: "en_US".to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Drives registrations through `RegisterServer`.
pub struct RegisterServerService {
    server: Arc<ReadyGated<RegisterServerRole>>,
    factory: Arc<dyn ProxyFactory>,
    registry: Arc<dyn StreamRegistry>,
    options: ServiceOptions,
    runs: AtomicU64,
}

impl RegisterServerService {
    /// Open the RegisterServer proxy on the configured bus.
    pub fn open(
        factory: Arc<dyn ProxyFactory>,
        registry: Arc<dyn StreamRegistry>,
        options: ServiceOptions,
    ) -> Self {
        let connection = ConnectionDescriptor::WellKnown {
            scope: options.scope,
            superuser: Some(options.superuser),
        };
        let server = ReadyGated::open(
            factory.as_ref(),
            Some(options.service.as_str()),
            &connection,
            options.timeouts,
        );
        Self::new(server, factory, registry, options)
    }

    /// Wrap an already opened RegisterServer proxy.
    pub fn new(
        server: ReadyGated<RegisterServerRole>,
        factory: Arc<dyn ProxyFactory>,
        registry: Arc<dyn StreamRegistry>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            server: Arc::new(server),
            factory,
            registry,
            options,
            runs: AtomicU64::new(0),
        }
    }

    /// Register with username and password.
    ///
    /// The returned stream yields the consumer identity, or the first error.
    /// The same stream is published to the registry under
    /// [`STREAM_NAME`]. Must be called inside a tokio runtime.
    pub fn start(&self, args: RegistrationArgs) -> ValueStream<String> {
        self.launch(Credentials::Password(args))
    }

    /// Register with activation keys. Same pipeline and publication as [`start`](Self::start).
    pub fn start_with_activation_keys(&self, args: ActivationKeyArgs) -> ValueStream<String> {
        self.launch(Credentials::ActivationKeys(args))
    }

    /// Ask RegisterServer to shut down its private servers.
    pub async fn stop(&self) -> Result<String, BusError> {
        self.server.ready().wait().await?;
        info!("Calling RegisterServer.Stop");
        self.server.stop().await
    }

    fn launch(&self, credentials: Credentials) -> ValueStream<String> {
        let run = Run {
            id: self.runs.fetch_add(1, Ordering::SeqCst) + 1,
            server: self.server.clone(),
            factory: self.factory.clone(),
            locale: self.options.locale.clone(),
            private_superuser: Some(self.options.superuser),
            timeouts: self.options.timeouts,
        };

        let stream = ValueStream::spawn(run.execute(credentials));

        self.registry.register(StreamInfo {
            component: COMPONENT.to_string(),
            stream_name: STREAM_NAME.to_string(),
            stream_type: STREAM_TYPE.to_string(),
            action: ACTION_MOUNTED.to_string(),
            stream: stream.clone(),
        });

        stream
    }
}

/// One pipeline run.
struct Run {
    id: u64,
    server: Arc<ReadyGated<RegisterServerRole>>,
    factory: Arc<dyn ProxyFactory>,
    locale: String,
    private_superuser: Option<SuperuserPolicy>,
    timeouts: Timeouts,
}

impl Run {
    fn enter(&self, state: PipelineState) {
        info!("Registration #{}: {}", self.id, state);
    }

    async fn execute(self, credentials: Credentials) -> Result<String, BusError> {
        match self.drive(credentials).await {
            Ok(consumer) => {
                self.enter(PipelineState::Done);
                Ok(consumer)
            }
            Err(e) => {
                warn!("Registration #{} {}: {}", self.id, PipelineState::Failed, e);
                Err(e)
            }
        }
    }

    async fn drive(&self, credentials: Credentials) -> Result<String, BusError> {
        self.enter(PipelineState::AwaitingServerReady);
        self.server.ready().wait().await?;

        self.enter(PipelineState::Starting);
        let address = self.server.start(&self.locale).await?;
        debug!("Registration #{}: private socket is {}", self.id, address);
        if address.trim().is_empty() {
            return Err(BusError::Protocol(
                "RegisterServer.Start returned an empty socket address".to_string(),
            ));
        }

        self.enter(PipelineState::ConnectingPrivate);
        let private = ReadyGated::<RegisterRole>::open(
            self.factory.as_ref(),
            None,
            &ConnectionDescriptor::private_socket(address, self.private_superuser),
            self.timeouts,
        );
        let lease = PrivateLease::new(self.id, private);

        let outcome = self.register(&lease, credentials).await;
        lease.release(if outcome.is_ok() { "completed" } else { "failed" });
        outcome
    }

    async fn register(
        &self,
        lease: &PrivateLease,
        credentials: Credentials,
    ) -> Result<String, BusError> {
        self.enter(PipelineState::AwaitingPrivateReady);
        lease.object.ready().wait().await?;

        self.enter(PipelineState::Registering);
        let consumer = match credentials {
            Credentials::Password(args) => lease.object.register(&args).await?,
            Credentials::ActivationKeys(args) => {
                lease.object.register_with_activation_keys(&args).await?
            }
        };
        debug!("Registration #{}: consumer is {}", self.id, consumer);
        Ok(consumer)
    }
}

/// Scopes the private connection to one run.
///
/// Dropped without [`release`](Self::release) means the run was cancelled.
struct PrivateLease {
    run: u64,
    object: ReadyGated<RegisterRole>,
    reason: &'static str,
}

impl PrivateLease {
    fn new(run: u64, object: ReadyGated<RegisterRole>) -> Self {
        Self {
            run,
            object,
            reason: "cancelled",
        }
    }

    fn release(mut self, reason: &'static str) {
        self.reason = reason;
    }
}

impl Drop for PrivateLease {
    fn drop(&mut self) {
        debug!(
            "Registration #{}: releasing private connection ({})",
            self.run, self.reason
        );
        self.object.dispose(Some(self.reason));
    }
}
