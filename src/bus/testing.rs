//! In-memory transport for unit tests.
//!
//! Every handle operation is appended to a shared [`Journal`] so tests can
//! assert on call order across several handles.

use super::{Arg, ConnectionDescriptor, ProxyFactory, RemoteObject, Reply};
use crate::endpoints::Endpoint;
use crate::error::BusError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Ordered record of transport events.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }

    /// Index of the first entry equal to `entry`.
    pub fn position_exact(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.position(prefix).is_some()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct FakeObject {
    name: String,
    journal: Journal,
    ready: Option<Result<(), BusError>>,
    responses: Mutex<HashMap<String, VecDeque<Result<Reply, BusError>>>>,
    pending: HashSet<String>,
    ready_calls: AtomicUsize,
    disposed: AtomicBool,
}

impl FakeObject {
    pub fn new(name: &str, journal: Journal) -> Self {
        Self {
            name: name.to_string(),
            journal,
            ready: Some(Ok(())),
            responses: Mutex::new(HashMap::new()),
            pending: HashSet::new(),
            ready_calls: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn ready_with(mut self, outcome: Result<(), BusError>) -> Self {
        self.ready = Some(outcome);
        self
    }

    /// Never become ready.
    pub fn ready_never(mut self) -> Self {
        self.ready = None;
        self
    }

    /// Queue a reply for `method`. Replies are handed out in order; the
    /// last one repeats.
    pub fn respond(self, method: &str, reply: Result<Reply, BusError>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Calls to `method` never return.
    pub fn pending(mut self, method: &str) -> Self {
        self.pending.insert(method.to_string());
        self
    }

    pub fn ready_calls(&self) -> usize {
        self.ready_calls.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteObject for FakeObject {
    fn describe(&self) -> String {
        format!("fake {}", self.name)
    }

    async fn wait_ready(&self) -> Result<(), BusError> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        match &self.ready {
            Some(outcome) => {
                self.journal.record(format!("ready {}", self.name));
                outcome.clone()
            }
            None => std::future::pending().await,
        }
    }

    async fn invoke(&self, method: &str, args: Vec<Arg>) -> Result<Reply, BusError> {
        self.journal
            .record(format!("call {}.{} {:?}", self.name, method, args));
        tokio::task::yield_now().await;
        if self.pending.contains(method) {
            return std::future::pending().await;
        }
        let mut responses = self.responses.lock().unwrap();
        let reply = match responses.get_mut(method) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        reply.unwrap_or_else(|| {
            Err(BusError::RemoteCall(format!(
                "no response configured for {}.{}",
                self.name, method
            )))
        })
    }

    fn dispose(&self, reason: Option<&str>) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.journal.record(format!(
                "dispose {} {}",
                self.name,
                reason.unwrap_or("-")
            ));
        }
    }
}

/// Hands out preconfigured [`FakeObject`]s.
///
/// Objects are keyed by private socket address, or by logical endpoint
/// name for well-known connections. Unknown keys get a default object that
/// is ready but answers every call with an error.
pub struct FakeFactory {
    journal: Journal,
    objects: Mutex<HashMap<String, Arc<FakeObject>>>,
}

impl FakeFactory {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: &str, object: FakeObject) -> Arc<FakeObject> {
        let object = Arc::new(object);
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), object.clone());
        object
    }

    pub fn private_connections(&self) -> usize {
        self.journal.count("create /com/redhat/RHSM1/Register target=- on private")
    }
}

impl ProxyFactory for FakeFactory {
    fn create_proxy(
        &self,
        target: Option<&str>,
        endpoint: &Endpoint,
        connection: &ConnectionDescriptor,
    ) -> Arc<dyn RemoteObject> {
        self.journal.record(format!(
            "create {} target={} on {}",
            endpoint.object_path,
            target.unwrap_or("-"),
            connection
        ));
        let key = match connection {
            ConnectionDescriptor::PrivateSocket { address, .. } => address.clone(),
            ConnectionDescriptor::WellKnown { .. } => endpoint.logical_name.clone(),
        };
        let configured = self.objects.lock().unwrap().get(&key).cloned();
        match configured {
            Some(object) => object,
            None => Arc::new(FakeObject::new(&endpoint.logical_name, self.journal.clone())),
        }
    }
}
