//! Endpoint table for the `com.redhat.RHSM1` service.
//!
//! Maps logical service roles to their D-Bus interface name and object path.
//! Names missing from the table still resolve through the namespace rule, so
//! new server-side roles need no table update.

use std::fmt;
use std::sync::OnceLock;

/// Well-known bus name of the subscription-manager service.
pub const RHSM_SERVICE: &str = "com.redhat.RHSM1";

/// Namespace segments shared by interface names and object paths.
const RHSM_PATH_SEGMENTS: [&str; 3] = ["com", "redhat", "RHSM1"];

/// Logical roles exposed by the RHSM1 service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    Attach,
    Config,
    Entitlement,
    Products,
    Register,
    RegisterServer,
    Unregister,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 7] = [
        ServiceRole::Attach,
        ServiceRole::Config,
        ServiceRole::Entitlement,
        ServiceRole::Products,
        ServiceRole::Register,
        ServiceRole::RegisterServer,
        ServiceRole::Unregister,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ServiceRole::Attach => "Attach",
            ServiceRole::Config => "Config",
            ServiceRole::Entitlement => "Entitlement",
            ServiceRole::Products => "Products",
            ServiceRole::Register => "Register",
            ServiceRole::RegisterServer => "RegisterServer",
            ServiceRole::Unregister => "Unregister",
        }
    }

    /// Interface name for this role.
    pub fn interface(&self) -> String {
        resolve_interface(self.name())
    }

    /// Object path for this role.
    pub fn object_path(&self) -> String {
        resolve_object_path(self.name())
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved endpoint: logical name plus its interface and object path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub logical_name: String,
    pub interface: String,
    pub object_path: String,
}

impl Endpoint {
    fn derive(name: &str) -> Self {
        Self {
            logical_name: name.to_string(),
            interface: format!("{}.{}", RHSM_SERVICE, name),
            object_path: format!("/{}/{}", RHSM_PATH_SEGMENTS.join("/"), name),
        }
    }
}

/// All known endpoints, built once on first use.
pub fn known_endpoints() -> &'static [Endpoint] {
    static TABLE: OnceLock<Vec<Endpoint>> = OnceLock::new();
    TABLE.get_or_init(|| {
        ServiceRole::ALL
            .iter()
            .map(|role| Endpoint::derive(role.name()))
            .collect()
    })
}

fn lookup(name: &str) -> Option<&'static Endpoint> {
    known_endpoints().iter().find(|e| e.logical_name == name)
}

/// Resolve an endpoint by logical name, falling back to the namespace rule.
pub fn endpoint(name: &str) -> Endpoint {
    lookup(name)
        .cloned()
        .unwrap_or_else(|| Endpoint::derive(name))
}

/// Interface name for a logical service name, e.g. `Config` -> `com.redhat.RHSM1.Config`.
pub fn resolve_interface(name: &str) -> String {
    match lookup(name) {
        Some(e) => e.interface.clone(),
        None => format!("{}.{}", RHSM_SERVICE, name),
    }
}

/// Object path for a logical service name, e.g. `Config` -> `/com/redhat/RHSM1/Config`.
pub fn resolve_object_path(name: &str) -> String {
    match lookup(name) {
        Some(e) => e.object_path.clone(),
        None => format!("/{}/{}", RHSM_PATH_SEGMENTS.join("/"), name),
    }
}
