//! Access control for node and link creation requested by clients.
//!
//! Trusted clients may do anything. Sandboxed clients are limited to the
//! factories the policy lets them ask for, and every such request goes
//! through an asynchronous permission portal. While a request is pending
//! the client is busy; the reply comes back to the data loop as a
//! [`PermissionReply`] and is matched by handle.

use async_trait::async_trait;
use mediacore::{ClientId, GraphError, NodeId, Properties};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Identity of a connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub pid: Option<u32>,
    pub uid: u32,
    pub sandboxed: bool,
}

impl ClientInfo {
    pub fn trusted(uid: u32) -> Self {
        Self {
            id: ClientId::new_v4(),
            pid: None,
            uid,
            sandboxed: false,
        }
    }

    pub fn sandboxed(pid: u32, uid: u32) -> Self {
        Self {
            id: ClientId::new_v4(),
            pid: Some(pid),
            uid,
            sandboxed: true,
        }
    }

    /// Build from credentials, looking at the cgroup of `pid` to decide
    /// whether the client runs inside a flatpak sandbox. Without a trusted
    /// pid the client is assumed not to be sandboxed.
    pub fn from_credentials(pid: Option<u32>, uid: u32) -> Self {
        let sandboxed = match pid {
            Some(pid) => match std::fs::read_to_string(format!("/proc/{}/cgroup", pid)) {
                Ok(contents) => cgroup_is_sandboxed(&contents),
                Err(e) => {
                    tracing::debug!("Cannot read cgroup of pid {}: {}", pid, e);
                    false
                }
            },
            None => {
                tracing::info!("No trusted pid, assuming not sandboxed");
                false
            }
        };
        Self {
            id: ClientId::new_v4(),
            pid,
            uid,
            sandboxed,
        }
    }
}

/// Whether a `/proc/<pid>/cgroup` listing puts the process in a flatpak scope
pub fn cgroup_is_sandboxed(contents: &str) -> bool {
    contents.lines().any(|line| {
        line.strip_prefix("1:name=systemd:")
            .map(|path| path.contains("flatpak-"))
            .unwrap_or(false)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum Operation {
    CreateNode { factory: String },
    CreateLink { output: NodeId, input: NodeId },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateNode { factory } => write!(f, "create-node {}", factory),
            Operation::CreateLink { output, input } => write!(f, "create-link {} -> {}", output, input),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
    /// Defer to the permission portal
    AskPortal,
}

pub trait AccessPolicy: Send + Sync {
    fn check(&self, operation: &Operation, client: &ClientInfo) -> Decision;
}

/// Allows everything
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _operation: &Operation, _client: &ClientInfo) -> Decision {
        Decision::Allowed
    }
}

/// Default policy for sandboxed clients
pub struct SandboxPolicy {
    portal_factories: Vec<String>,
}

impl SandboxPolicy {
    pub fn new(portal_factories: Vec<String>) -> Self {
        Self { portal_factories }
    }
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::new(vec!["client-node".to_string()])
    }
}

impl AccessPolicy for SandboxPolicy {
    fn check(&self, operation: &Operation, client: &ClientInfo) -> Decision {
        if !client.sandboxed {
            return Decision::Allowed;
        }
        match operation {
            Operation::CreateNode { factory } if self.portal_factories.contains(factory) => Decision::AskPortal,
            Operation::CreateNode { factory } => {
                tracing::error!("Sandboxed client {} may not use factory {}", client.id, factory);
                Decision::Denied
            }
            Operation::CreateLink { .. } => Decision::Denied,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortalResponse {
    Granted,
    Cancelled,
    Denied,
}

impl PortalResponse {
    /// Map a portal response code: 0 granted, 1 cancelled by the user,
    /// anything else denied.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => PortalResponse::Granted,
            1 => PortalResponse::Cancelled,
            _ => PortalResponse::Denied,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortalRequest {
    pub handle: String,
    pub client: ClientId,
    pub pid: Option<u32>,
    pub devices: Vec<String>,
}

/// Asynchronous permission service, called off the data thread
#[async_trait]
pub trait PermissionPortal: Send + Sync {
    async fn access_device(&self, request: PortalRequest) -> PortalResponse;
}

/// Portal used when none is configured
pub struct DenyingPortal;

#[async_trait]
impl PermissionPortal for DenyingPortal {
    async fn access_device(&self, _request: PortalRequest) -> PortalResponse {
        PortalResponse::Denied
    }
}

/// Reply delivered back into the data loop
#[derive(Debug, Clone)]
pub struct PermissionReply {
    pub handle: String,
    pub response: PortalResponse,
}

/// Creation waiting on a portal reply
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub seq: u32,
    pub handle: String,
    pub client: ClientId,
    pub factory: String,
    pub props: Properties,
    pub cancel: CancellationToken,
}

pub struct AccessControl {
    policy: Box<dyn AccessPolicy>,
    clients: HashMap<ClientId, ClientInfo>,
    pending: HashMap<String, PendingRequest>,
    next_seq: u32,
}

impl AccessControl {
    pub fn new(policy: Box<dyn AccessPolicy>) -> Self {
        Self {
            policy,
            clients: HashMap::new(),
            pending: HashMap::new(),
            next_seq: 1,
        }
    }

    pub fn add_client(&mut self, info: ClientInfo) -> ClientId {
        let id = info.id;
        tracing::debug!("Client {} connected (uid {}, sandboxed: {})", id, info.uid, info.sandboxed);
        self.clients.insert(id, info);
        id
    }

    /// Forget a client and cancel its pending requests
    pub fn remove_client(&mut self, id: ClientId) -> Vec<PendingRequest> {
        self.clients.remove(&id);
        let handles: Vec<String> = self
            .pending
            .values()
            .filter(|p| p.client == id)
            .map(|p| p.handle.clone())
            .collect();
        handles
            .into_iter()
            .filter_map(|h| self.pending.remove(&h))
            .inspect(|p| {
                tracing::debug!("Cancelling request {} of client {}", p.handle, id);
                p.cancel.cancel();
            })
            .collect()
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientInfo> {
        self.clients.get(&id)
    }

    pub fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Ask the policy about an operation on behalf of a known client.
    pub fn check(&self, client: ClientId, operation: &Operation) -> Result<Decision, GraphError> {
        let info = self.clients.get(&client).ok_or(GraphError::NoPermission)?;
        let decision = self.policy.check(operation, info);
        tracing::debug!("{} by {}: {:?}", operation, client, decision);
        Ok(decision)
    }

    /// A client is busy while one of its requests waits on the portal
    pub fn is_busy(&self, client: ClientId) -> bool {
        self.pending.values().any(|p| p.client == client)
    }

    pub fn n_pending(&self) -> usize {
        self.pending.len()
    }

    /// Register a deferred creation and return it for the portal call.
    pub fn begin(&mut self, client: ClientId, factory: &str, props: Properties) -> PendingRequest {
        let seq = self.next_seq();
        let request = PendingRequest {
            seq,
            handle: format!("/org/freedesktop/portal/desktop/request/{}", uuid::Uuid::new_v4().simple()),
            client,
            factory: factory.to_string(),
            props,
            cancel: CancellationToken::new(),
        };
        self.pending.insert(request.handle.clone(), request.clone());
        request
    }

    /// Take the request a portal reply belongs to.
    ///
    /// Unknown handles and cancelled requests yield `None`.
    pub fn complete(&mut self, handle: &str) -> Option<PendingRequest> {
        let request = self.pending.remove(handle)?;
        if request.cancel.is_cancelled() {
            return None;
        }
        Some(request)
    }

    /// Objects without an owner are visible to everyone, others only to
    /// clients with the same uid. Unknown clients see nothing.
    pub fn is_visible(&self, client: ClientId, owner: Option<u32>) -> bool {
        match (self.clients.get(&client), owner) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(info), Some(uid)) => info.uid == uid,
        }
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::new(Box::new(SandboxPolicy::default()))
    }
}
