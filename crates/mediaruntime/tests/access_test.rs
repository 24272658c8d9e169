mod common;

use async_trait::async_trait;
use common::{binary, TestNode};
use mediacore::{GraphError, GraphEvent, Node, NodeError, ObjectRef, Properties};
use mediaruntime::{
    access::cgroup_is_sandboxed, ClientInfo, MediaRuntime, NodeFactory, NodeRegistry, NodeSetup,
    PermissionPortal, PortalRequest, PortalResponse, RequestOutcome, RuntimeConfig,
};
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;

struct ProbeFactory(&'static str);

impl NodeFactory for ProbeFactory {
    fn create(&self, _setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(TestNode::source()))
    }

    fn factory_name(&self) -> &str {
        self.0
    }
}

struct BrokenFactory;

impl NodeFactory for BrokenFactory {
    fn create(&self, _setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        Err(NodeError::Failed("no endpoint available".into()))
    }

    fn factory_name(&self) -> &str {
        "client-node"
    }
}

/// Answers every request with the same response, or never
struct ScriptedPortal(Option<PortalResponse>);

#[async_trait]
impl PermissionPortal for ScriptedPortal {
    async fn access_device(&self, request: PortalRequest) -> PortalResponse {
        assert_eq!(request.devices, vec!["camera".to_string()]);
        match self.0 {
            Some(response) => response,
            None => std::future::pending().await,
        }
    }
}

fn create_runtime(portal: Option<PortalResponse>) -> MediaRuntime {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(ProbeFactory("client-node")));
    registry.register(Arc::new(ProbeFactory("test.probe")));
    let mut runtime = MediaRuntime::with_registry(Arc::new(registry), RuntimeConfig::default());
    runtime.set_portal(Arc::new(ScriptedPortal(portal)));
    runtime
}

fn next_request_event(events: &mut Receiver<GraphEvent>) -> Option<GraphEvent> {
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            GraphEvent::RequestCompleted { .. }
                | GraphEvent::PermissionDenied { .. }
                | GraphEvent::RequestFailed { .. }
        ) {
            return Some(event);
        }
    }
    None
}

#[tokio::test]
async fn test_trusted_client_creates_directly() {
    let mut runtime = create_runtime(None);
    let mut events = runtime.subscribe_events();
    let client = runtime.add_client(ClientInfo::trusted(1000));

    let outcome = runtime
        .client_create_node(client, "test.probe", Properties::new())
        .unwrap();

    let RequestOutcome::Completed(ObjectRef::Node(node)) = outcome else {
        panic!("Expected immediate creation, got {:?}", outcome);
    };
    assert_eq!(runtime.graph().owner(node), Some(1000));
    assert!(matches!(
        next_request_event(&mut events),
        Some(GraphEvent::RequestCompleted { object: ObjectRef::Node(n), .. }) if n == node
    ));
}

#[tokio::test]
async fn test_portal_grant_creates_node_later() {
    let mut runtime = create_runtime(Some(PortalResponse::Granted));
    let mut events = runtime.subscribe_events();
    let client = runtime.add_client(ClientInfo::sandboxed(4242, 1000));

    let outcome = runtime
        .client_create_node(client, "client-node", Properties::new())
        .unwrap();
    let RequestOutcome::Pending { seq } = outcome else {
        panic!("Sandboxed request should wait for the portal");
    };
    assert_eq!(runtime.graph().n_nodes(), 0);
    assert!(runtime.access().is_busy(client));

    runtime.turn().await;

    assert_eq!(runtime.graph().n_nodes(), 1);
    assert!(!runtime.access().is_busy(client));
    match next_request_event(&mut events) {
        Some(GraphEvent::RequestCompleted {
            client: c,
            seq: s,
            object: ObjectRef::Node(node),
            ..
        }) => {
            assert_eq!((c, s), (client, seq));
            assert_eq!(runtime.graph().owner(node), Some(1000));
        }
        other => panic!("Expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_portal_denial_is_reported() {
    let mut runtime = create_runtime(Some(PortalResponse::from_code(2)));
    let mut events = runtime.subscribe_events();
    let client = runtime.add_client(ClientInfo::sandboxed(4242, 1000));

    let RequestOutcome::Pending { seq } = runtime
        .client_create_node(client, "client-node", Properties::new())
        .unwrap()
    else {
        panic!("Sandboxed request should wait for the portal");
    };
    runtime.turn().await;

    assert_eq!(runtime.graph().n_nodes(), 0);
    assert!(matches!(
        next_request_event(&mut events),
        Some(GraphEvent::PermissionDenied { seq: s, .. }) if s == seq
    ));
}

#[tokio::test]
async fn test_granted_request_reports_failed_creation() {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(BrokenFactory));
    let mut runtime = MediaRuntime::with_registry(Arc::new(registry), RuntimeConfig::default());
    runtime.set_portal(Arc::new(ScriptedPortal(Some(PortalResponse::Granted))));
    let mut events = runtime.subscribe_events();
    let client = runtime.add_client(ClientInfo::sandboxed(4242, 1000));

    let RequestOutcome::Pending { seq } = runtime
        .client_create_node(client, "client-node", Properties::new())
        .unwrap()
    else {
        panic!("Sandboxed request should wait for the portal");
    };
    runtime.turn().await;

    assert_eq!(runtime.graph().n_nodes(), 0);
    assert!(!runtime.access().is_busy(client));
    match next_request_event(&mut events) {
        Some(GraphEvent::RequestFailed {
            client: c,
            seq: s,
            operation,
            error,
            ..
        }) => {
            assert_eq!((c, s), (client, seq));
            assert_eq!(operation, "create-node client-node");
            assert!(error.contains("no endpoint available"), "Unexpected error: {}", error);
        }
        other => panic!("Expected a failure report, got {:?}", other),
    }
}

#[tokio::test]
async fn test_busy_client_is_refused_until_cancelled() {
    let mut runtime = create_runtime(None);
    let client = runtime.add_client(ClientInfo::sandboxed(4242, 1000));

    runtime
        .client_create_node(client, "client-node", Properties::new())
        .unwrap();
    assert_eq!(
        runtime.client_create_node(client, "client-node", Properties::new()),
        Err(GraphError::Node(NodeError::Busy))
    );
    assert_eq!(runtime.access().n_pending(), 1);

    runtime.remove_client(client);
    assert_eq!(runtime.access().n_pending(), 0);
    assert!(!runtime.access().is_busy(client));
    assert_eq!(
        runtime.client_create_node(client, "client-node", Properties::new()),
        Err(GraphError::NoPermission),
        "Unknown clients get nothing"
    );
}

#[tokio::test]
async fn test_sandboxed_client_limits() {
    let mut runtime = create_runtime(None);
    let mut events = runtime.subscribe_events();
    let format = binary(runtime.formats());
    let client = runtime.add_client(ClientInfo::sandboxed(4242, 1000));

    assert_eq!(
        runtime.client_create_node(client, "test.probe", Properties::new()),
        Err(GraphError::NoPermission)
    );
    assert!(matches!(
        next_request_event(&mut events),
        Some(GraphEvent::PermissionDenied { operation, .. }) if operation == "create-node test.probe"
    ));

    let a = runtime.create_node("test.probe", Properties::new()).unwrap();
    let b = runtime.create_node("test.probe", Properties::new()).unwrap();
    assert_eq!(
        runtime.client_create_link(client, a, 0, b, 0, &format),
        Err(GraphError::NoPermission)
    );
    assert_eq!(runtime.graph().n_links(), 0);
}

#[tokio::test]
async fn test_visibility_follows_owner_uid() {
    let mut runtime = create_runtime(None);
    let alice = runtime.add_client(ClientInfo::trusted(1000));
    let bob = runtime.add_client(ClientInfo::trusted(1001));

    let shared = runtime.create_node("test.probe", Properties::new()).unwrap();
    let RequestOutcome::Completed(ObjectRef::Node(private)) = runtime
        .client_create_node(alice, "test.probe", Properties::new())
        .unwrap()
    else {
        panic!("Trusted creation should complete");
    };

    assert_eq!(runtime.visible_nodes(alice), vec![shared, private]);
    assert_eq!(runtime.visible_nodes(bob), vec![shared]);
    assert!(!runtime.is_node_visible(bob, private));
}

#[tokio::test]
async fn test_links_need_visible_nodes() {
    let mut runtime = create_runtime(None);
    let format = binary(runtime.formats());
    let alice = runtime.add_client(ClientInfo::trusted(1000));
    let bob = runtime.add_client(ClientInfo::trusted(1001));

    let src = runtime.create_node("test.probe", Properties::new()).unwrap();
    let sink = runtime
        .graph_mut()
        .add_node(Box::new(TestNode::sink()))
        .unwrap();
    runtime.graph_mut().set_owner(sink, Some(1000)).unwrap();

    assert_eq!(
        runtime.client_create_link(bob, src, 0, sink, 0, &format),
        Err(GraphError::NoPermission)
    );
    let link = runtime
        .client_create_link(alice, src, 0, sink, 0, &format)
        .unwrap();
    assert!(runtime.is_link_visible(alice, link));
    assert!(!runtime.is_link_visible(bob, link));
}

#[test]
fn test_flatpak_cgroup_detection() {
    let flatpak = "0::/user.slice/user-1000.slice\n1:name=systemd:/user.slice/user-1000.slice/user@1000.service/app.slice/app-flatpak-org.example.App-1234.scope\n";
    let native = "1:name=systemd:/user.slice/user-1000.slice/session-2.scope\n";

    assert!(cgroup_is_sandboxed(flatpak));
    assert!(!cgroup_is_sandboxed(native));
    assert!(!cgroup_is_sandboxed(""));
}

#[test]
fn test_portal_response_codes() {
    assert_eq!(PortalResponse::from_code(0), PortalResponse::Granted);
    assert_eq!(PortalResponse::from_code(1), PortalResponse::Cancelled);
    assert_eq!(PortalResponse::from_code(2), PortalResponse::Denied);
    assert_eq!(PortalResponse::from_code(99), PortalResponse::Denied);
}
