//! Session controller for the active node set

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use eculink_core::{
    BridgeKind, BusIndex, NodeIndex, ProtocolKind, Route, RouteCalculator, RouteHop, RoutingError,
    SystemSnapshot, ViewConfig,
};

use crate::config::DriverConfig;
use crate::protocol::{
    service_id, LegacyProtocol, LogonInfo, NodeProtocol, OpenSydeProtocol, ProtocolError,
};
use crate::transport::BusDispatcher;

/// One node participating in the diagnostic session.
pub struct ActiveNode {
    /// Global node index in the system snapshot.
    pub node_index: NodeIndex,
    pub name: String,
    pub protocol: NodeProtocol,
    pub route: Route,
}

/// Session and routing state across all active nodes.
///
/// The controller is handed one transport binding per active node at
/// construction; position in the binding list matches position in the view's
/// active node list. Nodes that fail to enter diagnostic mode go onto the
/// defect list and are skipped by everything that runs periodically.
pub struct SessionController {
    nodes: Vec<Arc<ActiveNode>>,
    /// Active indices of nodes that failed session entry.
    defect: RwLock<BTreeSet<usize>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("nodes", &self.nodes.len())
            .field("defect", &*self.defect.read())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl SessionController {
    /// Plan routes and build a protocol client for every active node.
    ///
    /// `dispatchers` must carry exactly one binding per entry in
    /// `view.active_nodes`, in the same order. Route planning failures are
    /// hard errors; a node nobody can reach is a configuration problem, not
    /// a runtime defect.
    pub fn new(
        snapshot: &SystemSnapshot,
        view: &ViewConfig,
        config: &DriverConfig,
        dispatchers: Vec<Arc<dyn BusDispatcher>>,
    ) -> Result<Self, SessionError> {
        if dispatchers.len() != view.active_nodes.len() {
            return Err(SessionError::BindingMismatch {
                expected: view.active_nodes.len(),
                got: dispatchers.len(),
            });
        }

        let calculator = RouteCalculator::new(snapshot);
        let request_timeout = Duration::from_millis(config.request_timeout_ms);

        let mut nodes = Vec::with_capacity(view.active_nodes.len());
        for (&node_index, dispatcher) in view.active_nodes.iter().zip(dispatchers) {
            let decl = snapshot
                .node(node_index)
                .ok_or(RoutingError::UnknownNode(node_index))?;
            let route = calculator.route(node_index)?;

            let protocol = match decl.protocol {
                ProtocolKind::OpenSyde => NodeProtocol::OpenSyde(
                    OpenSydeProtocol::new(dispatcher, decl.security_level)
                        .with_timeout(request_timeout),
                ),
                ProtocolKind::Legacy => {
                    // Legacy logon announces the project identity from the
                    // node's first datapool declaration.
                    let logon = decl
                        .data_pools
                        .first()
                        .map(|dp| LogonInfo {
                            version: dp.version,
                            definition_crc: dp.definition_crc,
                        })
                        .unwrap_or_default();
                    NodeProtocol::Legacy(
                        LegacyProtocol::new(dispatcher, logon).with_timeout(request_timeout),
                    )
                }
            };

            debug!(
                node = %decl.name,
                protocol = ?decl.protocol,
                hops = route.hops.len(),
                "Session node prepared"
            );
            nodes.push(Arc::new(ActiveNode {
                node_index,
                name: decl.name.clone(),
                protocol,
                route,
            }));
        }

        Ok(Self {
            nodes,
            defect: RwLock::new(BTreeSet::new()),
            request_timeout,
        })
    }

    pub fn nodes(&self) -> &[Arc<ActiveNode>] {
        &self.nodes
    }

    /// Session-local active index of a global node index.
    pub fn active_index_of(&self, node_index: NodeIndex) -> Option<usize> {
        self.nodes.iter().position(|n| n.node_index == node_index)
    }

    pub fn node_at(&self, active_index: usize) -> Option<&Arc<ActiveNode>> {
        self.nodes.get(active_index)
    }

    pub fn is_defect(&self, active_index: usize) -> bool {
        self.defect.read().contains(&active_index)
    }

    /// Active indices currently on the defect list, ascending.
    pub fn defect_active_indices(&self) -> Vec<usize> {
        self.defect.read().iter().copied().collect()
    }

    /// Names of nodes currently on the defect list.
    pub fn defect_node_names(&self) -> Vec<String> {
        let defect = self.defect.read();
        defect
            .iter()
            .filter_map(|&idx| self.nodes.get(idx).map(|n| n.name.clone()))
            .collect()
    }

    /// Activate every bridge hop the planned routes need, nearest hop first.
    /// Returns the number of nodes that needed at least one hop.
    pub async fn activate_routing(&self) -> Result<usize, SessionError> {
        let mut routed = 0usize;
        for node in &self.nodes {
            if node.route.is_direct() {
                continue;
            }
            routed += 1;
            for hop in &node.route.hops {
                let request = hop_request(hop, service_id::ROUTING_ACTIVATE)?;
                let response = node
                    .protocol
                    .dispatcher()
                    .send_receive(&request, self.request_timeout)
                    .await
                    .map_err(|e| SessionError::ActivationFailed {
                        node: node.name.clone(),
                        reason: e.to_string(),
                    })?;
                if response.first() != Some(&(service_id::ROUTING_ACTIVATE | 0x40)) {
                    return Err(SessionError::ActivationFailed {
                        node: node.name.clone(),
                        reason: format!("unexpected response {}", hex::encode(&response)),
                    });
                }
                debug!(
                    node = %node.name,
                    in_bus = hop.in_bus,
                    out_bus = hop.out_bus,
                    "Routing hop activated"
                );
            }
        }
        if routed > 0 {
            info!(routed, "Routing activated");
        }
        Ok(routed)
    }

    /// Bring every active node into diagnostic mode.
    ///
    /// Runs one pass over all nodes, then retries the timed-out subset
    /// once; a node that actively refused made its decision and is not
    /// asked again. Nodes still failing after the retry go onto the defect
    /// list and are reported together; nothing is rolled back, the session
    /// keeps operating with the nodes that made it.
    pub async fn set_diagnostic_mode(&self) -> Result<(), SessionError> {
        if self.nodes.is_empty() {
            return Err(SessionError::NoActiveNodes);
        }
        self.defect.write().clear();

        let mut retry: Vec<usize> = Vec::new();
        let mut still_failed: Vec<(usize, ProtocolError)> = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            match node.protocol.enter_diagnostic().await {
                Ok(()) => {}
                Err(e) if e.is_timeout() => {
                    warn!(node = %node.name, error = %e, "Diagnostic mode entry timed out, retrying");
                    retry.push(idx);
                }
                Err(e) => {
                    warn!(node = %node.name, error = %e, "Diagnostic mode entry refused");
                    still_failed.push((idx, e));
                }
            }
        }

        if retry.is_empty() && still_failed.is_empty() {
            info!(nodes = self.nodes.len(), "All nodes in diagnostic mode");
            return Ok(());
        }

        for idx in retry {
            let node = &self.nodes[idx];
            if let Err(e) = node.protocol.enter_diagnostic().await {
                still_failed.push((idx, e));
            }
        }

        if still_failed.is_empty() {
            info!(
                nodes = self.nodes.len(),
                "All nodes in diagnostic mode after retry"
            );
            return Ok(());
        }
        still_failed.sort_by_key(|&(idx, _)| idx);

        let timed_out = still_failed.iter().any(|(_, e)| e.is_timeout());
        let mut names = Vec::with_capacity(still_failed.len());
        {
            let mut defect = self.defect.write();
            for (idx, e) in &still_failed {
                let node = &self.nodes[*idx];
                warn!(node = %node.name, error = %e, "Node marked defect");
                defect.insert(*idx);
                names.push(node.name.clone());
            }
        }
        Err(SessionError::NodesUnreachable { names, timed_out })
    }

    /// Leave diagnostic mode on every reachable node and tear routing down.
    ///
    /// Teardown is best effort: every step runs regardless of earlier
    /// failures and the last logoff error is reported at the end. The step
    /// order is load-bearing: transmissions must be stopped before routing
    /// falls away, otherwise an in-flight cyclic frame arriving through a
    /// dead bridge corrupts the transport state.
    pub async fn leave_diagnostic_mode(&self) -> Result<(), SessionError> {
        let mut last_error: Option<String> = None;

        // Legacy sessions end with an explicit logoff, sent while the
        // session is still fully alive.
        for node in self.reachable_nodes() {
            if node.protocol.kind() != ProtocolKind::Legacy {
                continue;
            }
            if let Err(e) = node.protocol.leave_diagnostic().await {
                warn!(node = %node.name, error = %e, "Logoff failed");
                last_error = Some(format!("{}: {}", node.name, e));
            }
        }

        for node in self.reachable_nodes() {
            if let Err(e) = node.protocol.stop_all_transmissions().await {
                warn!(node = %node.name, error = %e, "Stopping transmissions failed");
            }
        }

        // Native sessions fall back to default before the bridges go.
        for node in self.reachable_nodes() {
            if node.protocol.kind() == ProtocolKind::Legacy {
                continue;
            }
            if let Err(e) = node.protocol.leave_diagnostic().await {
                warn!(node = %node.name, error = %e, "Leaving diagnostic mode failed");
                last_error = Some(format!("{}: {}", node.name, e));
            }
        }

        // Routing falls away in reverse activation order, outermost node and
        // innermost hop last to first.
        for node in self.nodes.iter().rev() {
            for hop in node.route.hops.iter().rev() {
                let request = match hop_request(hop, service_id::ROUTING_DEACTIVATE) {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                match node
                    .protocol
                    .dispatcher()
                    .send_receive(&request, self.request_timeout)
                    .await
                {
                    Ok(response)
                        if response.first()
                            == Some(&(service_id::ROUTING_DEACTIVATE | 0x40)) =>
                    {
                        debug!(node = %node.name, in_bus = hop.in_bus, "Routing hop deactivated");
                    }
                    Ok(response) => {
                        warn!(
                            node = %node.name,
                            response = %hex::encode(&response),
                            "Routing deactivation rejected"
                        );
                    }
                    Err(e) => {
                        warn!(node = %node.name, error = %e, "Routing deactivation failed");
                    }
                }
            }
        }

        match last_error {
            None => Ok(()),
            Some(detail) => Err(SessionError::TeardownIncomplete(detail)),
        }
    }

    /// Keepalive over all reachable nodes. Individual failures only warn;
    /// the keepalive must never take the cycle down.
    pub async fn send_tester_present(&self) {
        for node in self.reachable_nodes() {
            if let Err(e) = node.protocol.tester_present().await {
                warn!(node = %node.name, error = %e, "Tester present failed");
            }
        }
    }

    /// Active nodes not currently on the defect list. Collected up front so
    /// no lock is held across an await.
    fn reachable_nodes(&self) -> Vec<Arc<ActiveNode>> {
        let defect = self.defect.read();
        self.nodes
            .iter()
            .enumerate()
            .filter(|(idx, _)| !defect.contains(idx))
            .map(|(_, node)| Arc::clone(node))
            .collect()
    }
}

/// Wire form of one hop (de)activation: SID, entry bus, exit bus, bridge
/// mode. Bus indices ride in single bytes on the wire.
fn hop_request(hop: &RouteHop, sid: u8) -> Result<Vec<u8>, SessionError> {
    let in_bus = u8::try_from(hop.in_bus).map_err(|_| SessionError::BusIndexRange(hop.in_bus))?;
    let out_bus =
        u8::try_from(hop.out_bus).map_err(|_| SessionError::BusIndexRange(hop.out_bus))?;
    let bridge = match hop.bridge {
        BridgeKind::OsyToOsy => 0x00,
        BridgeKind::OsyToLegacy => 0x01,
    };
    Ok(vec![sid, in_bus, out_bus, bridge])
}

/// Session layer errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("the active view contains no nodes")]
    NoActiveNodes,

    #[error("{got} transport bindings for {expected} active nodes")]
    BindingMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("bus index {0} exceeds the routing frame's 8-bit field")]
    BusIndexRange(BusIndex),

    #[error("routing activation towards '{node}' failed: {reason}")]
    ActivationFailed { node: String, reason: String },

    #[error("nodes unreachable in diagnostic mode: {}", names.join(", "))]
    NodesUnreachable { names: Vec<String>, timed_out: bool },

    #[error("session teardown left errors behind: {0}")]
    TeardownIncomplete(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockDispatcherConfig;
    use crate::transport::mock::MockDispatcher;
    use eculink_core::{BusDecl, BusKind, DataPoolDecl, InterfaceDecl, NodeDecl};
    use pretty_assertions::assert_eq;

    fn interface(bus: BusIndex, node_id: u8, routing: bool) -> InterfaceDecl {
        InterfaceDecl {
            bus,
            node_id,
            is_diag_capable: true,
            is_routing_capable: routing,
        }
    }

    fn node(name: &str, protocol: ProtocolKind, interfaces: Vec<InterfaceDecl>) -> NodeDecl {
        NodeDecl {
            name: name.into(),
            protocol,
            interfaces,
            data_pools: vec![DataPoolDecl {
                name: "APPL".into(),
                version: [1, 2, 0],
                definition_crc: 0xCAFEBABE,
                lists: vec![],
            }],
            security_level: 1,
        }
    }

    fn flat_snapshot(protocols: &[ProtocolKind]) -> SystemSnapshot {
        SystemSnapshot {
            nodes: protocols
                .iter()
                .enumerate()
                .map(|(i, &p)| node(&format!("ecu{}", i), p, vec![interface(0, i as u8 + 1, false)]))
                .collect(),
            buses: vec![BusDecl {
                name: "CAN_MAIN".into(),
                kind: BusKind::Can,
                bitrate: Some(500_000),
            }],
            client_bus: 0,
        }
    }

    fn view_over(nodes: &[NodeIndex]) -> ViewConfig {
        ViewConfig {
            name: "test".into(),
            active_nodes: nodes.to_vec(),
            rail_rates_ms: [100, 500, 1000],
            elements: vec![],
        }
    }

    fn mocks(n: usize) -> (Vec<Arc<MockDispatcher>>, Vec<Arc<dyn BusDispatcher>>) {
        let mocks: Vec<Arc<MockDispatcher>> = (0..n)
            .map(|_| Arc::new(MockDispatcher::new(&MockDispatcherConfig::default())))
            .collect();
        let bindings = mocks
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn BusDispatcher>)
            .collect();
        (mocks, bindings)
    }

    fn controller(
        snapshot: &SystemSnapshot,
        view: &ViewConfig,
        bindings: Vec<Arc<dyn BusDispatcher>>,
    ) -> SessionController {
        SessionController::new(snapshot, view, &DriverConfig::default(), bindings).unwrap()
    }

    #[test]
    fn hop_request_wire_format() {
        let hop = RouteHop {
            via_node: 3,
            in_bus: 0,
            out_bus: 2,
            bridge: BridgeKind::OsyToOsy,
        };
        assert_eq!(
            hop_request(&hop, service_id::ROUTING_ACTIVATE).unwrap(),
            vec![0xB8, 0x00, 0x02, 0x00]
        );

        let legacy_hop = RouteHop {
            bridge: BridgeKind::OsyToLegacy,
            ..hop
        };
        assert_eq!(
            hop_request(&legacy_hop, service_id::ROUTING_DEACTIVATE).unwrap(),
            vec![0xB9, 0x00, 0x02, 0x01]
        );
    }

    #[test]
    fn binding_count_must_match_active_nodes() {
        let snapshot = flat_snapshot(&[ProtocolKind::OpenSyde, ProtocolKind::OpenSyde]);
        let view = view_over(&[0, 1]);
        let (_, bindings) = mocks(1);
        let err =
            SessionController::new(&snapshot, &view, &DriverConfig::default(), bindings)
                .unwrap_err();
        assert!(matches!(
            err,
            SessionError::BindingMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[tokio::test]
    async fn empty_view_is_rejected() {
        let snapshot = flat_snapshot(&[ProtocolKind::OpenSyde]);
        let view = view_over(&[]);
        let ctrl = controller(&snapshot, &view, vec![]);
        assert!(matches!(
            ctrl.set_diagnostic_mode().await,
            Err(SessionError::NoActiveNodes)
        ));
    }

    #[tokio::test]
    async fn all_nodes_enter_diagnostic_mode() {
        let snapshot = flat_snapshot(&[ProtocolKind::OpenSyde, ProtocolKind::OpenSyde]);
        let view = view_over(&[0, 1]);
        let (mocks, bindings) = mocks(2);
        let ctrl = controller(&snapshot, &view, bindings);

        ctrl.set_diagnostic_mode().await.unwrap();

        for mock in &mocks {
            let sent = mock.sent_requests();
            assert_eq!(sent[0], vec![0x10, 0x03]);
            assert_eq!(sent[1], vec![0x27, 0x01]);
        }
        assert!(ctrl.defect_node_names().is_empty());
    }

    #[tokio::test]
    async fn silent_node_lands_on_defect_list_after_retry() {
        let snapshot = flat_snapshot(&[ProtocolKind::OpenSyde, ProtocolKind::OpenSyde]);
        let view = view_over(&[0, 1]);
        let (mocks, bindings) = mocks(2);
        mocks[1].set_silent(true);
        let ctrl = controller(&snapshot, &view, bindings);

        let err = ctrl.set_diagnostic_mode().await.unwrap_err();
        match err {
            SessionError::NodesUnreachable { names, timed_out } => {
                assert_eq!(names, vec!["ecu1".to_string()]);
                assert!(timed_out);
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(!ctrl.is_defect(0));
        assert!(ctrl.is_defect(1));
        assert_eq!(ctrl.defect_node_names(), vec!["ecu1".to_string()]);
        // first pass plus one retry, each stopping at the session request
        assert_eq!(mocks[1].sent_requests(), vec![vec![0x10, 0x03]; 2]);

        // the defect node is skipped from then on
        let before = mocks[1].sent_requests().len();
        ctrl.send_tester_present().await;
        assert_eq!(mocks[1].sent_requests().len(), before);
        assert_eq!(mocks[0].sent_requests().last().unwrap(), &vec![0x3E, 0x80]);
    }

    #[tokio::test]
    async fn refused_entry_goes_defect_without_a_retry() {
        let snapshot = flat_snapshot(&[ProtocolKind::OpenSyde, ProtocolKind::OpenSyde]);
        let view = view_over(&[0, 1]);
        let (mocks, bindings) = mocks(2);
        // node 1 refuses the extended session, conditions not correct
        mocks[1].push_response(vec![0x10, 0x03], vec![0x7F, 0x10, 0x22]);
        let ctrl = controller(&snapshot, &view, bindings);

        let err = ctrl.set_diagnostic_mode().await.unwrap_err();
        match err {
            SessionError::NodesUnreachable { names, timed_out } => {
                assert_eq!(names, vec!["ecu1".to_string()]);
                assert!(!timed_out);
            }
            other => panic!("unexpected error: {}", other),
        }

        // a refusal is final: exactly one session request went out
        assert_eq!(mocks[1].sent_requests(), vec![vec![0x10, 0x03]]);
        assert!(!ctrl.is_defect(0));
        assert!(ctrl.is_defect(1));
    }

    #[tokio::test]
    async fn legacy_node_logs_on_and_off() {
        let snapshot = flat_snapshot(&[ProtocolKind::Legacy]);
        let view = view_over(&[0]);
        let (mocks, bindings) = mocks(1);
        mocks[0].push_response(vec![0xB0], vec![0xF0]);
        mocks[0].push_response(vec![0xB1], vec![0xF1]);
        let ctrl = controller(&snapshot, &view, bindings);

        ctrl.set_diagnostic_mode().await.unwrap();
        assert_eq!(
            mocks[0].sent_requests()[0],
            vec![0xB0, 1, 2, 0, 0xCA, 0xFE, 0xBA, 0xBE]
        );

        // keepalive is a no-op for legacy nodes
        let before = mocks[0].sent_requests().len();
        ctrl.send_tester_present().await;
        assert_eq!(mocks[0].sent_requests().len(), before);

        ctrl.leave_diagnostic_mode().await.unwrap();
        assert_eq!(mocks[0].sent_requests().last().unwrap(), &vec![0xB1]);
    }

    #[tokio::test]
    async fn routed_node_activates_and_tears_down_its_hop() {
        // client bus 0 -- gateway -- bus 1 -- far node
        let snapshot = SystemSnapshot {
            nodes: vec![
                node(
                    "gateway",
                    ProtocolKind::OpenSyde,
                    vec![interface(0, 2, true), interface(1, 2, true)],
                ),
                node("far", ProtocolKind::OpenSyde, vec![interface(1, 3, false)]),
            ],
            buses: vec![
                BusDecl {
                    name: "CAN_A".into(),
                    kind: BusKind::Can,
                    bitrate: Some(500_000),
                },
                BusDecl {
                    name: "CAN_B".into(),
                    kind: BusKind::Can,
                    bitrate: Some(125_000),
                },
            ],
            client_bus: 0,
        };
        let view = view_over(&[1]);
        let (mocks, bindings) = mocks(1);
        mocks[0].push_response(vec![0xB8], vec![0xF8]);
        mocks[0].push_response(vec![0xB9], vec![0xF9]);
        let ctrl = controller(&snapshot, &view, bindings);

        let routed = ctrl.activate_routing().await.unwrap();
        assert_eq!(routed, 1);
        assert_eq!(mocks[0].sent_requests()[0], vec![0xB8, 0x00, 0x01, 0x00]);

        ctrl.set_diagnostic_mode().await.unwrap();
        ctrl.leave_diagnostic_mode().await.unwrap();
        assert_eq!(
            mocks[0].sent_requests().last().unwrap(),
            &vec![0xB9, 0x00, 0x01, 0x00]
        );
    }

    #[tokio::test]
    async fn rejected_hop_activation_is_a_hard_error() {
        let snapshot = SystemSnapshot {
            nodes: vec![
                node(
                    "gateway",
                    ProtocolKind::OpenSyde,
                    vec![interface(0, 2, true), interface(1, 2, true)],
                ),
                node("far", ProtocolKind::OpenSyde, vec![interface(1, 3, false)]),
            ],
            buses: vec![
                BusDecl {
                    name: "CAN_A".into(),
                    kind: BusKind::Can,
                    bitrate: None,
                },
                BusDecl {
                    name: "CAN_B".into(),
                    kind: BusKind::Can,
                    bitrate: None,
                },
            ],
            client_bus: 0,
        };
        let view = view_over(&[1]);
        let (mocks, bindings) = mocks(1);
        mocks[0].push_response(vec![0xB8], vec![0x7F, 0xB8, 0x11]);
        let ctrl = controller(&snapshot, &view, bindings);

        let err = ctrl.activate_routing().await.unwrap_err();
        assert!(matches!(err, SessionError::ActivationFailed { .. }));
    }
}
