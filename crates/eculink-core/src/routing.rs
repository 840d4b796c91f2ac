//! Bus route calculation.
//!
//! Diagnostic traffic reaches nodes on remote bus segments through routing
//! nodes that bridge between their interfaces. The calculator walks the
//! topology breadth-first from the client's own bus segment and returns the
//! shortest hop chain to a target node, or a descriptive error when no
//! diagnostic path exists.

use thiserror::Error;

use crate::topology::{BusIndex, NodeIndex, ProtocolKind, SystemSnapshot};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("node index {0} is not part of the system")]
    UnknownNode(NodeIndex),
    #[error("node '{node}' has no diagnostic-capable interface")]
    NoDiagInterface { node: String },
    #[error("no diagnostic route from the client bus to node '{node}'")]
    TargetUnreachable { node: String },
}

/// Protocol translation a routing node performs on a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// Both sides of the hop speak the native protocol.
    OsyToOsy,
    /// Final hop towards a legacy-protocol target; the router translates.
    OsyToLegacy,
}

/// One bridge traversal on the way to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHop {
    pub via_node: NodeIndex,
    pub in_bus: BusIndex,
    pub out_bus: BusIndex,
    pub bridge: BridgeKind,
}

/// Complete path to a target node. An empty hop list means the target sits
/// on the client's own bus segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: NodeIndex,
    pub hops: Vec<RouteHop>,
}

impl Route {
    pub fn is_direct(&self) -> bool {
        self.hops.is_empty()
    }
}

/// Shortest-path calculator over a [`SystemSnapshot`].
pub struct RouteCalculator<'a> {
    snapshot: &'a SystemSnapshot,
}

impl<'a> RouteCalculator<'a> {
    pub fn new(snapshot: &'a SystemSnapshot) -> Self {
        Self { snapshot }
    }

    /// Compute the route to `target`.
    ///
    /// Routing nodes must speak the native protocol and carry a
    /// routing-capable interface on both the entry and exit bus. A
    /// legacy-protocol target is reachable, but only as the endpoint of its
    /// final hop; the hop is then marked [`BridgeKind::OsyToLegacy`].
    pub fn route(&self, target: NodeIndex) -> Result<Route, RoutingError> {
        let node = self
            .snapshot
            .node(target)
            .ok_or(RoutingError::UnknownNode(target))?;

        if !node.interfaces.iter().any(|itf| itf.is_diag_capable) {
            return Err(RoutingError::NoDiagInterface {
                node: node.name.clone(),
            });
        }

        // Breadth-first over bus segments, keeping the hop chain that first
        // reached each bus. Systems are small; cloning chains is fine.
        let mut visited = vec![false; self.snapshot.buses.len()];
        let mut queue: std::collections::VecDeque<(BusIndex, Vec<RouteHop>)> =
            std::collections::VecDeque::new();

        if let Some(slot) = visited.get_mut(self.snapshot.client_bus as usize) {
            *slot = true;
        }
        queue.push_back((self.snapshot.client_bus, Vec::new()));

        while let Some((bus, hops)) = queue.pop_front() {
            if node
                .interfaces
                .iter()
                .any(|itf| itf.bus == bus && itf.is_diag_capable)
            {
                let mut hops = hops;
                if node.protocol == ProtocolKind::Legacy {
                    if let Some(last) = hops.last_mut() {
                        last.bridge = BridgeKind::OsyToLegacy;
                    }
                }
                return Ok(Route { target, hops });
            }

            for (idx, candidate) in self.snapshot.nodes.iter().enumerate() {
                // Only native-protocol nodes can forward diagnostic traffic.
                if candidate.protocol != ProtocolKind::OpenSyde {
                    continue;
                }
                let Some(entry) = candidate
                    .interfaces
                    .iter()
                    .find(|itf| itf.bus == bus && itf.is_routing_capable)
                else {
                    continue;
                };
                for exit in &candidate.interfaces {
                    if exit.bus == entry.bus || !exit.is_routing_capable {
                        continue;
                    }
                    let Some(seen) = visited.get_mut(exit.bus as usize) else {
                        continue;
                    };
                    if *seen {
                        continue;
                    }
                    *seen = true;
                    let mut next = hops.clone();
                    next.push(RouteHop {
                        via_node: idx as NodeIndex,
                        in_bus: entry.bus,
                        out_bus: exit.bus,
                        bridge: BridgeKind::OsyToOsy,
                    });
                    queue.push_back((exit.bus, next));
                }
            }
        }

        Err(RoutingError::TargetUnreachable {
            node: node.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{BusDecl, BusKind, InterfaceDecl, NodeDecl};

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
            data_pools: vec![],
            security_level: 1,
        }
    }

    fn bus(name: &str) -> BusDecl {
        BusDecl {
            name: name.into(),
            kind: BusKind::Can,
            bitrate: Some(500_000),
        }
    }

    /// client bus 0 -- gateway -- bus 1 -- far node
    fn two_segment_snapshot(far_protocol: ProtocolKind) -> SystemSnapshot {
        SystemSnapshot {
            nodes: vec![
                node("near", ProtocolKind::OpenSyde, vec![interface(0, 1, false)]),
                node(
                    "gateway",
                    ProtocolKind::OpenSyde,
                    vec![interface(0, 2, true), interface(1, 2, true)],
                ),
                node("far", far_protocol, vec![interface(1, 3, false)]),
            ],
            buses: vec![bus("CAN_A"), bus("CAN_B")],
            client_bus: 0,
        }
    }

    #[test]
    fn same_bus_target_has_no_hops() {
        let snapshot = two_segment_snapshot(ProtocolKind::OpenSyde);
        let route = RouteCalculator::new(&snapshot).route(0).unwrap();
        assert!(route.is_direct());
    }

    #[test]
    fn one_bridge_to_remote_segment() {
        let snapshot = two_segment_snapshot(ProtocolKind::OpenSyde);
        let route = RouteCalculator::new(&snapshot).route(2).unwrap();
        assert_eq!(route.hops.len(), 1);
        assert_eq!(route.hops[0].via_node, 1);
        assert_eq!(route.hops[0].in_bus, 0);
        assert_eq!(route.hops[0].out_bus, 1);
        assert_eq!(route.hops[0].bridge, BridgeKind::OsyToOsy);
    }

    #[test]
    fn legacy_target_marks_final_hop() {
        let snapshot = two_segment_snapshot(ProtocolKind::Legacy);
        let route = RouteCalculator::new(&snapshot).route(2).unwrap();
        assert_eq!(route.hops[0].bridge, BridgeKind::OsyToLegacy);
    }

    #[test]
    fn unreachable_target_reports_node_name() {
        let mut snapshot = two_segment_snapshot(ProtocolKind::OpenSyde);
        // cut the gateway's exit interface
        snapshot.nodes[1].interfaces[1].is_routing_capable = false;
        let err = RouteCalculator::new(&snapshot).route(2).unwrap_err();
        assert_eq!(
            err,
            RoutingError::TargetUnreachable {
                node: "far".into()
            }
        );
    }

    #[test]
    fn node_without_diag_interface_is_rejected() {
        let mut snapshot = two_segment_snapshot(ProtocolKind::OpenSyde);
        for itf in &mut snapshot.nodes[2].interfaces {
            itf.is_diag_capable = false;
        }
        let err = RouteCalculator::new(&snapshot).route(2).unwrap_err();
        assert!(matches!(err, RoutingError::NoDiagInterface { .. }));
    }

    #[test]
    fn unknown_index_is_rejected() {
        let snapshot = two_segment_snapshot(ProtocolKind::OpenSyde);
        let err = RouteCalculator::new(&snapshot).route(42).unwrap_err();
        assert_eq!(err, RoutingError::UnknownNode(42));
    }
}
