//! Cyclic/event rail registration engine
//!
//! Configures the three periodic rails on every active node and walks the
//! view's element-to-rail table, registering each element for cyclic or
//! change-driven transmission. Registration is a batch with partial-failure
//! semantics: a device rejecting one element never blocks the rest, and
//! the report carries every failure by name.

use std::sync::Arc;

use tracing::{debug, info, warn};

use eculink_core::{ElementId, NodeIndex, ProtocolKind, TransmissionMode, ViewConfig};

use crate::protocol::{NegativeResponseCode, PackedElement, ProtocolError};
use crate::session::SessionController;

/// Per-node registration outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRailReport {
    pub node_index: NodeIndex,
    pub node_name: String,
    /// Registrations actually issued to this node, in table order.
    pub attempted: usize,
    pub registered: usize,
    /// Table-order ordinal (1-based, per node) of the first element the
    /// device refused with "no transmission slot left" (NRC 0x70). The
    /// device's headroom is this ordinal minus one.
    pub first_rejected_ordinal: Option<usize>,
}

/// Outcome of one `register_transmissions` batch.
#[derive(Debug, Clone, Default)]
pub struct RailRegistrationReport {
    pub attempted: usize,
    pub registered: usize,
    /// Every failed element with a human-readable reason. The batch always
    /// runs to the end; an element is either registered or listed here.
    pub failed: Vec<(ElementId, String)>,
    pub nodes: Vec<NodeRailReport>,
}

impl RailRegistrationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Rail engine errors
#[derive(Debug, thiserror::Error)]
pub enum RailError {
    #[error("rail {rail} rate {interval_ms} ms rejected by '{node}': {reason}")]
    RateRejected {
        node: String,
        rail: u8,
        interval_ms: u32,
        reason: String,
    },

    #[error("rail {rail} rate {interval_ms} ms exceeds the 16-bit interval field")]
    RateRange { rail: u8, interval_ms: u32 },

    #[error("stopping transmissions failed on: {}", nodes.join(", "))]
    StopIncomplete { nodes: Vec<String> },
}

/// Rail configuration and element registration over the active node set.
pub struct RailEngine {
    controller: Arc<SessionController>,
}

impl RailEngine {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }

    /// Push the three rail rates to every reachable node, rail 0 first.
    ///
    /// The batch aborts on the first rejection; a node that cannot keep the
    /// requested rates would silently starve its registrations otherwise.
    /// Legacy nodes carry no rails and are skipped.
    pub async fn configure_rails(&self, rates_ms: [u32; 3]) -> Result<(), RailError> {
        for (active_index, node) in self.controller.nodes().iter().enumerate() {
            if self.controller.is_defect(active_index) {
                continue;
            }
            if node.protocol.kind() == ProtocolKind::Legacy {
                continue;
            }
            for (rail, &interval_ms) in rates_ms.iter().enumerate() {
                let rail = rail as u8;
                let interval = u16::try_from(interval_ms)
                    .map_err(|_| RailError::RateRange { rail, interval_ms })?;
                node.protocol
                    .set_rail_rate(rail, interval)
                    .await
                    .map_err(|e| RailError::RateRejected {
                        node: node.name.clone(),
                        rail,
                        interval_ms,
                        reason: e.to_string(),
                    })?;
            }
            debug!(node = %node.name, rates = ?rates_ms, "Rail rates configured");
        }
        Ok(())
    }

    /// Register every element of the view's rail table on its owning node.
    ///
    /// Elements owned by nodes outside the active set are skipped without
    /// error and without touching any counter. On-trigger elements issue no
    /// registration; they are serviced on demand through the dealer. Every
    /// other failure lands in the report and the batch continues.
    pub async fn register_transmissions(&self, view: &ViewConfig) -> RailRegistrationReport {
        let mut report = RailRegistrationReport::default();
        let mut node_reports: Vec<NodeRailReport> = self
            .controller
            .nodes()
            .iter()
            .map(|node| NodeRailReport {
                node_index: node.node_index,
                node_name: node.name.clone(),
                attempted: 0,
                registered: 0,
                first_rejected_ordinal: None,
            })
            .collect();

        for entry in &view.elements {
            let Some(active_index) = self.controller.active_index_of(entry.element.node) else {
                // Not part of this session's view; not an error.
                continue;
            };
            let node = match self.controller.node_at(active_index) {
                Some(node) => Arc::clone(node),
                None => continue,
            };
            if self.controller.is_defect(active_index) {
                report.failed.push((
                    entry.element,
                    format!("node '{}' is unreachable in this session", node.name),
                ));
                continue;
            }
            if entry.rail > 2 {
                report.failed.push((
                    entry.element,
                    format!("rail index {} out of range (0..=2)", entry.rail),
                ));
                continue;
            }
            // Range-assert the wire address before anything goes out.
            if let Err(e) = PackedElement::try_from_id(&entry.element) {
                report.failed.push((entry.element, e.to_string()));
                continue;
            }

            let call = match &entry.mode {
                TransmissionMode::Cyclic => {
                    Some(node.protocol.register_cyclic(entry.rail, &entry.element).await)
                }
                TransmissionMode::OnChange { threshold } => {
                    match threshold.to_change_threshold_le() {
                        Ok(threshold_le) => Some(
                            node.protocol
                                .register_on_change(entry.rail, &entry.element, threshold_le)
                                .await,
                        ),
                        Err(e) => {
                            report.failed.push((entry.element, e.to_string()));
                            continue;
                        }
                    }
                }
                TransmissionMode::OnTrigger => None,
            };

            let Some(result) = call else {
                continue;
            };
            let node_report = &mut node_reports[active_index];
            node_report.attempted += 1;
            report.attempted += 1;

            match result {
                Ok(()) => {
                    node_report.registered += 1;
                    report.registered += 1;
                }
                Err(e) => {
                    if is_transmission_slots_exhausted(&e)
                        && node_report.first_rejected_ordinal.is_none()
                    {
                        node_report.first_rejected_ordinal = Some(node_report.attempted);
                        warn!(
                            node = %node.name,
                            ordinal = node_report.attempted,
                            "Node out of transmission slots"
                        );
                    }
                    report.failed.push((entry.element, e.to_string()));
                }
            }
        }

        report.nodes = node_reports;
        info!(
            attempted = report.attempted,
            registered = report.registered,
            failed = report.failed.len(),
            "Rail registration done"
        );
        report
    }

    /// Ask every reachable node to stop its transmissions.
    ///
    /// Runs through all nodes regardless of individual failures; a single
    /// aggregate error names the nodes that did not stop.
    pub async fn stop_transmissions(&self) -> Result<(), RailError> {
        let mut failed_nodes = Vec::new();
        for (active_index, node) in self.controller.nodes().iter().enumerate() {
            if self.controller.is_defect(active_index) {
                continue;
            }
            if let Err(e) = node.protocol.stop_all_transmissions().await {
                warn!(node = %node.name, error = %e, "Stopping transmissions failed");
                failed_nodes.push(node.name.clone());
            }
        }
        if failed_nodes.is_empty() {
            Ok(())
        } else {
            Err(RailError::StopIncomplete {
                nodes: failed_nodes,
            })
        }
    }
}

fn is_transmission_slots_exhausted(error: &ProtocolError) -> bool {
    error.nrc() == Some(NegativeResponseCode::UploadDownloadNotAccepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, MockDispatcherConfig};
    use crate::transport::mock::MockDispatcher;
    use crate::transport::BusDispatcher;
    use eculink_core::{
        BusDecl, BusKind, ElementValue, InterfaceDecl, NodeDecl, RailEntry, SystemSnapshot,
    };
    use pretty_assertions::assert_eq;

    fn snapshot(names: &[&str]) -> SystemSnapshot {
        SystemSnapshot {
            nodes: names
                .iter()
                .enumerate()
                .map(|(i, name)| NodeDecl {
                    name: (*name).into(),
                    protocol: ProtocolKind::OpenSyde,
                    interfaces: vec![InterfaceDecl {
                        bus: 0,
                        node_id: i as u8 + 1,
                        is_diag_capable: true,
                        is_routing_capable: false,
                    }],
                    data_pools: vec![],
                    security_level: 1,
                })
                .collect(),
            buses: vec![BusDecl {
                name: "CAN_MAIN".into(),
                kind: BusKind::Can,
                bitrate: Some(500_000),
            }],
            client_bus: 0,
        }
    }

    fn view(active: &[NodeIndex], elements: Vec<RailEntry>) -> ViewConfig {
        ViewConfig {
            name: "test".into(),
            active_nodes: active.to_vec(),
            rail_rates_ms: [100, 500, 1000],
            elements,
        }
    }

    fn cyclic(node: NodeIndex, element: u32, rail: u8) -> RailEntry {
        RailEntry {
            element: ElementId::new(node, 0, 0, element),
            rail,
            mode: TransmissionMode::Cyclic,
        }
    }

    fn engine_over(
        snapshot: &SystemSnapshot,
        view: &ViewConfig,
        mocks: &[Arc<MockDispatcher>],
    ) -> RailEngine {
        let bindings: Vec<Arc<dyn BusDispatcher>> = mocks
            .iter()
            .map(|m| Arc::clone(m) as Arc<dyn BusDispatcher>)
            .collect();
        let controller = Arc::new(
            SessionController::new(snapshot, view, &DriverConfig::default(), bindings).unwrap(),
        );
        RailEngine::new(controller)
    }

    #[tokio::test]
    async fn rail_rates_go_out_in_rail_order() {
        let snapshot = snapshot(&["ecu0"]);
        let view = view(&[0], vec![]);
        let mock = Arc::new(MockDispatcher::new(&MockDispatcherConfig::default()));
        let engine = engine_over(&snapshot, &view, &[mock.clone()]);

        engine.configure_rails([100, 500, 1000]).await.unwrap();

        let sent = mock.sent_requests();
        assert_eq!(sent[0], vec![0x2A, 0x01, 0x00, 0x00, 0x64]);
        assert_eq!(sent[1], vec![0x2A, 0x01, 0x01, 0x01, 0xF4]);
        assert_eq!(sent[2], vec![0x2A, 0x01, 0x02, 0x03, 0xE8]);
    }

    #[tokio::test]
    async fn rejected_rate_aborts_the_batch() {
        let snapshot = snapshot(&["ecu0", "ecu1"]);
        let view = view(&[0, 1], vec![]);
        let mocks = [
            Arc::new(MockDispatcher::new(&MockDispatcherConfig::default())),
            Arc::new(MockDispatcher::new(&MockDispatcherConfig::default())),
        ];
        mocks[1].push_response(vec![0x2A, 0x01], vec![0x7F, 0x2A, 0x31]);
        let engine = engine_over(&snapshot, &view, &mocks);

        let err = engine.configure_rails([100, 500, 1000]).await.unwrap_err();
        match err {
            RailError::RateRejected { node, rail, .. } => {
                assert_eq!(node, "ecu1");
                assert_eq!(rail, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        // ecu0 finished before the abort, ecu1 stopped at its first rate
        assert_eq!(mocks[0].sent_requests().len(), 3);
        assert_eq!(mocks[1].sent_requests().len(), 1);
    }

    #[tokio::test]
    async fn oversized_rate_is_rejected_locally() {
        let snapshot = snapshot(&["ecu0"]);
        let view = view(&[0], vec![]);
        let mock = Arc::new(MockDispatcher::new(&MockDispatcherConfig::default()));
        let engine = engine_over(&snapshot, &view, &[mock.clone()]);

        let err = engine.configure_rails([100, 70_000, 1000]).await.unwrap_err();
        assert!(matches!(err, RailError::RateRange { rail: 1, .. }));
    }

    #[tokio::test]
    async fn foreign_node_elements_are_skipped_silently() {
        let snapshot = snapshot(&["ecu0"]);
        // element on node 7, which is not in the view
        let view = view(&[0], vec![cyclic(7, 0, 0)]);
        let mock = Arc::new(MockDispatcher::new(&MockDispatcherConfig::default()));
        let engine = engine_over(&snapshot, &view, &[mock.clone()]);

        let report = engine.register_transmissions(&view).await;
        assert_eq!(report.attempted, 0);
        assert_eq!(report.registered, 0);
        assert!(report.failed.is_empty());
        assert!(mock.sent_requests().is_empty());
    }

    #[tokio::test]
    async fn slot_exhaustion_records_only_the_first_ordinal() {
        let snapshot = snapshot(&["ecu0"]);
        let mut elements: Vec<RailEntry> = (0..5).map(|i| cyclic(0, i, 0)).collect();
        elements.push(RailEntry {
            element: ElementId::new(0, 0, 0, 9),
            rail: 0,
            mode: TransmissionMode::OnTrigger,
        });
        let view = view(&[0], elements);

        let mock = Arc::new(MockDispatcher::new(&MockDispatcherConfig::default()));
        // the device has headroom for four registrations
        mock.push_response(vec![0x2A, 0x02], vec![0x7F, 0x2A, 0x70]);
        for _ in 0..4 {
            mock.push_response_once(vec![0x2A, 0x02], vec![0x6A]);
        }
        let engine = engine_over(&snapshot, &view, &[mock.clone()]);

        let report = engine.register_transmissions(&view).await;
        assert_eq!(report.attempted, 5);
        assert_eq!(report.registered, 4);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("UploadDownloadNotAccepted"));
        assert_eq!(report.nodes[0].first_rejected_ordinal, Some(5));

        // the on-trigger element never went on the wire
        let registrations = mock
            .sent_requests()
            .iter()
            .filter(|r| r.starts_with(&[0x2A, 0x02]))
            .count();
        assert_eq!(registrations, 5);
    }

    #[tokio::test]
    async fn on_change_threshold_travels_little_endian() {
        let snapshot = snapshot(&["ecu0"]);
        let view = view(
            &[0],
            vec![RailEntry {
                element: ElementId::new(0, 0, 0, 2),
                rail: 1,
                mode: TransmissionMode::OnChange {
                    threshold: ElementValue::U16(0x0110),
                },
            }],
        );
        let mock = Arc::new(MockDispatcher::new(&MockDispatcherConfig::default()));
        let engine = engine_over(&snapshot, &view, &[mock.clone()]);

        let report = engine.register_transmissions(&view).await;
        assert_eq!(report.registered, 1);
        assert_eq!(
            mock.sent_requests()[0],
            vec![0x2A, 0x03, 0x01, 0x00, 0x00, 0x00, 0x00, 0x02, 0x10, 0x01, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn wide_threshold_fails_without_a_wire_call() {
        let snapshot = snapshot(&["ecu0"]);
        let view = view(
            &[0],
            vec![RailEntry {
                element: ElementId::new(0, 0, 0, 0),
                rail: 0,
                mode: TransmissionMode::OnChange {
                    threshold: ElementValue::U64(0x1_0000_0000),
                },
            }],
        );
        let mock = Arc::new(MockDispatcher::new(&MockDispatcherConfig::default()));
        let engine = engine_over(&snapshot, &view, &[mock.clone()]);

        let report = engine.register_transmissions(&view).await;
        assert_eq!(report.attempted, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(mock.sent_requests().is_empty());
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_batch() {
        let snapshot = snapshot(&["ecu0", "ecu1"]);
        let view = view(&[0, 1], vec![cyclic(0, 0, 0), cyclic(1, 0, 0)]);
        let mocks = [
            Arc::new(MockDispatcher::new(&MockDispatcherConfig::default())),
            Arc::new(MockDispatcher::new(&MockDispatcherConfig::default())),
        ];
        mocks[0].push_response(vec![0x2A, 0x02], vec![0x7F, 0x2A, 0x33]);
        let engine = engine_over(&snapshot, &view, &mocks);

        let report = engine.register_transmissions(&view).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.registered, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, ElementId::new(0, 0, 0, 0));
        // ecu1 still received its registration
        assert_eq!(mocks[1].sent_requests().len(), 1);
    }

    #[tokio::test]
    async fn stop_continues_past_failures_and_aggregates() {
        let snapshot = snapshot(&["ecu0", "ecu1"]);
        let view = view(&[0, 1], vec![]);
        let mocks = [
            Arc::new(MockDispatcher::new(&MockDispatcherConfig::default())),
            Arc::new(MockDispatcher::new(&MockDispatcherConfig::default())),
        ];
        mocks[0].push_response(vec![0x2A, 0x04], vec![0x7F, 0x2A, 0x22]);
        let engine = engine_over(&snapshot, &view, &mocks);

        let err = engine.stop_transmissions().await.unwrap_err();
        match err {
            RailError::StopIncomplete { nodes } => assert_eq!(nodes, vec!["ecu0".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mocks[1].sent_requests(), vec![vec![0x2A, 0x04]]);
    }
}
