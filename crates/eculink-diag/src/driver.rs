//! Diagnostic driver facade
//!
//! `DiagDriver` wires the session controller, rail engine, polling engine,
//! signal dispatch and the per-node data dealers together and owns the
//! cycling task: the background loop that keeps sessions alive, advances
//! every protocol handle and moves incoming traffic to its consumers.
//!
//! Lifecycle: `init_diag` → `set_diagnostic_mode` →
//! `set_up_cyclic_transmissions` → `start_cycling` → ... →
//! `stop_diagnosis_server`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use eculink_core::{
    ComError, ComResult, ElementId, ElementValue, NodeIndex, SystemSnapshot, ViewConfig,
};

use crate::config::DriverConfig;
use crate::dealer::DataDealer;
use crate::dispatch::{ConsumerId, SignalDispatch, SignalRegistration, SignalSink};
use crate::polling::{PollError, PollOutput, PollRequest, PollScheduler, PollState};
use crate::rails::{RailEngine, RailError, RailRegistrationReport};
use crate::session::{SessionController, SessionError};
use crate::transport::BusDispatcher;
use crate::verify::{DatapoolVerifier, VerifyReport};

struct CyclingTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The diagnostic communication driver for one active view.
pub struct DiagDriver {
    config: DriverConfig,
    snapshot: SystemSnapshot,
    controller: Arc<SessionController>,
    /// Active-index aligned, one per active node.
    dealers: Vec<Arc<DataDealer>>,
    dispatch: Arc<SignalDispatch>,
    rails: RailEngine,
    poll: PollScheduler,
    cycling: Mutex<Option<CyclingTask>>,
}

impl DiagDriver {
    /// Build the driver for a view: plan and activate routing, create one
    /// protocol handle and data dealer per active node.
    ///
    /// `dispatchers` carries one transport binding per active node, in view
    /// order. A view without active nodes initializes empty and is not an
    /// error; session entry will refuse it later.
    pub async fn init_diag(
        snapshot: SystemSnapshot,
        view: &ViewConfig,
        config: DriverConfig,
        dispatchers: Vec<Arc<dyn BusDispatcher>>,
    ) -> ComResult<Self> {
        let controller = Arc::new(
            SessionController::new(&snapshot, view, &config, dispatchers)
                .map_err(com_error_from_session)?,
        );
        controller
            .activate_routing()
            .await
            .map_err(com_error_from_session)?;

        let dealers: Vec<Arc<DataDealer>> = controller
            .nodes()
            .iter()
            .map(|node| {
                let pools = snapshot
                    .node(node.node_index)
                    .map(|decl| decl.data_pools.clone())
                    .unwrap_or_default();
                Arc::new(DataDealer::new(Arc::clone(node), pools))
            })
            .collect();

        let dispatch = Arc::new(SignalDispatch::new(config.consumer_queue_depth));
        let rails = RailEngine::new(Arc::clone(&controller));
        let poll = PollScheduler::new(Arc::clone(&controller), dealers.clone(), &config);

        if controller.nodes().is_empty() {
            info!(view = %view.name, "View has no active nodes, driver initialized empty");
        } else {
            info!(view = %view.name, nodes = controller.nodes().len(), "Driver initialized");
        }
        Ok(Self {
            config,
            snapshot,
            controller,
            dealers,
            dispatch,
            rails,
            poll,
            cycling: Mutex::new(None),
        })
    }

    /// Bring every active node into diagnostic mode and verify all declared
    /// datapools against the devices.
    ///
    /// A subset of unreachable nodes yields a timeout-class error; the
    /// reachable nodes stay in diagnostic mode and the defect accessors
    /// name the rest.
    pub async fn set_diagnostic_mode(&self) -> ComResult<()> {
        self.controller
            .set_diagnostic_mode()
            .await
            .map_err(com_error_from_session)?;

        let report = self.verify_data_pools().await;
        match report.failure_summary() {
            None => Ok(()),
            Some(summary) => Err(ComError::Checksum(summary)),
        }
    }

    /// Check every reachable node's datapool metadata against the snapshot.
    pub async fn verify_data_pools(&self) -> VerifyReport {
        DatapoolVerifier::new(&self.controller, &self.snapshot)
            .verify_all()
            .await
    }

    /// Configure the three rail rates and register the view's rail table.
    pub async fn set_up_cyclic_transmissions(
        &self,
        view: &ViewConfig,
    ) -> ComResult<RailRegistrationReport> {
        self.rails
            .configure_rails(view.rail_rates_ms)
            .await
            .map_err(com_error_from_rail)?;
        Ok(self.rails.register_transmissions(view).await)
    }

    /// Stop every node's transmissions, best-effort across all nodes.
    pub async fn stop_cyclic_transmissions(&self) -> ComResult<()> {
        self.rails
            .stop_transmissions()
            .await
            .map_err(com_error_from_rail)
    }

    /// End the diagnostic session: stop cycling, stop transmissions, leave
    /// diagnostic mode, tear routing down, close the transports.
    pub async fn stop_diagnosis_server(&self) -> ComResult<()> {
        self.stop_cycling().await;

        // leave_diagnostic_mode stops transmissions before routing falls
        // away; the transports close only after both are done.
        let leave_result = self.controller.leave_diagnostic_mode().await;

        for dispatcher in self.unique_dispatchers() {
            if let Err(e) = dispatcher.close().await {
                warn!(error = %e, "Closing dispatcher failed");
            }
        }

        leave_result.map_err(com_error_from_session)
    }

    /// Start the cycling task.
    ///
    /// Each iteration sends the keepalive when due (skipping defect nodes),
    /// drains every node's pushed rail values into its dealer, moves raw
    /// frames into the signal dispatch and yields. Fails when cycling is
    /// already running.
    pub fn start_cycling(&self) -> ComResult<()> {
        let mut cycling = self.cycling.lock();
        if cycling.is_some() {
            return Err(ComError::Busy("cycling is already running".to_string()));
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut frame_rxs: Vec<broadcast::Receiver<crate::transport::BusFrame>> = self
            .unique_dispatchers()
            .iter()
            .map(|dispatcher| dispatcher.subscribe_frames())
            .collect();

        let controller = Arc::clone(&self.controller);
        let dealers = self.dealers.clone();
        let dispatch = Arc::clone(&self.dispatch);
        let tp_interval = Duration::from_millis(self.config.tester_present_interval_ms);
        let cycle_sleep = Duration::from_micros(self.config.cycle_sleep_us);

        let handle = tokio::spawn(async move {
            let mut last_keepalive: Option<Instant> = None;
            loop {
                if *stop_rx.borrow() {
                    break;
                }

                let keepalive_due = last_keepalive
                    .map(|at| at.elapsed() >= tp_interval)
                    .unwrap_or(true);
                if keepalive_due {
                    controller.send_tester_present().await;
                    last_keepalive = Some(Instant::now());
                }

                for (active_index, node) in controller.nodes().iter().enumerate() {
                    if controller.is_defect(active_index) {
                        continue;
                    }
                    for value in node.protocol.drain_rail_values() {
                        dealers[active_index].route_rail_value(&value);
                    }
                }

                for rx in &mut frame_rxs {
                    loop {
                        match rx.try_recv() {
                            Ok(frame) => dispatch.dispatch_frame(&frame),
                            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                                warn!(skipped, "Monitoring plane lagged, frames lost");
                            }
                            Err(_) => break,
                        }
                    }
                }

                tokio::time::sleep(cycle_sleep).await;
            }
            debug!("Cycling task stopped");
        });

        *cycling = Some(CyclingTask { stop_tx, handle });
        info!("Cycling started");
        Ok(())
    }

    /// Request the cycling task to stop and wait for it, bounded.
    ///
    /// On overrun the task is abandoned with a warning; teardown never
    /// blocks indefinitely on the cycle.
    pub async fn stop_cycling(&self) {
        let Some(task) = self.cycling.lock().take() else {
            return;
        };
        let _ = task.stop_tx.send(true);

        let wait = Duration::from_millis(self.config.shutdown_wait_ms);
        let mut handle = task.handle;
        match tokio::time::timeout(wait, &mut handle).await {
            Ok(_) => debug!("Cycling task joined"),
            Err(_) => {
                warn!(
                    wait_ms = self.config.shutdown_wait_ms,
                    "Cycling task did not stop in time, proceeding with teardown"
                );
                handle.abort();
            }
        }
    }

    pub fn is_cycling(&self) -> bool {
        self.cycling.lock().is_some()
    }

    // -------------------------------------------------------------------------
    // Polling surface
    // -------------------------------------------------------------------------

    pub fn poll_read_element(&self, id: ElementId) -> ComResult<Uuid> {
        self.start_poll(PollRequest::ReadElement(id))
    }

    pub fn poll_write_element(&self, id: ElementId, value: ElementValue) -> ComResult<Uuid> {
        self.start_poll(PollRequest::WriteElement(id, value))
    }

    pub fn poll_read_nvm(&self, id: ElementId) -> ComResult<Uuid> {
        self.start_poll(PollRequest::ReadNvm(id))
    }

    pub fn poll_write_nvm(&self, id: ElementId, value: ElementValue) -> ComResult<Uuid> {
        self.start_poll(PollRequest::WriteNvm(id, value))
    }

    pub fn poll_read_nvm_list(&self, node: NodeIndex, data_pool: u32, list: u32) -> ComResult<Uuid> {
        self.start_poll(PollRequest::ReadNvmList {
            node,
            data_pool,
            list,
        })
    }

    pub fn poll_safe_write_changed_values(
        &self,
        node: NodeIndex,
        changes: Vec<(ElementId, ElementValue)>,
    ) -> ComResult<Uuid> {
        self.start_poll(PollRequest::SafeWriteChangedValues { node, changes })
    }

    pub fn poll_safe_read(&self, node: NodeIndex, data_pool: u32) -> ComResult<Uuid> {
        self.start_poll(PollRequest::SafeRead { node, data_pool })
    }

    pub fn poll_safe_write_crcs(&self, node: NodeIndex) -> ComResult<Uuid> {
        self.start_poll(PollRequest::SafeWriteCrcs { node })
    }

    pub fn poll_notify_nvm_written(&self, node: NodeIndex) -> ComResult<Uuid> {
        self.start_poll(PollRequest::NotifyNvmWritten { node })
    }

    fn start_poll(&self, request: PollRequest) -> ComResult<Uuid> {
        self.poll.start(request).map_err(com_error_from_poll)
    }

    pub fn poll_state(&self) -> PollState {
        self.poll.state()
    }

    /// Receiver observing each completed poll request's id.
    pub fn subscribe_poll_completion(&self) -> watch::Receiver<Option<Uuid>> {
        self.poll.subscribe_completion()
    }

    /// Finished request's result; readable exactly once.
    pub fn take_poll_result(&self) -> Result<ComResult<PollOutput>, PollError> {
        self.poll.take_result()
    }

    /// Finished request's negative-response code; readable exactly once.
    pub fn take_poll_result_nrc(&self) -> Result<Option<u8>, PollError> {
        self.poll.take_result_nrc()
    }

    /// Re-arm the poll slot after both results were read.
    pub fn accept_next_poll_request(&self) -> Result<(), PollError> {
        self.poll.accept_next_request()
    }

    // -------------------------------------------------------------------------
    // Consumer and dealer surface
    // -------------------------------------------------------------------------

    /// Register a display consumer with its CAN signal list.
    pub fn register_consumer(
        &self,
        registrations: Vec<SignalRegistration>,
        sink: Arc<dyn SignalSink>,
    ) -> ConsumerId {
        self.dispatch.register_consumer(registrations, sink)
    }

    pub fn unregister_consumer(&self, id: ConsumerId) -> bool {
        self.dispatch.unregister_consumer(id)
    }

    /// All data dealers, active-index aligned.
    pub fn data_dealers(&self) -> &[Arc<DataDealer>] {
        &self.dealers
    }

    /// Dealer of one node, looked up by global node index.
    pub fn data_dealer(&self, node: NodeIndex) -> Option<&Arc<DataDealer>> {
        self.controller
            .active_index_of(node)
            .and_then(|active_index| self.dealers.get(active_index))
    }

    /// Active indices of nodes that failed session entry.
    pub fn defect_node_indices(&self) -> Vec<usize> {
        self.controller.defect_active_indices()
    }

    pub fn defect_node_names(&self) -> Vec<String> {
        self.controller.defect_node_names()
    }

    fn unique_dispatchers(&self) -> Vec<Arc<dyn BusDispatcher>> {
        let mut unique: Vec<Arc<dyn BusDispatcher>> = Vec::new();
        for node in self.controller.nodes() {
            let dispatcher = node.protocol.dispatcher();
            if !unique.iter().any(|seen| Arc::ptr_eq(seen, dispatcher)) {
                unique.push(Arc::clone(dispatcher));
            }
        }
        unique
    }
}

fn com_error_from_session(error: SessionError) -> ComError {
    match error {
        SessionError::NoActiveNodes => ComError::NoActiveNodes,
        SessionError::Routing(e) => ComError::Routing(e),
        SessionError::BindingMismatch { .. } | SessionError::BusIndexRange(_) => {
            ComError::Config(error.to_string())
        }
        SessionError::ActivationFailed { .. } => ComError::BusInit(error.to_string()),
        SessionError::NodesUnreachable {
            ref names,
            timed_out,
        } => {
            if timed_out {
                ComError::Timeout(format!("nodes unreachable: {}", names.join(", ")))
            } else {
                ComError::Transport(error.to_string())
            }
        }
        SessionError::TeardownIncomplete(detail) => ComError::Transport(detail),
    }
}

fn com_error_from_rail(error: RailError) -> ComError {
    match error {
        RailError::RateRange { .. } => ComError::Config(error.to_string()),
        RailError::RateRejected { .. } | RailError::StopIncomplete { .. } => {
            ComError::Transport(error.to_string())
        }
    }
}

fn com_error_from_poll(error: PollError) -> ComError {
    match error {
        PollError::Busy => ComError::Busy(error.to_string()),
        PollError::NodeNotActive(_) => ComError::Config(error.to_string()),
        PollError::NoResult | PollError::AlreadyTaken => ComError::Internal(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockDispatcherConfig;
    use crate::transport::mock::MockDispatcher;
    use eculink_core::{
        BusDecl, BusKind, DataPoolDecl, ElementDecl, InterfaceDecl, ListDecl, NodeDecl,
        ProtocolKind, TimestampedValue, ValueType,
    };
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingSink {
        values: Mutex<Vec<(ElementId, TimestampedValue)>>,
    }

    impl RecordingSink {
        fn take_values(&self) -> Vec<(ElementId, TimestampedValue)> {
            std::mem::take(&mut *self.values.lock())
        }
    }

    impl SignalSink for RecordingSink {
        fn insert_new_value(&self, element: &ElementId, value: TimestampedValue) {
            self.values.lock().push((*element, value));
        }

        fn set_dlc_error(&self, _element: &ElementId, _dlc: u8) {}
    }

    fn node(name: &str) -> NodeDecl {
        NodeDecl {
            name: name.into(),
            protocol: ProtocolKind::OpenSyde,
            interfaces: vec![InterfaceDecl {
                bus: 0,
                node_id: 1,
                is_diag_capable: true,
                is_routing_capable: false,
            }],
            data_pools: vec![DataPoolDecl {
                name: "APPL".into(),
                version: [1, 0, 0],
                definition_crc: 0x1111_2222,
                lists: vec![ListDecl {
                    name: "VALUES".into(),
                    crc_supported: false,
                    nvm_start_address: None,
                    elements: vec![ElementDecl {
                        name: "speed".into(),
                        value_type: ValueType::U16,
                        nvm_offset: None,
                    }],
                }],
            }],
            security_level: 1,
        }
    }

    fn snapshot(names: &[&str]) -> SystemSnapshot {
        SystemSnapshot {
            nodes: names.iter().map(|n| node(n)).collect(),
            buses: vec![BusDecl {
                name: "CAN_MAIN".into(),
                kind: BusKind::Can,
                bitrate: Some(500_000),
            }],
            client_bus: 0,
        }
    }

    fn view(active: &[NodeIndex]) -> ViewConfig {
        ViewConfig {
            name: "dash".into(),
            active_nodes: active.to_vec(),
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

    fn meta_ok() -> Vec<u8> {
        let mut response = vec![0xFA, 0x00, 0x01, 0x00, 0x00, 0x11, 0x11, 0x22, 0x22, 0x04];
        response.extend_from_slice(b"APPL");
        response
    }

    #[tokio::test]
    async fn empty_view_initializes_but_refuses_session_entry() {
        let driver = DiagDriver::init_diag(
            snapshot(&[]),
            &view(&[]),
            DriverConfig::default(),
            vec![],
        )
        .await
        .unwrap();

        let err = driver.set_diagnostic_mode().await.unwrap_err();
        assert!(matches!(err, ComError::NoActiveNodes));
    }

    #[tokio::test]
    async fn unreachable_node_yields_timeout_with_defect_bookkeeping() {
        let snapshot = snapshot(&["ecu0", "ecu1", "ecu2"]);
        let (mocks, bindings) = mocks(3);
        for mock in &mocks {
            mock.push_response(vec![0xBA, 0x00], meta_ok());
        }
        mocks[1].set_silent(true);
        let driver = DiagDriver::init_diag(
            snapshot,
            &view(&[0, 1, 2]),
            DriverConfig::default(),
            bindings,
        )
        .await
        .unwrap();

        let err = driver.set_diagnostic_mode().await.unwrap_err();
        assert!(matches!(err, ComError::Timeout(_)));
        assert_eq!(driver.defect_node_indices(), vec![1]);
        assert_eq!(driver.defect_node_names(), vec!["ecu1".to_string()]);

        // the reachable neighbors made it into the extended session
        assert_eq!(mocks[0].sent_requests()[0], vec![0x10, 0x03]);
        assert_eq!(mocks[2].sent_requests()[0], vec![0x10, 0x03]);
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_session_entry() {
        let snapshot = snapshot(&["ecu0"]);
        let (mocks, bindings) = mocks(1);
        let mut bad_meta = meta_ok();
        bad_meta[8] = 0x23; // flip one checksum byte
        mocks[0].push_response(vec![0xBA, 0x00], bad_meta);
        let driver =
            DiagDriver::init_diag(snapshot, &view(&[0]), DriverConfig::default(), bindings)
                .await
                .unwrap();

        let err = driver.set_diagnostic_mode().await.unwrap_err();
        match err {
            ComError::Checksum(summary) => assert!(summary.contains("checksum mismatch")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cycling_sends_keepalive_and_routes_rail_values() {
        let snapshot = snapshot(&["ecu0"]);
        let (mocks, bindings) = mocks(1);
        mocks[0].push_response(vec![0xBA, 0x00], meta_ok());
        let config = DriverConfig {
            cycle_sleep_us: 100,
            ..DriverConfig::default()
        };
        let driver = DiagDriver::init_diag(snapshot, &view(&[0]), config, bindings)
            .await
            .unwrap();
        driver.set_diagnostic_mode().await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        driver.data_dealer(0).unwrap().subscribe(
            ElementId::new(0, 0, 0, 0),
            sink.clone() as Arc<dyn SignalSink>,
        );

        driver.start_cycling().unwrap();
        assert!(driver.is_cycling());
        assert!(driver.start_cycling().is_err());

        // an asynchronous rail push for datapool 0 / list 0 / element 0
        mocks[0].inject_event(vec![0xEA, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xA4]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let delivered = sink.take_values();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.value, ElementValue::U16(420));

        // keepalive went out at least once, suppressed positive response
        assert!(mocks[0]
            .sent_requests()
            .iter()
            .any(|r| r == &vec![0x3E, 0x80]));

        driver.stop_cycling().await;
        assert!(!driver.is_cycling());
    }

    #[tokio::test]
    async fn poll_family_round_trips_through_the_facade() {
        let snapshot = snapshot(&["ecu0"]);
        let (mocks, bindings) = mocks(1);
        mocks[0].push_response(
            vec![0x22],
            vec![0x62, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A],
        );
        let driver =
            DiagDriver::init_diag(snapshot, &view(&[0]), DriverConfig::default(), bindings)
                .await
                .unwrap();

        let mut completion = driver.subscribe_poll_completion();
        driver.poll_read_element(ElementId::new(0, 0, 0, 0)).unwrap();
        while driver.poll_state() != PollState::Finished {
            completion.changed().await.unwrap();
        }

        let result = driver.take_poll_result().unwrap().unwrap();
        assert_eq!(result, PollOutput::Value(ElementValue::U16(42)));
        assert_eq!(driver.take_poll_result_nrc().unwrap(), None);
        driver.accept_next_poll_request().unwrap();

        // unknown node index fails without touching the slot
        let err = driver.poll_read_element(ElementId::new(5, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, ComError::Config(_)));
        assert_eq!(driver.poll_state(), PollState::Idle);
    }

    #[tokio::test]
    async fn teardown_stops_transmissions_before_closing_transports() {
        let snapshot = snapshot(&["ecu0"]);
        let (mocks, bindings) = mocks(1);
        mocks[0].push_response(vec![0xBA, 0x00], meta_ok());
        let driver =
            DiagDriver::init_diag(snapshot, &view(&[0]), DriverConfig::default(), bindings)
                .await
                .unwrap();
        driver.set_diagnostic_mode().await.unwrap();
        driver.start_cycling().unwrap();

        driver.stop_diagnosis_server().await.unwrap();

        let sent = mocks[0].sent_requests();
        let stop_pos = sent
            .iter()
            .position(|r| r.starts_with(&[0x2A, 0x04]))
            .expect("stop-all was sent");
        let default_session_pos = sent
            .iter()
            .position(|r| r == &vec![0x10, 0x01])
            .expect("default session was requested");
        assert!(stop_pos < default_session_pos);
        assert!(!mocks[0].is_open().await);
    }
}
