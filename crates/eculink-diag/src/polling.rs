//! Single-slot polling engine for blocking datapool/NVM operations
//!
//! One request slot, three states: Idle, Busy, Finished. A request runs on
//! a spawned task against its node's data dealer and signals completion on
//! a watch channel. Results follow a two-phase protocol: the result and the
//! negative-response code are each readable exactly once, and the slot only
//! re-arms after an explicit [`accept_next_request`](PollScheduler::accept_next_request).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use eculink_core::{ComError, ComResult, ElementId, ElementValue, NodeIndex};

use crate::config::DriverConfig;
use crate::dealer::{DataDealer, NvmListImage, NvmNotification};
use crate::session::SessionController;

/// One blocking operation the engine can execute.
#[derive(Debug, Clone)]
pub enum PollRequest {
    ReadElement(ElementId),
    WriteElement(ElementId, ElementValue),
    ReadNvm(ElementId),
    WriteNvm(ElementId, ElementValue),
    ReadNvmList {
        node: NodeIndex,
        data_pool: u32,
        list: u32,
    },
    /// Write changed values, to be followed by the CRC and notification
    /// passes.
    SafeWriteChangedValues {
        node: NodeIndex,
        changes: Vec<(ElementId, ElementValue)>,
    },
    /// Read every NVM-backed list of a datapool with CRC verification.
    SafeRead { node: NodeIndex, data_pool: u32 },
    /// Recompute and store the CRCs of every list touched by safe writes.
    SafeWriteCrcs { node: NodeIndex },
    NotifyNvmWritten { node: NodeIndex },
}

impl PollRequest {
    /// Global index of the node this request targets.
    pub fn node_index(&self) -> NodeIndex {
        match self {
            Self::ReadElement(id)
            | Self::WriteElement(id, _)
            | Self::ReadNvm(id)
            | Self::WriteNvm(id, _) => id.node,
            Self::ReadNvmList { node, .. }
            | Self::SafeWriteChangedValues { node, .. }
            | Self::SafeRead { node, .. }
            | Self::SafeWriteCrcs { node }
            | Self::NotifyNvmWritten { node } => *node,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ReadElement(_) => "read element",
            Self::WriteElement(..) => "write element",
            Self::ReadNvm(_) => "read NVM",
            Self::WriteNvm(..) => "write NVM",
            Self::ReadNvmList { .. } => "read NVM list",
            Self::SafeWriteChangedValues { .. } => "safe write changed values",
            Self::SafeRead { .. } => "safe read",
            Self::SafeWriteCrcs { .. } => "safe write CRCs",
            Self::NotifyNvmWritten { .. } => "notify NVM written",
        }
    }
}

/// Payload of a successfully completed request.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutput {
    Value(ElementValue),
    Written,
    List(NvmListImage),
    Lists(Vec<NvmListImage>),
    WrittenElements(Vec<ElementId>),
    Notifications(Vec<NvmNotification>),
}

/// Observable state of the request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Busy,
    /// Completed; results pending retrieval and acceptance.
    Finished,
}

/// Polling engine errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PollError {
    /// A request is in flight or finished but not yet accepted.
    #[error("a poll request is already occupying the slot")]
    Busy,

    #[error("node {0} is not part of the active view")]
    NodeNotActive(NodeIndex),

    #[error("no finished poll request to read from")]
    NoResult,

    /// The accessor was already consumed for this request.
    #[error("poll result already taken")]
    AlreadyTaken,
}

enum Slot {
    Idle,
    Busy {
        id: Uuid,
    },
    Finished {
        id: Uuid,
        result: Option<ComResult<PollOutput>>,
        nrc: Option<Option<u8>>,
    },
}

/// Mutually exclusive background executor for poll requests.
pub struct PollScheduler {
    controller: Arc<SessionController>,
    /// Active-index aligned, one per active node.
    dealers: Vec<Arc<DataDealer>>,
    slot: Arc<Mutex<Slot>>,
    completed_tx: watch::Sender<Option<Uuid>>,
    /// Overall deadline per request, over all wire exchanges it makes.
    poll_timeout: Duration,
}

impl PollScheduler {
    pub fn new(
        controller: Arc<SessionController>,
        dealers: Vec<Arc<DataDealer>>,
        config: &DriverConfig,
    ) -> Self {
        let (completed_tx, _) = watch::channel(None);
        Self {
            controller,
            dealers,
            slot: Arc::new(Mutex::new(Slot::Idle)),
            completed_tx,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
        }
    }

    pub fn state(&self) -> PollState {
        match *self.slot.lock() {
            Slot::Idle => PollState::Idle,
            Slot::Busy { .. } => PollState::Busy,
            Slot::Finished { .. } => PollState::Finished,
        }
    }

    /// Receiver that observes the id of each completed request.
    pub fn subscribe_completion(&self) -> watch::Receiver<Option<Uuid>> {
        self.completed_tx.subscribe()
    }

    /// Start one request. Fails with [`PollError::Busy`] while a request is
    /// in flight or finished-but-unaccepted; the in-flight request is never
    /// disturbed. An unresolved node index fails before any work starts.
    /// A request that outruns the configured poll deadline finishes the
    /// slot with a timeout result.
    pub fn start(&self, request: PollRequest) -> Result<Uuid, PollError> {
        let node_index = request.node_index();
        let active_index = self
            .controller
            .active_index_of(node_index)
            .ok_or(PollError::NodeNotActive(node_index))?;
        let dealer = Arc::clone(&self.dealers[active_index]);

        let id = {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Idle) {
                return Err(PollError::Busy);
            }
            let id = Uuid::new_v4();
            *slot = Slot::Busy { id };
            id
        };

        let kind = request.kind();
        debug!(id = %id, kind, node = %dealer.node_name(), "Poll request started");
        let slot = Arc::clone(&self.slot);
        let completed_tx = self.completed_tx.clone();
        let poll_timeout = self.poll_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(poll_timeout, execute(&dealer, request)).await
            {
                Ok(result) => result,
                Err(_) => Err(ComError::Timeout(format!(
                    "{} exceeded the poll deadline of {} ms",
                    kind,
                    poll_timeout.as_millis()
                ))),
            };
            let nrc = match &result {
                Err(ComError::NegativeResponse { nrc, .. }) => Some(*nrc),
                _ => None,
            };
            if let Err(e) = &result {
                warn!(id = %id, error = %e, "Poll request failed");
            }
            *slot.lock() = Slot::Finished {
                id,
                result: Some(result),
                nrc: Some(nrc),
            };
            let _ = completed_tx.send(Some(id));
        });
        Ok(id)
    }

    /// Retrieve the finished request's result. Readable exactly once.
    pub fn take_result(&self) -> Result<ComResult<PollOutput>, PollError> {
        match &mut *self.slot.lock() {
            Slot::Finished { result, .. } => result.take().ok_or(PollError::AlreadyTaken),
            _ => Err(PollError::NoResult),
        }
    }

    /// Retrieve the device negative-response code of the finished request,
    /// if it failed with one. Readable exactly once.
    pub fn take_result_nrc(&self) -> Result<Option<u8>, PollError> {
        match &mut *self.slot.lock() {
            Slot::Finished { nrc, .. } => nrc.take().ok_or(PollError::AlreadyTaken),
            _ => Err(PollError::NoResult),
        }
    }

    /// Re-arm the slot for the next request. Only legal once the current
    /// request has finished.
    pub fn accept_next_request(&self) -> Result<(), PollError> {
        let mut slot = self.slot.lock();
        match *slot {
            Slot::Finished { id, .. } => {
                debug!(id = %id, "Poll slot re-armed");
                *slot = Slot::Idle;
                Ok(())
            }
            _ => Err(PollError::NoResult),
        }
    }
}

async fn execute(dealer: &DataDealer, request: PollRequest) -> ComResult<PollOutput> {
    match request {
        PollRequest::ReadElement(id) => {
            dealer.read_element_value(&id).await.map(PollOutput::Value)
        }
        PollRequest::WriteElement(id, value) => dealer
            .write_element_value(&id, &value)
            .await
            .map(|()| PollOutput::Written),
        PollRequest::ReadNvm(id) => dealer.read_nvm_value(&id).await.map(PollOutput::Value),
        PollRequest::WriteNvm(id, value) => dealer
            .write_nvm_value(&id, &value)
            .await
            .map(|()| PollOutput::Written),
        PollRequest::ReadNvmList {
            data_pool, list, ..
        } => dealer
            .read_nvm_list(data_pool, list)
            .await
            .map(PollOutput::List),
        PollRequest::SafeWriteChangedValues { changes, .. } => dealer
            .safe_write_changed_values(&changes)
            .await
            .map(PollOutput::WrittenElements),
        PollRequest::SafeRead { data_pool, .. } => {
            dealer.safe_read(data_pool).await.map(PollOutput::Lists)
        }
        PollRequest::SafeWriteCrcs { .. } => {
            dealer.safe_write_crcs().await.map(|()| PollOutput::Written)
        }
        PollRequest::NotifyNvmWritten { .. } => dealer
            .notify_nvm_written()
            .await
            .map(PollOutput::Notifications),
    }
}
