//! eculink-diag - Diagnostic communication driver core
//!
//! This crate implements the driver a tool instance runs against one
//! active view of the system: session handling, cyclic/event rail
//! registration, one-shot polled operations and realtime CAN signal
//! dispatch, all over per-node bus dispatchers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         DiagDriver                           │
//! │  Facade + cycling task (keepalive, rail drain, dispatch)     │
//! │                                                              │
//! │  ┌───────────────┐ ┌────────────┐ ┌────────────────────────┐ │
//! │  │SessionControl │ │ RailEngine │ │ PollScheduler (1 slot) │ │
//! │  │ (defect list) │ │ (reports)  │ │                        │ │
//! │  └───────┬───────┘ └─────┬──────┘ └───────────┬────────────┘ │
//! │          │               │                    │              │
//! │          │         ┌─────┴──────┐      ┌──────┴─────┐        │
//! │          └─────────┤NodeProtocol├──────┤ DataDealer │        │
//! │                    │(per node)  │      │ (per node) │        │
//! │                    └─────┬──────┘      └──────┬─────┘        │
//! │                          │                    │              │
//! │                 ┌────────┴────────┐   ┌───────┴────────┐     │
//! │                 │ BusDispatcher   │   │ SignalDispatch │     │
//! │                 │ (CAN/TCP/mock)  │   │ (raw frames)   │     │
//! │                 └─────────────────┘   └────────────────┘     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod content_conv;
pub mod dealer;
pub mod dispatch;
pub mod driver;
pub mod polling;
pub mod protocol;
pub mod rails;
pub mod session;
pub mod transport;
pub mod verify;

pub use config::{
    DriverConfig, MockDispatcherConfig, SocketCanDispatcherConfig, TcpDispatcherConfig,
    TransportConfig,
};
pub use dealer::{DataDealer, NvmListImage, NvmNotification};
pub use dispatch::{ConsumerId, SignalDispatch, SignalRegistration, SignalSink};
pub use driver::DiagDriver;
pub use polling::{PollError, PollOutput, PollRequest, PollScheduler, PollState};
pub use protocol::{NegativeResponseCode, NodeProtocol, ProtocolError};
pub use rails::{NodeRailReport, RailEngine, RailError, RailRegistrationReport};
pub use session::{ActiveNode, SessionController, SessionError};
pub use transport::{
    create_dispatcher, BusDispatcher, BusFrame, DispatcherKind, ServiceEvent, TransportError,
};
pub use verify::{DataPoolCheck, DatapoolVerifier, NodeVerifyReport, VerifyReport};

// Re-export for convenience
pub use eculink_core::{
    ComError, ComResult, ElementId, ElementValue, SystemSnapshot, TimestampedValue, ViewConfig,
};
