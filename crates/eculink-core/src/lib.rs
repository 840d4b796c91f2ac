//! eculink-core - Core models and error taxonomy for the eculink driver
//!
//! This crate provides the shared vocabulary of the diagnostic driver:
//! element identity, typed value content, the immutable system snapshot
//! consumed from the topology/view layer, route planning, and the COM-class
//! error taxonomy every batch operation reports in.

pub mod element;
pub mod error;
pub mod routing;
pub mod topology;

pub use element::{ContentError, ElementId, ElementValue, TimestampedValue, ValueType};
pub use error::{ComError, ComResult};
pub use routing::{BridgeKind, Route, RouteCalculator, RouteHop, RoutingError};
pub use topology::{
    BusDecl, BusIndex, BusKind, ByteOrder, CanMessageRef, CanSignalDecl, DataPoolDecl,
    ElementDecl, InterfaceDecl, ListDecl, NodeDecl, NodeIndex, ProtocolKind, RailEntry,
    SystemSnapshot, TransmissionMode, ViewConfig,
};
