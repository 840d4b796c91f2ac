//! Diagnostic session control across the active view
//!
//! This module owns everything between "dispatchers exist" and "nodes answer
//! diagnostic requests": route activation through bridge nodes, session and
//! security handshakes per protocol, the keepalive, and the defect-node
//! bookkeeping that keeps one dead ECU from taking the session down.

mod controller;

pub use controller::{ActiveNode, SessionController, SessionError};
