//! System and view configuration snapshots
//!
//! The driver never reaches into a live project model: the topology/view
//! layer hands it an immutable [`SystemSnapshot`] plus a [`ViewConfig`] at
//! initialization and the driver reads them for the session's lifetime.

use serde::{Deserialize, Serialize};

use crate::element::{ElementId, ElementValue, ValueType};

pub type NodeIndex = u32;
pub type BusIndex = u32;

/// Immutable description of the system the driver talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub nodes: Vec<NodeDecl>,
    pub buses: Vec<BusDecl>,
    /// Bus segment the diagnostic client itself is attached to.
    pub client_bus: BusIndex,
}

impl SystemSnapshot {
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn node(&self, index: NodeIndex) -> Option<&NodeDecl> {
        self.nodes.get(index as usize)
    }

    pub fn bus(&self, index: BusIndex) -> Option<&BusDecl> {
        self.buses.get(index as usize)
    }

    /// Node name for error reports; falls back to the numeric index for
    /// indices outside the snapshot.
    pub fn node_name(&self, index: NodeIndex) -> String {
        match self.node(index) {
            Some(node) => node.name.clone(),
            None => format!("node {}", index),
        }
    }
}

/// One bus segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusDecl {
    pub name: String,
    pub kind: BusKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Can,
    Ethernet,
}

/// Diagnostic protocol variant a node speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    OpenSyde,
    Legacy,
}

/// One node in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDecl {
    pub name: String,
    #[serde(default)]
    pub protocol: ProtocolKind,
    pub interfaces: Vec<InterfaceDecl>,
    #[serde(default)]
    pub data_pools: Vec<DataPoolDecl>,
    /// Security level required for the extended diagnostic session.
    #[serde(default = "default_security_level")]
    pub security_level: u8,
}

fn default_security_level() -> u8 {
    1
}

impl NodeDecl {
    /// Interface attached to the given bus, if any.
    pub fn interface_on(&self, bus: BusIndex) -> Option<&InterfaceDecl> {
        self.interfaces.iter().find(|itf| itf.bus == bus)
    }
}

/// Attachment of a node to a bus segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceDecl {
    pub bus: BusIndex,
    /// Bus-local node address.
    pub node_id: u8,
    #[serde(default = "default_true")]
    pub is_diag_capable: bool,
    /// Whether the node can bridge traffic between its interfaces.
    #[serde(default)]
    pub is_routing_capable: bool,
}

fn default_true() -> bool {
    true
}

/// Declared datapool metadata, compared against the live device before
/// diagnostics start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoolDecl {
    pub name: String,
    pub version: [u8; 3],
    /// Checksum over the datapool definition.
    pub definition_crc: u32,
    #[serde(default)]
    pub lists: Vec<ListDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDecl {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<ElementDecl>,
    /// Whether the device keeps a CRC over this list in NVM.
    #[serde(default)]
    pub crc_supported: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nvm_start_address: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDecl {
    pub name: String,
    pub value_type: ValueType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nvm_offset: Option<u32>,
}

// =============================================================================
// View configuration (read-rail assignment table)
// =============================================================================

/// Per-view driver input: which nodes participate, the three rail rates and
/// the ordered element-to-rail assignment table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    pub name: String,
    /// Global node indices participating in the session. Position in this
    /// list is the session-local "active index".
    pub active_nodes: Vec<NodeIndex>,
    /// Fast/medium/slow rail update rates in milliseconds.
    #[serde(default = "default_rail_rates")]
    pub rail_rates_ms: [u32; 3],
    /// Ordered registration table; registration order is observable through
    /// failure ordinals and must be stable.
    #[serde(default)]
    pub elements: Vec<RailEntry>,
}

fn default_rail_rates() -> [u32; 3] {
    [100, 500, 1000]
}

impl ViewConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Session-local active index of a global node index.
    pub fn active_index_of(&self, node: NodeIndex) -> Option<usize> {
        self.active_nodes.iter().position(|&n| n == node)
    }
}

/// One row of the read-rail assignment table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailEntry {
    pub element: ElementId,
    /// Rail index 0 (fast), 1 (medium) or 2 (slow).
    pub rail: u8,
    pub mode: TransmissionMode,
}

/// How a registered element is pushed by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransmissionMode {
    /// Device pushes the value on every rail tick.
    Cyclic,
    /// Device pushes only when the value moved by at least `threshold`.
    OnChange { threshold: ElementValue },
    /// No device-side registration; serviced on demand through the dealer.
    OnTrigger,
}

// =============================================================================
// CAN message/signal descriptors (consumer registrations)
// =============================================================================

/// Message-level frame expectations carried by a signal registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanMessageRef {
    pub can_id: u32,
    #[serde(default)]
    pub extended: bool,
    pub dlc: u8,
}

/// Bit layout order of a CAN signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Little-endian bit counting.
    #[default]
    Intel,
    /// Big-endian bit counting.
    Motorola,
}

/// Bit-level description of one CAN signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanSignalDecl {
    pub start_bit: u16,
    pub bit_length: u16,
    #[serde(default)]
    pub byte_order: ByteOrder,
    pub value_type: ValueType,
    /// Selector value when this signal is part of a multiplexed group.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mux_value: Option<u16>,
}

impl CanSignalDecl {
    /// Highest byte index (exclusive) the signal touches; used to confirm
    /// a received DLC actually covers the signal.
    pub fn last_byte_excl(&self) -> usize {
        match self.byte_order {
            ByteOrder::Intel => {
                (self.start_bit as usize + self.bit_length as usize).div_ceil(8)
            }
            ByteOrder::Motorola => {
                // Motorola counts the MSB first; going down within the start
                // byte then forward through the following bytes.
                let start_byte = self.start_bit as usize / 8;
                let bit_in_byte = 7 - (self.start_bit as usize % 8);
                let bits_after_start = self.bit_length as usize + bit_in_byte;
                start_byte + bits_after_start.div_ceil(8)
            }
        }
    }
}
