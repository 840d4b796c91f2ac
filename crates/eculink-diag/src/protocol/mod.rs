//! Diagnostic protocol layer
//!
//! This module implements the per-node request/response protocols. Every
//! active node gets exactly one [`NodeProtocol`] wrapping its bus
//! dispatcher: openSYDE-style nodes speak the full element/rail/NVM
//! service set, legacy nodes only logon, logoff and tester present.

mod error;
mod legacy;
mod nrc;
mod opensyde;

pub use error::ProtocolError;
pub use legacy::{LegacyProtocol, LogonInfo};
pub use nrc::NegativeResponseCode;
pub use opensyde::OpenSydeProtocol;

use std::sync::Arc;

use eculink_core::{ElementId, NodeIndex, ProtocolKind};

use crate::transport::BusDispatcher;

/// Diagnostic service id constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const READ_ELEMENT: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const RAIL_CONTROL: u8 = 0x2A;
    pub const WRITE_ELEMENT: u8 = 0x2E;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    pub const LEGACY_LOGON: u8 = 0xB0;
    pub const LEGACY_LOGOFF: u8 = 0xB1;
    pub const ROUTING_ACTIVATE: u8 = 0xB8;
    pub const ROUTING_DEACTIVATE: u8 = 0xB9;
    pub const DATA_POOL_META: u8 = 0xBA;
    pub const NVM_WRITE_NOTIFY: u8 = 0xBC;
    /// Unsolicited rail value push (no request counterpart).
    pub const RAIL_EVENT: u8 = 0xEA;
}

/// Rail control (0x2A) sub-functions
pub mod rail_sub_function {
    /// Set the transmission interval of one rail
    pub const SET_RATE: u8 = 0x01;
    /// Register an element for cyclic transmission
    pub const REGISTER_CYCLIC: u8 = 0x02;
    /// Register an element for change-driven transmission
    pub const REGISTER_ON_CHANGE: u8 = 0x03;
    /// Stop every transmission on the node
    pub const STOP_ALL: u8 = 0x04;
}

/// Diagnostic session identifiers (0x10 sub-functions)
pub mod session_kind {
    pub const DEFAULT: u8 = 0x01;
    pub const EXTENDED: u8 = 0x03;
}

/// Element address in service wire form.
///
/// The service payloads carry the (data pool, list, element) triple as
/// five bytes: one byte pool index, two bytes each for list and element,
/// big endian. The node index never goes on the wire; requests already
/// travel over the node's own dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedElement {
    pub data_pool: u8,
    pub list: u16,
    pub element: u16,
}

impl PackedElement {
    pub const WIRE_LEN: usize = 5;

    /// Pack an element id, rejecting indices the wire form cannot carry.
    pub fn try_from_id(id: &ElementId) -> Result<Self, ProtocolError> {
        if id.data_pool > u8::MAX as u32 || id.list > u16::MAX as u32 || id.element > u16::MAX as u32
        {
            return Err(ProtocolError::AddressRange(format!(
                "element {} exceeds wire address space",
                id
            )));
        }
        Ok(Self {
            data_pool: id.data_pool as u8,
            list: id.list as u16,
            element: id.element as u16,
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.data_pool);
        out.extend_from_slice(&self.list.to_be_bytes());
        out.extend_from_slice(&self.element.to_be_bytes());
    }

    /// Parse the packed triple from the front of `bytes`, returning the rest.
    pub fn parse(bytes: &[u8]) -> Option<(Self, &[u8])> {
        if bytes.len() < Self::WIRE_LEN {
            return None;
        }
        let packed = Self {
            data_pool: bytes[0],
            list: u16::from_be_bytes([bytes[1], bytes[2]]),
            element: u16::from_be_bytes([bytes[3], bytes[4]]),
        };
        Some((packed, &bytes[Self::WIRE_LEN..]))
    }

    /// Expand back to a full element id on the given node.
    pub fn to_element_id(&self, node: NodeIndex) -> ElementId {
        ElementId::new(
            node,
            self.data_pool as u32,
            self.list as u32,
            self.element as u32,
        )
    }
}

/// One rail value as pushed by a node.
#[derive(Debug, Clone)]
pub struct RailValue {
    pub address: PackedElement,
    /// Raw value bytes, big endian, as stored on the node.
    pub raw: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Data pool metadata as reported by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoolMeta {
    pub version: [u8; 3],
    pub definition_crc: u32,
    pub name: String,
}

/// Protocol instance for one active node.
///
/// Closed set of variants; the capability gap between them is part of the
/// contract, so unsupported operations fail with
/// [`ProtocolError::Unsupported`] instead of hiding behind a trait object.
pub enum NodeProtocol {
    OpenSyde(OpenSydeProtocol),
    Legacy(LegacyProtocol),
}

impl NodeProtocol {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::OpenSyde(_) => ProtocolKind::OpenSyde,
            Self::Legacy(_) => ProtocolKind::Legacy,
        }
    }

    /// Transport this node is reached over.
    pub fn dispatcher(&self) -> &Arc<dyn BusDispatcher> {
        match self {
            Self::OpenSyde(p) => p.dispatcher(),
            Self::Legacy(p) => p.dispatcher(),
        }
    }

    /// Bring the node into diagnostic mode.
    pub async fn enter_diagnostic(&self) -> Result<(), ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.enter_diagnostic().await,
            Self::Legacy(p) => p.logon().await,
        }
    }

    /// Leave diagnostic mode. For legacy nodes this is the logoff.
    pub async fn leave_diagnostic(&self) -> Result<(), ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.return_to_default_session().await,
            Self::Legacy(p) => p.logoff().await,
        }
    }

    pub async fn tester_present(&self) -> Result<(), ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.tester_present().await,
            Self::Legacy(p) => p.tester_present().await,
        }
    }

    pub async fn set_rail_rate(&self, rail: u8, interval_ms: u16) -> Result<(), ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.set_rail_rate(rail, interval_ms).await,
            Self::Legacy(_) => Err(ProtocolError::Unsupported("rail control".to_string())),
        }
    }

    pub async fn register_cyclic(&self, rail: u8, element: &ElementId) -> Result<(), ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.register_cyclic(rail, element).await,
            Self::Legacy(_) => Err(ProtocolError::Unsupported("rail control".to_string())),
        }
    }

    pub async fn register_on_change(
        &self,
        rail: u8,
        element: &ElementId,
        threshold_le: [u8; 4],
    ) -> Result<(), ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.register_on_change(rail, element, threshold_le).await,
            Self::Legacy(_) => Err(ProtocolError::Unsupported("rail control".to_string())),
        }
    }

    pub async fn stop_all_transmissions(&self) -> Result<(), ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.stop_all_transmissions().await,
            // Legacy nodes never had transmissions running
            Self::Legacy(_) => Ok(()),
        }
    }

    pub async fn read_element(&self, element: &ElementId) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.read_element(element).await,
            Self::Legacy(_) => Err(ProtocolError::Unsupported("element read".to_string())),
        }
    }

    pub async fn write_element(
        &self,
        element: &ElementId,
        raw: &[u8],
    ) -> Result<(), ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.write_element(element, raw).await,
            Self::Legacy(_) => Err(ProtocolError::Unsupported("element write".to_string())),
        }
    }

    pub async fn read_memory(&self, address: u32, len: u16) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.read_memory(address, len).await,
            Self::Legacy(_) => Err(ProtocolError::Unsupported("NVM read".to_string())),
        }
    }

    pub async fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.write_memory(address, data).await,
            Self::Legacy(_) => Err(ProtocolError::Unsupported("NVM write".to_string())),
        }
    }

    pub async fn data_pool_meta(&self, data_pool: u8) -> Result<DataPoolMeta, ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.data_pool_meta(data_pool).await,
            Self::Legacy(_) => Err(ProtocolError::Unsupported("data pool metadata".to_string())),
        }
    }

    pub async fn notify_nvm_written(
        &self,
        data_pool: u8,
        list: u16,
    ) -> Result<bool, ProtocolError> {
        match self {
            Self::OpenSyde(p) => p.notify_nvm_written(data_pool, list).await,
            Self::Legacy(_) => Err(ProtocolError::Unsupported("NVM notification".to_string())),
        }
    }

    /// Drain rail values pushed since the last call. Legacy nodes push nothing.
    pub fn drain_rail_values(&self) -> Vec<RailValue> {
        match self {
            Self::OpenSyde(p) => p.drain_rail_values(),
            Self::Legacy(_) => Vec::new(),
        }
    }
}

/// Map a protocol failure into the driver-wide error taxonomy, naming the
/// node the request went to.
pub(crate) fn com_error_for_node(node: &str, error: ProtocolError) -> eculink_core::ComError {
    use eculink_core::ComError;
    match error {
        ProtocolError::NegativeResponse { service_id, nrc } => ComError::NegativeResponse {
            nrc: nrc.into(),
            service: service_id,
            node: node.to_string(),
        },
        ProtocolError::Timeout => ComError::Timeout(format!("no response from '{}'", node)),
        ProtocolError::AddressRange(detail) => ComError::Config(detail),
        ProtocolError::Unsupported(what) => {
            ComError::Config(format!("'{}' does not support {}", node, what))
        }
        other => ComError::Transport(format!("'{}': {}", node, other)),
    }
}
