//! Datapool metadata verification against the live devices
//!
//! Before diagnostics start, every declared datapool is checked against
//! what the node actually reports: name, 3-part version and definition
//! checksum are compared separately, and a datapool the device does not
//! know at all is its own condition. Verification never stops at the first
//! problem; the report lists every datapool of every node.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use eculink_core::{NodeIndex, ProtocolKind, SystemSnapshot};

use crate::protocol::{NegativeResponseCode, ProtocolError};
use crate::session::SessionController;

/// Outcome of checking one declared datapool against the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPoolCheck {
    Ok,
    NameMismatch {
        declared: String,
        device: String,
    },
    VersionMismatch {
        declared: [u8; 3],
        device: [u8; 3],
    },
    ChecksumMismatch {
        declared: u32,
        device: u32,
    },
    /// The device reported the datapool as not existing at all.
    AbsentOnDevice,
    /// Metadata could not be read; carries the transport/protocol reason.
    ReadFailed(String),
}

impl DataPoolCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, DataPoolCheck::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoolReport {
    pub data_pool: u32,
    pub name: String,
    pub check: DataPoolCheck,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeVerifyReport {
    pub node_index: NodeIndex,
    pub node_name: String,
    pub pools: Vec<DataPoolReport>,
}

/// Consolidated per-node, per-datapool verification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub nodes: Vec<NodeVerifyReport>,
    pub verified_at: DateTime<Utc>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| node.pools.iter().all(|pool| pool.check.is_ok()))
    }

    /// Human-readable list of every failed check, or `None` when all
    /// datapools verified.
    pub fn failure_summary(&self) -> Option<String> {
        let mut lines = Vec::new();
        for node in &self.nodes {
            for pool in &node.pools {
                let reason = match &pool.check {
                    DataPoolCheck::Ok => continue,
                    DataPoolCheck::NameMismatch { declared, device } => {
                        format!("name mismatch (declared '{}', device '{}')", declared, device)
                    }
                    DataPoolCheck::VersionMismatch { declared, device } => format!(
                        "version mismatch (declared {}.{}.{}, device {}.{}.{})",
                        declared[0], declared[1], declared[2], device[0], device[1], device[2]
                    ),
                    DataPoolCheck::ChecksumMismatch { declared, device } => format!(
                        "definition checksum mismatch (declared 0x{:08X}, device 0x{:08X})",
                        declared, device
                    ),
                    DataPoolCheck::AbsentOnDevice => "not present on the device".to_string(),
                    DataPoolCheck::ReadFailed(reason) => {
                        format!("metadata read failed: {}", reason)
                    }
                };
                lines.push(format!("{} / {}: {}", node.node_name, pool.name, reason));
            }
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("; "))
        }
    }
}

/// Checks every active node's declared datapools against the live device.
pub struct DatapoolVerifier<'a> {
    controller: &'a SessionController,
    snapshot: &'a SystemSnapshot,
}

impl<'a> DatapoolVerifier<'a> {
    pub fn new(controller: &'a SessionController, snapshot: &'a SystemSnapshot) -> Self {
        Self {
            controller,
            snapshot,
        }
    }

    /// Verify all datapools of all reachable nodes.
    ///
    /// Legacy nodes pin their definition checksum during logon and expose
    /// no metadata service; they are skipped here. Defect nodes cannot be
    /// asked and are skipped with a warning.
    pub async fn verify_all(&self) -> VerifyReport {
        let mut nodes = Vec::new();
        for (active_index, node) in self.controller.nodes().iter().enumerate() {
            if node.protocol.kind() == ProtocolKind::Legacy {
                continue;
            }
            if self.controller.is_defect(active_index) {
                warn!(node = %node.name, "Skipping datapool verification of unreachable node");
                continue;
            }
            let Some(decl) = self.snapshot.node(node.node_index) else {
                continue;
            };

            let mut pools = Vec::with_capacity(decl.data_pools.len());
            for (pool_index, pool_decl) in decl.data_pools.iter().enumerate() {
                let check = self.check_pool(node, pool_index as u32, pool_decl).await;
                if !check.is_ok() {
                    warn!(
                        node = %node.name,
                        pool = %pool_decl.name,
                        check = ?check,
                        "Datapool verification failed"
                    );
                }
                pools.push(DataPoolReport {
                    data_pool: pool_index as u32,
                    name: pool_decl.name.clone(),
                    check,
                });
            }
            debug!(node = %node.name, pools = pools.len(), "Node datapools verified");
            nodes.push(NodeVerifyReport {
                node_index: node.node_index,
                node_name: node.name.clone(),
                pools,
            });
        }
        VerifyReport {
            nodes,
            verified_at: Utc::now(),
        }
    }

    async fn check_pool(
        &self,
        node: &crate::session::ActiveNode,
        pool_index: u32,
        decl: &eculink_core::DataPoolDecl,
    ) -> DataPoolCheck {
        let wire_index = match u8::try_from(pool_index) {
            Ok(index) => index,
            Err(_) => {
                return DataPoolCheck::ReadFailed(format!(
                    "datapool index {} exceeds the wire field",
                    pool_index
                ))
            }
        };

        let meta = match node.protocol.data_pool_meta(wire_index).await {
            Ok(meta) => meta,
            Err(e) => {
                if e.nrc() == Some(NegativeResponseCode::RequestOutOfRange) {
                    return DataPoolCheck::AbsentOnDevice;
                }
                return DataPoolCheck::ReadFailed(readable_reason(&e));
            }
        };

        if meta.name != decl.name {
            return DataPoolCheck::NameMismatch {
                declared: decl.name.clone(),
                device: meta.name,
            };
        }
        if meta.version != decl.version {
            return DataPoolCheck::VersionMismatch {
                declared: decl.version,
                device: meta.version,
            };
        }
        if meta.definition_crc != decl.definition_crc {
            return DataPoolCheck::ChecksumMismatch {
                declared: decl.definition_crc,
                device: meta.definition_crc,
            };
        }
        DataPoolCheck::Ok
    }
}

fn readable_reason(error: &ProtocolError) -> String {
    match error.nrc() {
        Some(nrc) => format!("device refused with {} (0x{:02X})", nrc, nrc),
        None => error.to_string(),
    }
}
