//! Per-node datapool data dealer
//!
//! One dealer exists per active node. It executes direct element and NVM
//! access for the polling engine, routes rail values drained during cycling
//! to element subscribers, and owns the safe-write bookkeeping: which NVM
//! lists changed, recomputing their CRCs and telling the node to reload.
//!
//! NVM list layout: lists that carry a CRC store it big-endian in the first
//! two bytes of the list area; element images follow at their declared
//! offsets. The CRC covers everything after those two bytes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crc::Crc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use eculink_core::{
    ComError, ComResult, DataPoolDecl, ElementDecl, ElementId, ElementValue, ListDecl,
    TimestampedValue,
};

use crate::content_conv;
use crate::dispatch::SignalSink;
use crate::protocol::{com_error_for_node, RailValue};
use crate::session::ActiveNode;

/// CRC over an NVM list's element area.
const LIST_CRC: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_3740);

/// Bytes reserved for the CRC at the start of a checksummed list.
const LIST_CRC_LEN: u32 = 2;

/// Decoded image of one NVM list.
#[derive(Debug, Clone, PartialEq)]
pub struct NvmListImage {
    pub data_pool: u32,
    pub list: u32,
    pub values: Vec<(ElementId, ElementValue)>,
}

/// Acknowledgement state of one NVM change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmNotification {
    pub data_pool: u32,
    pub list: u32,
    /// Whether the node's application accepted the reload.
    pub accepted: bool,
}

/// Typed datapool access for one active node.
pub struct DataDealer {
    node: Arc<ActiveNode>,
    /// Declared datapools, straight from the system snapshot.
    data_pools: Vec<DataPoolDecl>,
    subscribers: RwLock<HashMap<ElementId, Vec<Arc<dyn SignalSink>>>>,
    /// Elements written to NVM since the last CRC update, grouped by
    /// (datapool, list).
    pending_writes: Mutex<BTreeMap<(u32, u32), BTreeSet<u32>>>,
    started: Instant,
}

impl DataDealer {
    pub fn new(node: Arc<ActiveNode>, data_pools: Vec<DataPoolDecl>) -> Self {
        Self {
            node,
            data_pools,
            subscribers: RwLock::new(HashMap::new()),
            pending_writes: Mutex::new(BTreeMap::new()),
            started: Instant::now(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node.name
    }

    /// Subscribe a sink to one element's value stream (rail pushes and
    /// polled reads alike).
    pub fn subscribe(&self, element: ElementId, sink: Arc<dyn SignalSink>) {
        self.subscribers
            .write()
            .entry(element)
            .or_default()
            .push(sink);
    }

    /// Remove a previously subscribed sink, matched by identity.
    pub fn unsubscribe(&self, element: &ElementId, sink: &Arc<dyn SignalSink>) {
        let mut subscribers = self.subscribers.write();
        if let Some(sinks) = subscribers.get_mut(element) {
            sinks.retain(|s| !Arc::ptr_eq(s, sink));
            if sinks.is_empty() {
                subscribers.remove(element);
            }
        }
    }

    /// Route one drained rail push to the subscribers of its element.
    pub fn route_rail_value(&self, rail: &RailValue) {
        let id = rail.address.to_element_id(self.node.node_index);
        let Ok((_, _, element)) = self.decl_of(&id) else {
            debug!(node = %self.node.name, element = %id, "Rail push for undeclared element");
            return;
        };
        match content_conv::value_from_wire_bytes(element.value_type, &rail.raw) {
            Ok(value) => self.deliver(&id, value, rail.timestamp_ms),
            Err(e) => {
                debug!(node = %self.node.name, element = %id, error = %e, "Rail value decode failed");
            }
        }
    }

    /// Read one element directly (0x22 path). The decoded value also goes
    /// to the element's subscribers; on-trigger rails are serviced this way.
    pub async fn read_element_value(&self, id: &ElementId) -> ComResult<ElementValue> {
        let (_, _, element) = self.decl_of(id)?;
        let value_type = element.value_type;
        let raw = self
            .node
            .protocol
            .read_element(id)
            .await
            .map_err(|e| com_error_for_node(&self.node.name, e))?;
        let value = content_conv::value_from_wire_bytes(value_type, &raw)
            .map_err(|e| ComError::Transport(format!("'{}' {}: {}", self.node.name, id, e)))?;
        self.deliver(id, value.clone(), self.elapsed_ms());
        Ok(value)
    }

    /// Write one element directly (0x2E path).
    pub async fn write_element_value(&self, id: &ElementId, value: &ElementValue) -> ComResult<()> {
        let (_, _, element) = self.decl_of(id)?;
        self.check_type(id, element, value)?;
        self.node
            .protocol
            .write_element(id, &content_conv::value_to_wire_bytes(value))
            .await
            .map_err(|e| com_error_for_node(&self.node.name, e))
    }

    /// Read one element's NVM image.
    pub async fn read_nvm_value(&self, id: &ElementId) -> ComResult<ElementValue> {
        let (_, list, element) = self.decl_of(id)?;
        let value_type = element.value_type;
        let address = element_address(&self.node.name, id, list, element)?;
        let raw = self
            .node
            .protocol
            .read_memory(address, value_type.byte_len() as u16)
            .await
            .map_err(|e| com_error_for_node(&self.node.name, e))?;
        let value = content_conv::value_from_wire_bytes(value_type, &raw)
            .map_err(|e| ComError::Transport(format!("'{}' {}: {}", self.node.name, id, e)))?;
        self.deliver(id, value.clone(), self.elapsed_ms());
        Ok(value)
    }

    /// Write one element's NVM image and remember its list for the CRC and
    /// notification passes.
    pub async fn write_nvm_value(&self, id: &ElementId, value: &ElementValue) -> ComResult<()> {
        let (_, list, element) = self.decl_of(id)?;
        self.check_type(id, element, value)?;
        let address = element_address(&self.node.name, id, list, element)?;
        self.node
            .protocol
            .write_memory(address, &content_conv::value_to_wire_bytes(value))
            .await
            .map_err(|e| com_error_for_node(&self.node.name, e))?;
        self.pending_writes
            .lock()
            .entry((id.data_pool, id.list))
            .or_default()
            .insert(id.element);
        Ok(())
    }

    /// Read one NVM list as a whole, decode every element and verify the
    /// stored CRC. Decoded values reach subscribers even when the CRC turns
    /// out wrong; the mismatch is the returned error.
    pub async fn read_nvm_list(&self, data_pool: u32, list: u32) -> ComResult<NvmListImage> {
        let (_, list_decl) = self.list_decl(data_pool, list)?;
        let start = list_start(&self.node.name, list_decl)?;
        let len = list_image_len(list_decl);
        let wire_len = u16::try_from(len).map_err(|_| {
            ComError::Config(format!(
                "list '{}' on '{}' spans {} bytes, beyond one read",
                list_decl.name, self.node.name, len
            ))
        })?;

        let image = self
            .node
            .protocol
            .read_memory(start, wire_len)
            .await
            .map_err(|e| com_error_for_node(&self.node.name, e))?;
        if image.len() != len as usize {
            return Err(ComError::Transport(format!(
                "'{}' list {} returned {} bytes, expected {}",
                self.node.name,
                list_decl.name,
                image.len(),
                len
            )));
        }

        let mut values = Vec::with_capacity(list_decl.elements.len());
        for (index, element) in list_decl.elements.iter().enumerate() {
            let id = ElementId::new(self.node.node_index, data_pool, list, index as u32);
            let offset = element_offset(&self.node.name, &id, list_decl, element)? as usize;
            let end = offset + element.value_type.byte_len();
            let value = content_conv::value_from_wire_bytes(element.value_type, &image[offset..end])
                .map_err(|e| {
                    ComError::Transport(format!("'{}' {}: {}", self.node.name, id, e))
                })?;
            self.deliver(&id, value.clone(), self.elapsed_ms());
            values.push((id, value));
        }

        if list_decl.crc_supported {
            let stored = u16::from_be_bytes([image[0], image[1]]);
            let computed = LIST_CRC.checksum(&image[LIST_CRC_LEN as usize..]);
            if stored != computed {
                return Err(ComError::Checksum(format!(
                    "'{}' list '{}': stored 0x{:04X}, computed 0x{:04X}",
                    self.node.name, list_decl.name, stored, computed
                )));
            }
        }

        Ok(NvmListImage {
            data_pool,
            list,
            values,
        })
    }

    /// Read every NVM-backed list of a datapool, verifying all stored CRCs.
    /// Reads continue past a mismatch; the error reports every bad list.
    pub async fn safe_read(&self, data_pool: u32) -> ComResult<Vec<NvmListImage>> {
        let dp_decl = self
            .data_pools
            .get(data_pool as usize)
            .ok_or_else(|| self.range_error(data_pool, None))?;

        let mut images = Vec::new();
        let mut bad_lists: Vec<String> = Vec::new();
        for (index, list_decl) in dp_decl.lists.iter().enumerate() {
            if list_decl.nvm_start_address.is_none() {
                continue;
            }
            match self.read_nvm_list(data_pool, index as u32).await {
                Ok(image) => images.push(image),
                Err(ComError::Checksum(detail)) => bad_lists.push(detail),
                Err(other) => return Err(other),
            }
        }

        if bad_lists.is_empty() {
            Ok(images)
        } else {
            Err(ComError::Checksum(bad_lists.join("; ")))
        }
    }

    /// Write a batch of changed values to NVM. Aborts on the first failed
    /// write; successfully written elements stay recorded for the CRC pass.
    pub async fn safe_write_changed_values(
        &self,
        changes: &[(ElementId, ElementValue)],
    ) -> ComResult<Vec<ElementId>> {
        let mut written = Vec::with_capacity(changes.len());
        for (id, value) in changes {
            self.write_nvm_value(id, value).await?;
            written.push(*id);
        }
        info!(node = %self.node.name, elements = written.len(), "Changed NVM values written");
        Ok(written)
    }

    /// Recompute and write the CRC of every checksummed list touched since
    /// the last notification round. The element area is read back from the
    /// device so the CRC covers what is actually stored.
    pub async fn safe_write_crcs(&self) -> ComResult<()> {
        let touched: Vec<(u32, u32)> = self.pending_writes.lock().keys().copied().collect();
        for (data_pool, list) in touched {
            let (_, list_decl) = self.list_decl(data_pool, list)?;
            if !list_decl.crc_supported {
                continue;
            }
            let start = list_start(&self.node.name, list_decl)?;
            let len = list_image_len(list_decl);
            let area_len = u16::try_from(len - LIST_CRC_LEN).map_err(|_| {
                ComError::Config(format!(
                    "list '{}' on '{}' spans {} bytes, beyond one read",
                    list_decl.name, self.node.name, len
                ))
            })?;

            let element_area = self
                .node
                .protocol
                .read_memory(start + LIST_CRC_LEN, area_len)
                .await
                .map_err(|e| com_error_for_node(&self.node.name, e))?;
            let crc = LIST_CRC.checksum(&element_area);
            self.node
                .protocol
                .write_memory(start, &crc.to_be_bytes())
                .await
                .map_err(|e| com_error_for_node(&self.node.name, e))?;
            debug!(
                node = %self.node.name,
                list = %list_decl.name,
                crc = format!("0x{:04X}", crc),
                "List CRC updated"
            );
        }
        Ok(())
    }

    /// Tell the node which lists changed so its application reloads them.
    /// Accepted lists leave the pending set; declined ones stay.
    pub async fn notify_nvm_written(&self) -> ComResult<Vec<NvmNotification>> {
        let touched: Vec<(u32, u32)> = self.pending_writes.lock().keys().copied().collect();
        let mut notifications = Vec::with_capacity(touched.len());
        for (data_pool, list) in touched {
            let dp = u8::try_from(data_pool)
                .map_err(|_| self.range_error(data_pool, Some(list)))?;
            let list_wire = u16::try_from(list)
                .map_err(|_| self.range_error(data_pool, Some(list)))?;
            let accepted = self
                .node
                .protocol
                .notify_nvm_written(dp, list_wire)
                .await
                .map_err(|e| com_error_for_node(&self.node.name, e))?;
            if accepted {
                self.pending_writes.lock().remove(&(data_pool, list));
            }
            notifications.push(NvmNotification {
                data_pool,
                list,
                accepted,
            });
        }
        Ok(notifications)
    }

    /// Lists with writes not yet acknowledged by the node.
    pub fn pending_lists(&self) -> Vec<(u32, u32)> {
        self.pending_writes.lock().keys().copied().collect()
    }

    fn deliver(&self, id: &ElementId, value: ElementValue, timestamp_ms: u64) {
        let subscribers = self.subscribers.read();
        if let Some(sinks) = subscribers.get(id) {
            let stamped = TimestampedValue::new(value, timestamp_ms);
            for sink in sinks {
                sink.insert_new_value(id, stamped.clone());
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn decl_of(&self, id: &ElementId) -> ComResult<(&DataPoolDecl, &ListDecl, &ElementDecl)> {
        if id.node != self.node.node_index {
            return Err(ComError::Config(format!(
                "element {} does not belong to node '{}'",
                id, self.node.name
            )));
        }
        let dp = self
            .data_pools
            .get(id.data_pool as usize)
            .ok_or_else(|| self.range_error(id.data_pool, None))?;
        let list = dp
            .lists
            .get(id.list as usize)
            .ok_or_else(|| self.range_error(id.data_pool, Some(id.list)))?;
        let element = list.elements.get(id.element as usize).ok_or_else(|| {
            ComError::Config(format!(
                "element {} is not declared on node '{}'",
                id, self.node.name
            ))
        })?;
        Ok((dp, list, element))
    }

    fn list_decl(&self, data_pool: u32, list: u32) -> ComResult<(&DataPoolDecl, &ListDecl)> {
        let dp = self
            .data_pools
            .get(data_pool as usize)
            .ok_or_else(|| self.range_error(data_pool, None))?;
        let list_decl = dp
            .lists
            .get(list as usize)
            .ok_or_else(|| self.range_error(data_pool, Some(list)))?;
        Ok((dp, list_decl))
    }

    fn check_type(&self, id: &ElementId, decl: &ElementDecl, value: &ElementValue) -> ComResult<()> {
        if value.value_type() != Some(decl.value_type) {
            return Err(ComError::Config(format!(
                "value for {} is {:?}, declared {:?}",
                id,
                value.value_type(),
                decl.value_type
            )));
        }
        Ok(())
    }

    fn range_error(&self, data_pool: u32, list: Option<u32>) -> ComError {
        match list {
            Some(list) => ComError::Config(format!(
                "node '{}' has no datapool {} list {}",
                self.node.name, data_pool, list
            )),
            None => ComError::Config(format!(
                "node '{}' has no datapool {}",
                self.node.name, data_pool
            )),
        }
    }
}

/// Absolute NVM address of one element.
fn element_address(
    node: &str,
    id: &ElementId,
    list: &ListDecl,
    element: &ElementDecl,
) -> ComResult<u32> {
    Ok(list_start(node, list)? + element_offset(node, id, list, element)?)
}

/// Element offset within its list area; checksummed lists reserve the
/// leading CRC bytes.
fn element_offset(
    node: &str,
    id: &ElementId,
    list: &ListDecl,
    element: &ElementDecl,
) -> ComResult<u32> {
    let offset = element.nvm_offset.ok_or_else(|| {
        ComError::Config(format!("element {} on '{}' is not NVM-backed", id, node))
    })?;
    if list.crc_supported && offset < LIST_CRC_LEN {
        return Err(ComError::Config(format!(
            "element {} on '{}' overlaps the list CRC (offset {})",
            id, node, offset
        )));
    }
    Ok(offset)
}

fn list_start(node: &str, list: &ListDecl) -> ComResult<u32> {
    list.nvm_start_address.ok_or_else(|| {
        ComError::Config(format!(
            "list '{}' on '{}' has no NVM start address",
            list.name, node
        ))
    })
}

/// Total byte length of a list's NVM image: leading CRC (when present) plus
/// element images at their offsets.
fn list_image_len(list: &ListDecl) -> u32 {
    let elements_end = list
        .elements
        .iter()
        .filter_map(|el| {
            el.nvm_offset
                .map(|off| off + el.value_type.byte_len() as u32)
        })
        .max()
        .unwrap_or(0);
    if list.crc_supported {
        elements_end.max(LIST_CRC_LEN)
    } else {
        elements_end
    }
}
