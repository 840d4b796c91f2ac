//! Legacy protocol services
//!
//! Nodes speaking the older diagnostic protocol only support explicit
//! logon/logoff around a session. They push no rail values and expose
//! no element or NVM services through this driver.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{service_id, NegativeResponseCode, ProtocolError};
use crate::transport::BusDispatcher;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Project identity sent with the logon so the node can reject a tester
/// built against a different definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogonInfo {
    pub version: [u8; 3],
    pub definition_crc: u32,
}

pub struct LegacyProtocol {
    dispatcher: Arc<dyn BusDispatcher>,
    timeout: Duration,
    logon_info: LogonInfo,
}

impl LegacyProtocol {
    pub fn new(dispatcher: Arc<dyn BusDispatcher>, logon_info: LogonInfo) -> Self {
        Self {
            dispatcher,
            timeout: DEFAULT_TIMEOUT,
            logon_info,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dispatcher(&self) -> &Arc<dyn BusDispatcher> {
        &self.dispatcher
    }

    /// Single request/response round. The legacy protocol knows no
    /// response-pending state.
    async fn send_request(&self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let response = self.dispatcher.send_receive(request, self.timeout).await?;

        if response.first() == Some(&service_id::NEGATIVE_RESPONSE) {
            if response.len() < 3 {
                return Err(ProtocolError::InvalidResponse(
                    "Negative response too short".to_string(),
                ));
            }
            return Err(ProtocolError::NegativeResponse {
                service_id: response[1],
                nrc: NegativeResponseCode::from(response[2]),
            });
        }
        Ok(response)
    }

    pub async fn logon(&self) -> Result<(), ProtocolError> {
        let mut request = vec![service_id::LEGACY_LOGON];
        request.extend_from_slice(&self.logon_info.version);
        request.extend_from_slice(&self.logon_info.definition_crc.to_be_bytes());

        let response = self.send_request(&request).await?;
        if response.first() != Some(&service_id::LEGACY_LOGON.wrapping_add(0x40)) {
            return Err(ProtocolError::SessionTransitionFailed(format!(
                "unexpected logon response: {}",
                hex::encode(&response)
            )));
        }
        debug!(crc = format!("0x{:08X}", self.logon_info.definition_crc), "legacy logon done");
        Ok(())
    }

    pub async fn logoff(&self) -> Result<(), ProtocolError> {
        let request = vec![service_id::LEGACY_LOGOFF];
        self.send_request(&request).await?;
        Ok(())
    }

    /// Legacy sessions stay alive through their own traffic; there is no
    /// keepalive service to call.
    pub async fn tester_present(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}
