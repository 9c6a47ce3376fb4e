use async_trait::async_trait;
use castle_types::{DeviceControlRequest, DeviceControlResponse};

/// Executes control requests against devices
///
/// Implementations report failures in the response; they never panic or
/// return early for an unknown device.
#[async_trait]
pub trait DeviceController: Send + Sync {
    async fn execute_control_request(
        &self,
        device_id: &str,
        request: &DeviceControlRequest,
    ) -> DeviceControlResponse;
}
