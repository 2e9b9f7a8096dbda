use crate::services::storage_gateway::StorageGateway;
use chrono::TimeDelta;

/// Container that receives every upload.
pub const IMAGE_CONTAINER: &str = "images";

/// Shared, read-only state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: StorageGateway,
    /// Validity of the grant returned by the upload endpoint.
    pub upload_sas_ttl: TimeDelta,
}

impl AppState {
    pub fn new(gateway: StorageGateway, upload_sas_ttl: TimeDelta) -> Self {
        Self {
            gateway,
            upload_sas_ttl,
        }
    }
}
