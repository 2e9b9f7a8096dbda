//! Response body returned by the upload endpoint.

use serde::Serialize;

/// JSON payload for a successful upload.
///
/// Field names follow the wire contract: `blobName` and `sasURI`.
#[derive(Serialize, Debug)]
pub struct UploadResponse {
    pub success: bool,
    pub container: String,
    #[serde(rename = "blobName")]
    pub blob_name: String,
    #[serde(rename = "sasURI")]
    pub sas_uri: String,
}
