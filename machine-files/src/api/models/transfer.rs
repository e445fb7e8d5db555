use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Query parameters shared by upload and download
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct MachineQuery {
    /// Identifier of the machine the file belongs to
    #[param(example = "m-001")]
    pub machine_id: Option<String>,
}

/// Body returned after a successful upload
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    #[schema(example = "file uploaded")]
    pub message: String,
}

impl UploadResponse {
    pub fn uploaded() -> Self {
        Self {
            message: "file uploaded".to_string(),
        }
    }
}
