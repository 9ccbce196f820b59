use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;
use vmdash_node::model as node;

#[derive(Serialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Iso {
    pub name: String,
    pub size_bytes: u64,
    #[schema(example = "650.00 MB")]
    pub size: String,
    pub modified: DateTime<Utc>,
}

impl From<node::Iso> for Iso {
    fn from(iso: node::Iso) -> Self {
        Iso {
            name: iso.name,
            size_bytes: iso.size_bytes,
            size: iso.size,
            modified: iso.modified,
        }
    }
}

/// ISO upload carried inside a JSON body.
#[derive(Deserialize, Debug, Clone, ToSchema, Validate)]
pub struct Base64Iso {
    #[validate(length(min = 1))]
    pub name: String,
    /// Standard base64, padding included.
    pub content: String,
}

/// Multipart form with the image in the `file` field.
#[derive(ToSchema)]
pub struct IsoUpload {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}
