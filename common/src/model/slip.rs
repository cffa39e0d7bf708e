use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A rendered salary slip for one employee.
///
/// `input_digest` identifies the template + data the slip was rendered from and
/// is what a later run compares against to skip unchanged rows.
/// `content_hash` is the md5 of the normalised PNG bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlipImage {
    pub employee_id: Uuid,
    pub session_id: Uuid,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub content_hash: String,
    pub input_digest: String,
    pub rendered_at: DateTime<Utc>,
}

impl SlipImage {
    pub const CONTENT_TYPE: &'static str = "image/png";
}
