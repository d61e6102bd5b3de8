//! The persisted record of which container currently serves a subdomain

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of the display prefix of a container id
pub const SHORT_ID_LEN: usize = 12;

/// Snapshot of one subdomain's bound container.
///
/// Stored in the registry as a flat JSON object under
/// [`subdomain_key`]. `short_id` is always derived from `id`; a stored value
/// is never trusted on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Information {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub subdomain: String,
    #[serde(rename = "branch", default)]
    pub git_branch: String,
    pub image: String,
    #[serde(rename = "ipaddress", default)]
    pub ip_address: String,
    pub created: DateTime<Utc>,
}

impl Information {
    pub fn new(
        id: impl Into<String>,
        subdomain: impl Into<String>,
        git_branch: impl Into<String>,
        image: impl Into<String>,
        ip_address: impl Into<String>,
        created: DateTime<Utc>,
    ) -> Self {
        let id = id.into();
        Self {
            short_id: short_id(&id),
            id,
            subdomain: subdomain.into(),
            git_branch: git_branch.into(),
            image: image.into(),
            ip_address: ip_address.into(),
            created,
        }
    }

    /// Encode for the registry
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a registry value, re-deriving `short_id`
    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        let mut info: Information = serde_json::from_slice(data)?;
        info.short_id = short_id(&info.id);
        Ok(info)
    }
}

/// First [`SHORT_ID_LEN`] characters of a container id (the whole id if shorter)
pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

/// Registry key holding the record for `subdomain`
pub fn subdomain_key(subdomain: &str) -> String {
    format!("subdomain:{}", subdomain)
}
