use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Resolved identity of a printed card, as returned by the lookup service or a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardIdentity {
    pub name: String,
    pub external_id: String,
    pub external_uri: String,
    pub set_code: Option<String>,
}

/// One row of the `collection` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CollectionRecord {
    pub name: String,
    pub owned_count: i64,
    pub external_id: Option<String>,
    #[sqlx(rename = "uri")]
    pub external_uri: Option<String>,
    #[sqlx(rename = "updated_at")]
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OcrCacheRow {
    pub name: String,
    pub external_id: String,
    pub uri: String,
    pub set_code: Option<String>,
}

impl From<OcrCacheRow> for CardIdentity {
    fn from(row: OcrCacheRow) -> Self {
        Self {
            name: row.name,
            external_id: row.external_id,
            external_uri: row.uri,
            set_code: row.set_code,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ArtCacheRow {
    pub hash: String,
    pub name: String,
    pub external_id: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub pages: usize,
    pub tiles_identified: usize,
    pub tiles_unidentified: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub identified: usize,
    pub unidentified: usize,
}
