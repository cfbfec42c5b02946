//! Audit log: non-blocking writes, cursor-paginated listing.
//!
//! Emission is scheduled on the next scheduler turn and write failures
//! are warned, never surfaced to the caller. Listing orders by
//! `(createdAt DESC, id DESC)`; the cursor is a base64url-encoded
//! `"isoTimestamp|id"` pair, so re-invoking with the same cursor yields
//! the same page.

use std::sync::Arc;
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_AUDIT_PAGE_SIZE: usize = 50;
pub const MAX_AUDIT_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub organization_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPage {
    pub items: Vec<AuditRecord>,
    pub next_cursor: Option<String>,
}

#[derive(Error, Debug, PartialEq)]
pub enum AuditError {
    #[error("limit must be between 1 and {MAX_AUDIT_PAGE_SIZE}, got {0}")]
    InvalidLimit(usize),

    #[error("malformed cursor")]
    InvalidCursor,

    #[error("audit store failure: {0}")]
    Store(String),
}

/// Pagination position: the sort key of the last item on the previous
/// page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditCursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl AuditCursor {
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}|{}",
            self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.id
        );
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(cursor: &str) -> Result<Self, AuditError> {
        let raw = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|_| AuditError::InvalidCursor)?;
        let raw = String::from_utf8(raw).map_err(|_| AuditError::InvalidCursor)?;
        let (timestamp, id) = raw.split_once('|').ok_or(AuditError::InvalidCursor)?;
        let created_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| AuditError::InvalidCursor)?
            .with_timezone(&Utc);
        Ok(Self {
            created_at,
            id: id.to_string(),
        })
    }
}

pub trait AuditStore: Send + Sync {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
    fn list(&self, organization_id: &str, query: &AuditQuery) -> Result<AuditPage, AuditError>;
}

/// Fire-and-forget audit emission: scheduled on the next runtime turn,
/// warn-only on failure. The caller continues regardless.
pub fn emit_audit(store: Arc<dyn AuditStore>, record: AuditRecord) {
    tokio::spawn(async move {
        if let Err(err) = store.record(record) {
            warn!("audit write failed: {err}");
        }
    });
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AuditStore for InMemoryAuditStore {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.lock().push(record);
        Ok(())
    }

    fn list(&self, organization_id: &str, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        let limit = query.limit.unwrap_or(DEFAULT_AUDIT_PAGE_SIZE);
        if limit == 0 || limit > MAX_AUDIT_PAGE_SIZE {
            return Err(AuditError::InvalidLimit(limit));
        }
        let cursor = match &query.cursor {
            Some(cursor) => Some(AuditCursor::decode(cursor)?),
            None => None,
        };

        let mut matches: Vec<AuditRecord> = self
            .lock()
            .iter()
            .filter(|r| r.organization_id == organization_id)
            .filter(|r| match &query.resource_type {
                Some(v) => &r.resource_type == v,
                None => true,
            })
            .filter(|r| match &query.resource_id {
                Some(v) => &r.resource_id == v,
                None => true,
            })
            .filter(|r| match &query.action {
                Some(v) => &r.action == v,
                None => true,
            })
            .filter(|r| match &query.actor_id {
                Some(v) => r.actor_id.as_ref() == Some(v),
                None => true,
            })
            .filter(|r| match &query.from {
                Some(from) => r.created_at >= *from,
                None => true,
            })
            .filter(|r| match &query.to {
                Some(to) => r.created_at <= *to,
                None => true,
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        if let Some(cursor) = &cursor {
            matches.retain(|r| {
                r.created_at < cursor.created_at
                    || (r.created_at == cursor.created_at && r.id < cursor.id)
            });
        }

        let has_more = matches.len() > limit;
        matches.truncate(limit);
        let next_cursor = if has_more {
            matches.last().map(|last| {
                AuditCursor {
                    created_at: last.created_at,
                    id: last.id.clone(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(AuditPage {
            items: matches,
            next_cursor,
        })
    }
}
