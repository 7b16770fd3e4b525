//! Active session pointer: a single-row marker recording which daemon
//! run currently owns the database, so a restart can tell whether it is
//! resuming a prior run or starting fresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}
