//! Dead-letter entries

use chrono::{DateTime, Utc};
use genesis_types::Job;
use serde::{Deserialize, Serialize};

/// A job that exhausted its retry budget (or failed terminally), parked
/// with its final error for inspection and replay. Payloads carry no
/// secrets by construction, so the entry is safe to surface verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job: Job,
    pub error: String,
    pub error_code: String,
    pub failed_at: DateTime<Utc>,
}
