//! Task time limit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maps (task age, configured limit) to expired / not expired.
///
/// `limit = None` means tasks never time out.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub limit: Option<Duration>,
}

impl TimeoutPolicy {
    pub fn new(limit: Option<Duration>) -> Self {
        Self { limit }
    }

    pub fn none() -> Self {
        Self { limit: None }
    }

    pub fn after(limit: Duration) -> Self {
        Self { limit: Some(limit) }
    }

    /// Expired iff `now - created_at > limit` (strictly).
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Some(limit) = self.limit else {
            return false;
        };
        // A limit too large for chrono can never be exceeded.
        let Ok(limit) = chrono::Duration::from_std(limit) else {
            return false;
        };
        now - created_at > limit
    }
}
