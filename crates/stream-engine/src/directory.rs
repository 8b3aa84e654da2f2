use std::{collections::HashMap, sync::Mutex, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default quality tiers, in the order they are declared on a fresh stream.
pub const DEFAULT_QUALITIES: [&str; 3] = ["64x64", "128x128", "256x256"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Initializing,
    Active,
    Completed,
    Error,
    TimedOut,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Completed | StreamState::Error | StreamState::TimedOut)
    }
}

/// Snapshot of a stream's lifecycle state. Cheap to clone; returned by value
/// from every Directory read so callers never alias internal storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: String,
    pub qualities: Vec<String>,
    pub state: StreamState,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub error: Option<String>,
}

struct Inner {
    streams: HashMap<String, StreamRecord>,
}

/// In-memory registry of stream lifecycle records, guarded by a single mutex.
pub struct StreamDirectory {
    inner: Mutex<Inner>,
    timeout: Duration,
}

impl StreamDirectory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { streams: HashMap::new() }),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Assigns a fresh identifier and inserts a record in `Initializing`.
    pub fn create(&self, now: DateTime<Utc>) -> StreamRecord {
        let record = StreamRecord {
            id: new_stream_id(),
            qualities: DEFAULT_QUALITIES.iter().map(|s| s.to_string()).collect(),
            state: StreamState::Initializing,
            created_at: now,
            last_access: now,
            error: None,
        };
        let mut inner = self.inner.lock().expect("directory mutex poisoned");
        inner.streams.insert(record.id.clone(), record.clone());
        record
    }

    /// Inserts an `Active` record for `id` if absent; otherwise touches it.
    /// Used when an HLS path is requested for an id the engine never created
    /// itself, so external discovery keeps the stream alive.
    pub fn register(&self, id: &str, now: DateTime<Utc>) -> StreamRecord {
        let mut inner = self.inner.lock().expect("directory mutex poisoned");
        if let Some(existing) = inner.streams.get_mut(id) {
            existing.last_access = existing.last_access.max(now);
            return existing.clone();
        }
        let record = StreamRecord {
            id: id.to_string(),
            qualities: DEFAULT_QUALITIES.iter().map(|s| s.to_string()).collect(),
            state: StreamState::Active,
            created_at: now,
            last_access: now,
            error: None,
        };
        inner.streams.insert(id.to_string(), record.clone());
        record
    }

    /// Updates last-access if the record exists. Returns whether it was found.
    pub fn touch(&self, id: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().expect("directory mutex poisoned");
        match inner.streams.get_mut(id) {
            Some(record) => {
                record.last_access = record.last_access.max(now);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<StreamRecord> {
        let inner = self.inner.lock().expect("directory mutex poisoned");
        inner.streams.get(id).cloned()
    }

    pub fn set_state(&self, id: &str, state: StreamState, error: Option<String>) -> bool {
        let mut inner = self.inner.lock().expect("directory mutex poisoned");
        match inner.streams.get_mut(id) {
            Some(record) => {
                record.state = state;
                record.error = error;
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("directory mutex poisoned");
        inner.streams.keys().cloned().collect()
    }

    /// Count of records not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().expect("directory mutex poisoned");
        inner.streams.values().filter(|r| !r.state.is_terminal()).count()
    }

    /// Transitions every non-terminal record whose last-access age exceeds
    /// the configured timeout to `TimedOut`. Returns the affected ids.
    pub fn expire_inactive(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.inner.lock().expect("directory mutex poisoned");
        let mut expired = Vec::new();
        for (id, record) in inner.streams.iter_mut() {
            if record.state.is_terminal() {
                continue;
            }
            let age = now.signed_duration_since(record.last_access);
            if age > chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX) {
                record.state = StreamState::TimedOut;
                record.error = Some("inactive timeout".to_string());
                expired.push(id.clone());
            }
        }
        expired
    }
}

/// Generates an RFC 4122 v4 identifier in hyphenated lowercase hex form.
fn new_stream_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const ID_RE: &str =
        r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$";

    #[test]
    fn created_ids_match_v4_pattern() {
        let dir = StreamDirectory::new(Duration::from_secs(300));
        let record = dir.create(Utc::now());
        let re = regex::Regex::new(ID_RE).unwrap();
        assert!(re.is_match(&record.id), "{} did not match", record.id);
    }

    #[test]
    fn last_access_never_precedes_created_at() {
        let dir = StreamDirectory::new(Duration::from_secs(300));
        let t0 = Utc::now();
        let record = dir.create(t0);
        assert!(record.last_access >= record.created_at);
    }

    #[test]
    fn touch_never_moves_last_access_backwards() {
        let dir = StreamDirectory::new(Duration::from_secs(300));
        let t0 = Utc::now();
        let record = dir.create(t0);
        let earlier = t0;
        dir.touch(&record.id, earlier);
        let later = t0 + ChronoDuration::seconds(5);
        dir.touch(&record.id, later);
        let got = dir.get(&record.id).unwrap();
        assert_eq!(got.last_access, later);
        // touching with an earlier instant again must not regress it
        dir.touch(&record.id, earlier);
        let got = dir.get(&record.id).unwrap();
        assert_eq!(got.last_access, later);
    }

    #[test]
    fn expire_inactive_marks_timed_out_with_message() {
        let dir = StreamDirectory::new(Duration::from_secs(300));
        let t0 = Utc::now();
        let record = dir.register("abc", t0);
        let expired = dir.expire_inactive(t0 + ChronoDuration::seconds(301));
        assert_eq!(expired, vec!["abc".to_string()]);
        let got = dir.get(&record.id).unwrap();
        assert_eq!(got.state, StreamState::TimedOut);
        assert_eq!(got.error.as_deref(), Some("inactive timeout"));
    }

    #[test]
    fn terminal_states_are_never_expired() {
        let dir = StreamDirectory::new(Duration::from_secs(300));
        let t0 = Utc::now();
        dir.register("done", t0);
        dir.set_state("done", StreamState::Completed, None);
        let expired = dir.expire_inactive(t0 + ChronoDuration::seconds(10_000));
        assert!(expired.is_empty());
    }

    #[test]
    fn active_count_excludes_terminal_records() {
        let dir = StreamDirectory::new(Duration::from_secs(300));
        let t0 = Utc::now();
        dir.register("a", t0);
        dir.register("b", t0);
        dir.set_state("b", StreamState::Completed, None);
        assert_eq!(dir.active_count(), 1);
    }

    #[test]
    fn register_is_idempotent_on_presence() {
        let dir = StreamDirectory::new(Duration::from_secs(300));
        let t0 = Utc::now();
        let first = dir.register("abc", t0);
        let second = dir.register("abc", t0 + ChronoDuration::seconds(1));
        assert_eq!(first.id, second.id);
        assert_eq!(second.last_access, t0 + ChronoDuration::seconds(1));
    }
}
