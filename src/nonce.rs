//! Replay defense: timestamped one-time tokens.
//!
//! The generator emits `<UTC second><counter>` values that stay distinct
//! even when called faster than timestamp resolution. The verifier keeps a
//! seen-set per provider URL and sweeps stale nonces on every access, so a
//! nonce never survives past the max-age window by more than one access
//! and memory stays bounded to the live window.
//!
//! The verifier must be consulted strictly after signature verification
//! succeeds; otherwise an attacker could poison the seen-set with nonces
//! from forged assertions. A process restart forgets prior nonces, which is
//! acceptable: the embedded timestamp still bounds the replay window.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

/// Nonce timestamp prefix format, fixed width (20 characters)
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const TIMESTAMP_LEN: usize = 20;

/// Default replay window in seconds
const DEFAULT_MAX_AGE_SECS: i64 = 60;

/// Full sweep across all providers at most this often
const FULL_SWEEP_INTERVAL_SECS: i64 = 300;

/// Outcome of checking an inbound nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    /// First sighting, recorded
    Ok,
    /// Already accepted for this provider
    Seen,
    /// Timestamp older than the verifier's window
    TooOld,
    /// No parseable leading timestamp
    InvalidTimestamp,
}

/// Emits distinct timestamped nonces.
///
/// The counter increments only while the formatted timestamp is unchanged
/// from the previous call and resets to zero when it changes.
pub struct NonceGenerator {
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    timestamp: String,
    counter: u64,
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                timestamp: String::new(),
                counter: 0,
            }),
        }
    }

    /// Next unique nonce: UTC timestamp prefix plus sequence counter
    pub fn next(&self) -> String {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        if now == state.timestamp {
            state.counter += 1;
        } else {
            state.timestamp = now;
            state.counter = 0;
        }
        format!("{}{}", state.timestamp, state.counter)
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the fixed-width timestamp prefix of a nonce.
///
/// Nonces arrive from the wire and may contain arbitrary UTF-8; a prefix
/// that is too short or not sliceable at the timestamp width is simply not
/// a timestamp.
pub fn parse_timestamp(nonce: &str) -> Option<DateTime<Utc>> {
    let prefix = nonce.get(..TIMESTAMP_LEN)?;
    let naive = NaiveDateTime::parse_from_str(prefix, TIMESTAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Tracks seen nonces per provider URL within a max-age window
pub struct NonceVerifier {
    max_age: Duration,
    inner: Mutex<VerifierState>,
}

struct VerifierState {
    /// provider URL -> (nonce -> its parsed timestamp)
    seen: HashMap<String, HashMap<String, DateTime<Utc>>>,
    last_full_sweep: DateTime<Utc>,
}

impl NonceVerifier {
    pub fn new() -> Self {
        Self::with_max_age(DEFAULT_MAX_AGE_SECS)
    }

    pub fn with_max_age(max_age_secs: i64) -> Self {
        Self {
            max_age: Duration::seconds(max_age_secs),
            inner: Mutex::new(VerifierState {
                seen: HashMap::new(),
                last_full_sweep: Utc::now(),
            }),
        }
    }

    pub fn max_age_secs(&self) -> i64 {
        self.max_age.num_seconds()
    }

    /// Check an inbound nonce and record it when fresh.
    ///
    /// Also purges stale nonces from the touched provider's set (and from
    /// all sets periodically), removing emptied sets entirely.
    pub fn seen(&self, op_url: &str, nonce: &str) -> NonceStatus {
        let timestamp = match parse_timestamp(nonce) {
            Some(ts) => ts,
            None => return NonceStatus::InvalidTimestamp,
        };

        let now = Utc::now();
        let cutoff = now - self.max_age;

        let mut state = self.inner.lock().unwrap();
        if now - state.last_full_sweep > Duration::seconds(FULL_SWEEP_INTERVAL_SECS) {
            for set in state.seen.values_mut() {
                set.retain(|_, ts| *ts >= cutoff);
            }
            state.seen.retain(|_, set| !set.is_empty());
            state.last_full_sweep = now;
        }

        // Purge the touched provider's set, dropping it entirely when empty
        if let Some(set) = state.seen.get_mut(op_url) {
            set.retain(|_, ts| *ts >= cutoff);
            if set.is_empty() {
                state.seen.remove(op_url);
            }
        }

        if timestamp < cutoff {
            return NonceStatus::TooOld;
        }

        let set = state.seen.entry(op_url.to_string()).or_default();
        if set.contains_key(nonce) {
            return NonceStatus::Seen;
        }
        set.insert(nonce.to_string(), timestamp);
        NonceStatus::Ok
    }
}

impl Default for NonceVerifier {
    fn default() -> Self {
        Self::new()
    }
}
