//! Per-IP auth-failure tracking and blacklisting
//!
//! Every listener owns one registry. A record is created lazily on first
//! contact and removed by a background expiry task once its deadline truly
//! elapses. Repeated auth failures push the deadline forward (linear
//! backoff); past the failure threshold the IP is blacklisted and all of
//! its open connections are aborted.

use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logger::log;

/// Failures beyond this count blacklist the IP
pub const FAILURE_THRESHOLD: u32 = 3;

/// Base penalty unit; also the initial record lifetime and the extension
/// granted per observed transfer on an active connection
pub const BASE_PENALTY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct RecordState {
    authenticated: bool,
    failures: u32,
    deadline: Instant,
    conns: HashMap<u64, CancellationToken>,
}

/// Safety state for one client IP
#[derive(Debug)]
pub struct SafetyRecord {
    ip: IpAddr,
    next_conn_id: AtomicU64,
    state: Mutex<RecordState>,
}

impl SafetyRecord {
    fn new(ip: IpAddr, deadline: Instant) -> Self {
        Self {
            ip,
            next_conn_id: AtomicU64::new(1),
            state: Mutex::new(RecordState {
                authenticated: false,
                failures: 0,
                deadline,
                conns: HashMap::new(),
            }),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Whether the IP has exceeded the failure threshold
    pub fn is_blacklisted(&self) -> bool {
        self.state.lock().unwrap().failures > FAILURE_THRESHOLD
    }

    pub fn failures(&self) -> u32 {
        self.state.lock().unwrap().failures
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().unwrap().authenticated
    }

    pub fn deadline(&self) -> Instant {
        self.state.lock().unwrap().deadline
    }

    /// Push the deadline forward, never backward
    pub fn extend(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.deadline = state.deadline.max(Instant::now() + duration);
    }

    /// Register an open connection so a blacklist event can abort it.
    /// The returned guard unregisters on drop.
    pub fn attach(self: &Arc<Self>, token: CancellationToken) -> ConnGuard {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().conns.insert(id, token);
        ConnGuard {
            record: Arc::clone(self),
            id,
        }
    }

    fn detach(&self, id: u64) {
        self.state.lock().unwrap().conns.remove(&id);
    }

    /// Abort every registered connection (blacklist escalation)
    fn abort_connections(&self) -> usize {
        let state = self.state.lock().unwrap();
        for token in state.conns.values() {
            token.cancel();
        }
        state.conns.len()
    }

    #[cfg(test)]
    fn open_connections(&self) -> usize {
        self.state.lock().unwrap().conns.len()
    }
}

/// Unregisters a connection from its safety record when dropped
#[derive(Debug)]
pub struct ConnGuard {
    record: Arc<SafetyRecord>,
    id: u64,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.record.detach(self.id);
    }
}

/// Per-listener registry of safety records, keyed by client IP
#[derive(Debug, Clone)]
pub struct SafetyRegistry {
    records: Arc<DashMap<IpAddr, Arc<SafetyRecord>>>,
    blacklist_duration: Duration,
}

impl SafetyRegistry {
    pub fn new(blacklist_minutes: u32) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            blacklist_duration: Duration::from_secs(u64::from(blacklist_minutes) * 60),
        }
    }

    /// Consult the registry for a connecting IP.
    ///
    /// Returns `None` if the IP is blacklisted (no side effects). Otherwise
    /// returns the record, creating it on first contact and spawning its
    /// expiry task.
    pub fn check(&self, ip: IpAddr) -> Option<Arc<SafetyRecord>> {
        if let Some(existing) = self.records.get(&ip) {
            let record = Arc::clone(existing.value());
            drop(existing);
            if record.is_blacklisted() {
                log::error!(peer = %ip, "rejecting client from blacklisted ip");
                return None;
            }
            return Some(record);
        }

        let record = Arc::new(SafetyRecord::new(ip, Instant::now() + BASE_PENALTY));
        // A concurrent insert for the same IP wins; use whichever landed.
        let record = Arc::clone(
            self.records
                .entry(ip)
                .or_insert_with(|| {
                    self.spawn_expiry(Arc::clone(&record));
                    record
                })
                .value(),
        );
        if record.is_blacklisted() {
            log::error!(peer = %ip, "rejecting client from blacklisted ip");
            return None;
        }
        Some(record)
    }

    /// Record an authentication failure, escalating to a blacklist with
    /// forced connection teardown past the threshold.
    pub fn record_failure(&self, record: &Arc<SafetyRecord>) {
        let aborted = {
            let mut state = record.state.lock().unwrap();
            state.failures += 1;
            let now = Instant::now();
            if state.failures <= FAILURE_THRESHOLD {
                let penalty = BASE_PENALTY * state.failures;
                state.deadline = state.deadline.max(now + penalty);
                None
            } else {
                state.deadline = state.deadline.max(now + self.blacklist_duration);
                for token in state.conns.values() {
                    token.cancel();
                }
                Some(state.conns.len())
            }
        };
        if let Some(count) = aborted {
            log::error!(
                peer = %record.ip(),
                aborted = count,
                "auth failed too many times, ip blacklisted"
            );
        }
    }

    /// Record an authentication success: reset the failure streak
    pub fn record_success(&self, record: &Arc<SafetyRecord>) {
        let mut state = record.state.lock().unwrap();
        state.authenticated = true;
        state.failures = 0;
    }

    /// Number of tracked IPs
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Abort every tracked connection (listener shutdown)
    pub fn abort_all(&self) {
        for entry in self.records.iter() {
            entry.value().abort_connections();
        }
    }

    /// Wait for the record's deadline, re-waiting whenever it was pushed
    /// forward, then drop the record from the registry.
    fn spawn_expiry(&self, record: Arc<SafetyRecord>) {
        let records = Arc::clone(&self.records);
        tokio::spawn(async move {
            loop {
                let deadline = record.deadline();
                if deadline <= Instant::now() {
                    break;
                }
                tokio::time::sleep_until(deadline).await;
            }
            let ip = record.ip();
            records.remove_if(&ip, |_, existing| Arc::ptr_eq(existing, &record));
            log::debug!(peer = %ip, "safety record expired");
        });
    }
}
