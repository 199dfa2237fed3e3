//! Minion health tracking with heartbeats.
//!
//! Minions report heartbeats from many network-handling threads; a single
//! coordinator loop calls [`MinionHealthTracker::check_health`] periodically
//! to find minions that went silent without crashing the build.
//!
//! The coordinator itself can be slow (GC pauses, overloaded host). When the
//! gap between two checks exceeds the slow threshold, the per-minion scan is
//! skipped so a minion is not declared dead for silence the coordinator
//! caused, but only for a bounded number of consecutive slow checks.

use crate::events::{BuildEvent, EventBus};
use dbc_common::config::HealthConfig;
use dbc_common::{Clock, MinionId, RunId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Health tracker configuration.
#[derive(Debug, Clone)]
pub struct HealthTrackerConfig {
    /// Silence after which a minion is reported dead (ms).
    pub max_silence_ms: u64,
    /// Heartbeat or check gap that counts as slow (ms).
    pub slow_heartbeat_warning_ms: u64,
    /// Consecutive slow checks tolerated before scanning anyway.
    pub max_consecutive_slow_checks: u32,
}

impl Default for HealthTrackerConfig {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthTrackerConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            max_silence_ms: config.max_silence_ms,
            slow_heartbeat_warning_ms: config.slow_heartbeat_warning_ms,
            max_consecutive_slow_checks: config.max_consecutive_slow_checks,
        }
    }
}

/// A heartbeat that arrived later than the slow threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlowHeartbeat {
    pub minion_id: MinionId,
    pub run_id: RunId,
    pub gap_ms: u64,
    pub reported_at_ms: u64,
}

#[derive(Debug)]
struct HeartbeatState {
    run_id: RunId,
    last_heartbeat_ms: u64,
    heartbeats: u64,
    slow_heartbeats: u64,
    max_gap_ms: u64,
}

/// Heartbeat bookkeeping for one minion.
///
/// Created on first contact and never removed. All mutation goes through
/// [`MinionRecord::report_heartbeat`], serialized by the record's own lock
/// so heartbeats for different minions never contend.
#[derive(Debug)]
pub struct MinionRecord {
    minion_id: MinionId,
    slow_heartbeat_warning_ms: u64,
    state: Mutex<HeartbeatState>,
}

impl MinionRecord {
    fn new(minion_id: MinionId, run_id: RunId, now_ms: u64, slow_heartbeat_warning_ms: u64) -> Self {
        Self {
            minion_id,
            slow_heartbeat_warning_ms,
            state: Mutex::new(HeartbeatState {
                run_id,
                last_heartbeat_ms: now_ms,
                heartbeats: 1,
                slow_heartbeats: 0,
                max_gap_ms: 0,
            }),
        }
    }

    /// Record a heartbeat at `now_ms`.
    ///
    /// Returns the slow-heartbeat sample when the gap since the previous
    /// heartbeat exceeds the threshold. Timestamps never move backwards: a
    /// heartbeat older than the recorded one only updates the run id.
    pub fn report_heartbeat(&self, run_id: RunId, now_ms: u64) -> Option<SlowHeartbeat> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heartbeats += 1;
        state.run_id = run_id;

        let gap_ms = now_ms.saturating_sub(state.last_heartbeat_ms);
        state.last_heartbeat_ms = state.last_heartbeat_ms.max(now_ms);
        state.max_gap_ms = state.max_gap_ms.max(gap_ms);

        if gap_ms > self.slow_heartbeat_warning_ms {
            state.slow_heartbeats += 1;
            return Some(SlowHeartbeat {
                minion_id: self.minion_id.clone(),
                run_id: state.run_id.clone(),
                gap_ms,
                reported_at_ms: now_ms,
            });
        }
        None
    }

    pub fn minion_id(&self) -> &MinionId {
        &self.minion_id
    }

    pub fn run_id(&self) -> RunId {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .run_id
            .clone()
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_heartbeat_ms
    }

    fn stats(&self) -> HeartbeatStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        HeartbeatStats {
            minion_id: self.minion_id.clone(),
            run_id: state.run_id.clone(),
            heartbeats: state.heartbeats,
            slow_heartbeats: state.slow_heartbeats,
            max_gap_ms: state.max_gap_ms,
            last_heartbeat_ms: state.last_heartbeat_ms,
        }
    }
}

/// A minion that exceeded the silence limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadMinion {
    pub minion_id: MinionId,
    pub run_id: RunId,
    pub last_heartbeat_ms: u64,
    pub silence_ms: u64,
}

/// Result of one [`MinionHealthTracker::check_health`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub dead: Vec<DeadMinion>,
    pub alive: Vec<MinionId>,
    /// False when the scan was skipped because the coordinator was slow.
    pub scanned: bool,
}

impl HealthSnapshot {
    pub fn has_alive_minions(&self) -> bool {
        !self.alive.is_empty()
    }

    pub fn is_dead(&self, minion_id: &MinionId) -> bool {
        self.dead.iter().any(|d| &d.minion_id == minion_id)
    }

    pub fn is_alive(&self, minion_id: &MinionId) -> bool {
        self.alive.contains(minion_id)
    }

    /// Post a `MinionDead` event per dead minion.
    pub fn post_dead_minions(&self, events: &EventBus) {
        for dead in &self.dead {
            events.post(BuildEvent::MinionDead {
                minion_id: dead.minion_id.clone(),
                silence_ms: dead.silence_ms,
            });
        }
    }
}

/// Per-minion heartbeat statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatStats {
    pub minion_id: MinionId,
    pub run_id: RunId,
    pub heartbeats: u64,
    pub slow_heartbeats: u64,
    pub max_gap_ms: u64,
    pub last_heartbeat_ms: u64,
}

#[derive(Debug, Default)]
struct CheckState {
    last_check_ms: Option<u64>,
    consecutive_slow_checks: u32,
}

/// Detects minions that stopped sending heartbeats.
pub struct MinionHealthTracker {
    config: HealthTrackerConfig,
    clock: Arc<dyn Clock>,
    minions: RwLock<HashMap<MinionId, Arc<MinionRecord>>>,
    untracked: RwLock<HashSet<MinionId>>,
    slow_samples: Mutex<Vec<SlowHeartbeat>>,
    check_state: Mutex<CheckState>,
}

impl MinionHealthTracker {
    pub fn new(config: HealthTrackerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            minions: RwLock::new(HashMap::new()),
            untracked: RwLock::new(HashSet::new()),
            slow_samples: Mutex::new(Vec::new()),
            check_state: Mutex::new(CheckState::default()),
        }
    }

    /// Record a heartbeat from `minion_id`. Idempotent upsert.
    pub fn report_alive(&self, minion_id: &MinionId, run_id: &RunId) {
        let now_ms = self.clock.now_millis();

        let existing = {
            let minions = self.minions.read().unwrap_or_else(|e| e.into_inner());
            minions.get(minion_id).cloned()
        };

        let record = match existing {
            Some(record) => record,
            None => {
                let mut minions = self.minions.write().unwrap_or_else(|e| e.into_inner());
                match minions.get(minion_id) {
                    Some(record) => Arc::clone(record),
                    None => {
                        debug!("First heartbeat from minion {} (run {})", minion_id, run_id);
                        minions.insert(
                            minion_id.clone(),
                            Arc::new(MinionRecord::new(
                                minion_id.clone(),
                                run_id.clone(),
                                now_ms,
                                self.config.slow_heartbeat_warning_ms,
                            )),
                        );
                        return;
                    }
                }
            }
        };

        if let Some(sample) = record.report_heartbeat(run_id.clone(), now_ms) {
            warn!(
                "Slow heartbeat from minion {} (run {}): {}ms since previous (threshold {}ms)",
                sample.minion_id, sample.run_id, sample.gap_ms, self.config.slow_heartbeat_warning_ms
            );
            self.slow_samples
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(sample);
        }
    }

    /// Classify every tracked minion as dead or alive.
    ///
    /// The first call always scans. Later calls skip the scan while the gap
    /// since the previous check exceeds the slow threshold, up to
    /// `max_consecutive_slow_checks` times in a row.
    pub fn check_health(&self) -> HealthSnapshot {
        let now_ms = self.clock.now_millis();

        {
            let mut check = self.check_state.lock().unwrap_or_else(|e| e.into_inner());
            let previous = check.last_check_ms.replace(now_ms);
            if let Some(previous) = previous {
                let elapsed = now_ms.saturating_sub(previous);
                if elapsed > self.config.slow_heartbeat_warning_ms {
                    check.consecutive_slow_checks += 1;
                    if check.consecutive_slow_checks <= self.config.max_consecutive_slow_checks {
                        warn!(
                            "Health check ran {}ms after the previous one (threshold {}ms); \
                             skipping minion scan ({}/{} consecutive slow checks)",
                            elapsed,
                            self.config.slow_heartbeat_warning_ms,
                            check.consecutive_slow_checks,
                            self.config.max_consecutive_slow_checks
                        );
                        drop(check);
                        return self.unscanned_snapshot();
                    }
                    info!(
                        "Scanning minions despite {} consecutive slow health checks",
                        check.consecutive_slow_checks
                    );
                    check.consecutive_slow_checks = 0;
                } else {
                    check.consecutive_slow_checks = 0;
                }
            }
        }

        self.scan(now_ms)
    }

    fn scan(&self, now_ms: u64) -> HealthSnapshot {
        let untracked = self.untracked.read().unwrap_or_else(|e| e.into_inner());
        let minions = self.minions.read().unwrap_or_else(|e| e.into_inner());

        let mut snapshot = HealthSnapshot {
            scanned: true,
            ..Default::default()
        };
        for (minion_id, record) in minions.iter() {
            if untracked.contains(minion_id) {
                continue;
            }
            let last_heartbeat_ms = record.last_heartbeat_ms();
            let silence_ms = now_ms.saturating_sub(last_heartbeat_ms);
            if silence_ms > self.config.max_silence_ms {
                warn!(
                    "Minion {} silent for {}ms (limit {}ms); reporting dead",
                    minion_id, silence_ms, self.config.max_silence_ms
                );
                snapshot.dead.push(DeadMinion {
                    minion_id: minion_id.clone(),
                    run_id: record.run_id(),
                    last_heartbeat_ms,
                    silence_ms,
                });
            } else {
                snapshot.alive.push(minion_id.clone());
            }
        }

        snapshot.dead.sort_by(|a, b| a.minion_id.cmp(&b.minion_id));
        snapshot.alive.sort();
        snapshot
    }

    fn unscanned_snapshot(&self) -> HealthSnapshot {
        let untracked = self.untracked.read().unwrap_or_else(|e| e.into_inner());
        let minions = self.minions.read().unwrap_or_else(|e| e.into_inner());
        let mut alive: Vec<MinionId> = minions
            .keys()
            .filter(|id| !untracked.contains(*id))
            .cloned()
            .collect();
        alive.sort();
        HealthSnapshot {
            dead: Vec::new(),
            alive,
            scanned: false,
        }
    }

    /// Permanently exclude `minion_id` from classification. History is kept.
    pub fn stop_tracking_forever(&self, minion_id: &MinionId) {
        let inserted = self
            .untracked
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(minion_id.clone());
        if inserted {
            info!("Minion {} retired; no longer tracked", minion_id);
        }
    }

    pub fn is_tracked(&self, minion_id: &MinionId) -> bool {
        let known = self
            .minions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(minion_id);
        known
            && !self
                .untracked
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(minion_id)
    }

    /// Number of minions ever seen.
    pub fn known_minions(&self) -> usize {
        self.minions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of minions retired via [`Self::stop_tracking_forever`].
    pub fn retired_minions(&self) -> usize {
        self.untracked.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Slow heartbeat samples recorded so far.
    pub fn slow_heartbeats(&self) -> Vec<SlowHeartbeat> {
        self.slow_samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Heartbeat statistics for every minion ever seen, sorted by id.
    pub fn heartbeat_stats(&self) -> Vec<HeartbeatStats> {
        let minions = self.minions.read().unwrap_or_else(|e| e.into_inner());
        let mut stats: Vec<HeartbeatStats> = minions.values().map(|r| r.stats()).collect();
        stats.sort_by(|a, b| a.minion_id.cmp(&b.minion_id));
        stats
    }
}
