use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use phasegate_core::config::BudgetConfig;
use phasegate_core::error::PhasegateError;
use phasegate_core::types::RunId;

/// Which cap was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Run,
    Global,
    RunTime,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Run => "run",
            Self::Global => "global",
            Self::RunTime => "run_time",
        };
        write!(f, "{}", s)
    }
}

/// A cap exceeded by a reservation, a commit, or elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetBreach {
    pub scope: BudgetScope,
    pub consumed: f64,
    pub cap: f64,
}

impl From<BudgetBreach> for PhasegateError {
    fn from(b: BudgetBreach) -> Self {
        PhasegateError::BudgetBreach {
            scope: b.scope.to_string(),
            consumed: b.consumed,
            cap: b.cap,
        }
    }
}

/// Per-run budget state, persisted in every run snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub cap: f64,
    pub consumed: f64,
    #[serde(default)]
    pub reserved: f64,
    #[serde(default)]
    pub time_cap_secs: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<RunId, BudgetSnapshot>,
    global_cap: Option<f64>,
    global_consumed: f64,
    global_reserved: f64,
}

/// Tracks cumulative cost and time against run caps that roll up into an
/// optional global cap.
///
/// Counters sit behind one `RwLock`: a single mutator at a time, concurrent
/// readers for status queries.
#[derive(Debug)]
pub struct BudgetGuard {
    default_time_cap: Option<u64>,
    inner: RwLock<Inner>,
}

impl BudgetGuard {
    pub fn new(config: &BudgetConfig) -> Self {
        Self {
            default_time_cap: config.run_time_cap_secs,
            inner: RwLock::new(Inner {
                global_cap: config.global_cost_cap,
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Start tracking a run with the given cost cap.
    pub fn open_run(&self, run_id: &RunId, cap: f64) {
        let snapshot = BudgetSnapshot {
            cap,
            consumed: 0.0,
            reserved: 0.0,
            time_cap_secs: self.default_time_cap,
        };
        self.write().runs.insert(run_id.clone(), snapshot);
    }

    /// Reinstate a run recovered from the store. Outstanding reservations
    /// belonged to executions that no longer exist, so they are dropped.
    pub fn restore(&self, run_id: &RunId, snapshot: &BudgetSnapshot) {
        let mut inner = self.write();
        inner.global_consumed += snapshot.consumed;
        inner.runs.insert(
            run_id.clone(),
            BudgetSnapshot {
                reserved: 0.0,
                ..snapshot.clone()
            },
        );
    }

    /// Reserve `estimate` before dispatch. Fails if the reservation would
    /// push the run or the global scope past its cap.
    pub fn reserve(&self, run_id: &RunId, estimate: f64) -> bool {
        let mut inner = self.write();
        let global_cap = inner.global_cap;
        let global_used = inner.global_consumed + inner.global_reserved;
        let Some(run) = inner.runs.get_mut(run_id) else {
            warn!(run_id = %run_id, "Reserve on untracked run");
            return false;
        };

        if run.consumed + run.reserved + estimate > run.cap {
            debug!(run_id = %run_id, estimate, cap = run.cap, "Run reservation refused");
            return false;
        }
        if let Some(cap) = global_cap {
            if global_used + estimate > cap {
                debug!(run_id = %run_id, estimate, cap, "Global reservation refused");
                return false;
            }
        }

        run.reserved += estimate;
        inner.global_reserved += estimate;
        true
    }

    /// Return an unused reservation (timeout, kill, or failed dispatch).
    pub fn release(&self, run_id: &RunId, estimate: f64) {
        let mut inner = self.write();
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.reserved = (run.reserved - estimate).max(0.0);
        }
        inner.global_reserved = (inner.global_reserved - estimate).max(0.0);
    }

    /// Convert a reservation into actual spend. The spend is recorded even
    /// when it breaches; the breach is reported to the caller.
    pub fn commit(&self, run_id: &RunId, estimate: f64, actual: f64) -> Result<(), BudgetBreach> {
        let mut inner = self.write();
        inner.global_reserved = (inner.global_reserved - estimate).max(0.0);
        inner.global_consumed += actual;
        let global_cap = inner.global_cap;
        let global_consumed = inner.global_consumed;

        let Some(run) = inner.runs.get_mut(run_id) else {
            return Ok(());
        };
        run.reserved = (run.reserved - estimate).max(0.0);
        run.consumed += actual;

        if run.consumed > run.cap {
            return Err(BudgetBreach {
                scope: BudgetScope::Run,
                consumed: run.consumed,
                cap: run.cap,
            });
        }
        if let Some(cap) = global_cap {
            if global_consumed > cap {
                return Err(BudgetBreach {
                    scope: BudgetScope::Global,
                    consumed: global_consumed,
                    cap,
                });
            }
        }
        Ok(())
    }

    /// Remaining spend for a run, bounded by the global headroom.
    pub fn remaining(&self, run_id: &RunId) -> f64 {
        let inner = self.read();
        let Some(run) = inner.runs.get(run_id) else {
            return 0.0;
        };
        let local = run.cap - run.consumed - run.reserved;
        let remaining = match inner.global_cap {
            Some(cap) => local.min(cap - inner.global_consumed - inner.global_reserved),
            None => local,
        };
        remaining.max(0.0)
    }

    /// The breach a reservation of `estimate` would cause, for gate reporting.
    pub fn would_breach(&self, run_id: &RunId, estimate: f64) -> Option<BudgetBreach> {
        let inner = self.read();
        let run = inner.runs.get(run_id)?;
        let projected = run.consumed + run.reserved + estimate;
        if projected > run.cap {
            return Some(BudgetBreach {
                scope: BudgetScope::Run,
                consumed: projected,
                cap: run.cap,
            });
        }
        let cap = inner.global_cap?;
        let projected = inner.global_consumed + inner.global_reserved + estimate;
        (projected > cap).then_some(BudgetBreach {
            scope: BudgetScope::Global,
            consumed: projected,
            cap,
        })
    }

    /// Raise a run's cost cap.
    pub fn extend(&self, run_id: &RunId, amount: f64) {
        if let Some(run) = self.write().runs.get_mut(run_id) {
            run.cap += amount;
        }
    }

    /// Raise the global cost cap.
    pub fn extend_global(&self, amount: f64) {
        let mut inner = self.write();
        if let Some(cap) = inner.global_cap.as_mut() {
            *cap += amount;
        }
    }

    /// Raise a run's wall-clock cap.
    pub fn extend_time(&self, run_id: &RunId, secs: u64) {
        if let Some(run) = self.write().runs.get_mut(run_id) {
            if let Some(cap) = run.time_cap_secs.as_mut() {
                *cap += secs;
            }
        }
    }

    /// Extend whichever cap a breach named by `ratio` of its current value.
    pub fn extend_after_approval(&self, run_id: &RunId, scope: BudgetScope, ratio: f64) {
        match scope {
            BudgetScope::Run => {
                let cap = self.snapshot(run_id).map(|s| s.cap).unwrap_or_default();
                self.extend(run_id, cap * ratio);
            }
            BudgetScope::Global => {
                let cap = self.read().global_cap.unwrap_or_default();
                self.extend_global(cap * ratio);
            }
            BudgetScope::RunTime => {
                let cap = self
                    .snapshot(run_id)
                    .and_then(|s| s.time_cap_secs)
                    .unwrap_or_default();
                self.extend_time(run_id, (cap as f64 * ratio).ceil() as u64);
            }
        }
    }

    /// Check the run's wall-clock cap.
    pub fn check_time(
        &self,
        run_id: &RunId,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetBreach> {
        let inner = self.read();
        let Some(cap) = inner.runs.get(run_id).and_then(|r| r.time_cap_secs) else {
            return Ok(());
        };
        let elapsed = (now - started_at).num_seconds().max(0) as u64;
        if elapsed > cap {
            return Err(BudgetBreach {
                scope: BudgetScope::RunTime,
                consumed: elapsed as f64,
                cap: cap as f64,
            });
        }
        Ok(())
    }

    pub fn snapshot(&self, run_id: &RunId) -> Option<BudgetSnapshot> {
        self.read().runs.get(run_id).cloned()
    }

    /// Release whatever the run still holds. The run's spend stays counted
    /// against the global cap.
    pub fn close_run(&self, run_id: &RunId) {
        let mut inner = self.write();
        let reserved = inner.runs.get(run_id).map(|r| r.reserved).unwrap_or_default();
        inner.global_reserved = (inner.global_reserved - reserved).max(0.0);
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.reserved = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(global: Option<f64>) -> BudgetGuard {
        BudgetGuard::new(&BudgetConfig {
            run_cost_cap: Some(10.0),
            global_cost_cap: global,
            ..Default::default()
        })
    }

    #[test]
    fn reserve_commit_remaining() {
        let g = guard(None);
        let run = RunId::from_string("r1");
        g.open_run(&run, 10.0);

        assert!(g.reserve(&run, 4.0));
        assert_eq!(g.remaining(&run), 6.0);
        g.commit(&run, 4.0, 3.0).unwrap();
        assert_eq!(g.remaining(&run), 7.0);
        assert!(!g.reserve(&run, 8.0));
        assert!(g.reserve(&run, 7.0));
    }

    #[test]
    fn commit_over_cap_is_a_breach_but_recorded() {
        let g = guard(None);
        let run = RunId::from_string("r1");
        g.open_run(&run, 10.0);
        assert!(g.reserve(&run, 2.0));
        let breach = g.commit(&run, 2.0, 12.5).unwrap_err();
        assert_eq!(breach.scope, BudgetScope::Run);
        assert_eq!(breach.consumed, 12.5);
        assert_eq!(g.snapshot(&run).unwrap().consumed, 12.5);
        assert_eq!(g.remaining(&run), 0.0);
    }

    #[test]
    fn runs_roll_up_into_global_cap() {
        let g = guard(Some(15.0));
        let a = RunId::from_string("a");
        let b = RunId::from_string("b");
        g.open_run(&a, 10.0);
        g.open_run(&b, 10.0);

        assert!(g.reserve(&a, 8.0));
        g.commit(&a, 8.0, 8.0).unwrap();
        assert!(!g.reserve(&b, 8.0), "global headroom is only 7");
        assert_eq!(
            g.would_breach(&b, 8.0).map(|b| b.scope),
            Some(BudgetScope::Global)
        );
        assert!(g.reserve(&b, 5.0));
        let breach = g.commit(&b, 5.0, 9.0).unwrap_err();
        assert_eq!(breach.scope, BudgetScope::Global);
    }

    #[test]
    fn approval_extends_cap_by_ratio() {
        let g = guard(None);
        let run = RunId::from_string("r1");
        g.open_run(&run, 10.0);
        let _ = g.commit(&run, 0.0, 11.0);
        g.extend_after_approval(&run, BudgetScope::Run, 0.5);
        assert_eq!(g.snapshot(&run).unwrap().cap, 15.0);
        assert_eq!(g.remaining(&run), 4.0);
    }

    #[test]
    fn time_cap() {
        let g = BudgetGuard::new(&BudgetConfig {
            run_cost_cap: Some(1.0),
            run_time_cap_secs: Some(60),
            ..Default::default()
        });
        let run = RunId::from_string("r1");
        g.open_run(&run, 1.0);
        let start = Utc::now();
        assert!(g.check_time(&run, start, start + chrono::Duration::seconds(30)).is_ok());
        let breach = g
            .check_time(&run, start, start + chrono::Duration::seconds(61))
            .unwrap_err();
        assert_eq!(breach.scope, BudgetScope::RunTime);
        g.extend_after_approval(&run, BudgetScope::RunTime, 0.5);
        assert!(g.check_time(&run, start, start + chrono::Duration::seconds(61)).is_ok());
    }

    #[test]
    fn release_returns_reservation() {
        let g = guard(Some(100.0));
        let run = RunId::from_string("r1");
        g.open_run(&run, 10.0);
        assert!(g.reserve(&run, 6.0));
        g.release(&run, 6.0);
        assert_eq!(g.remaining(&run), 10.0);
    }

    #[test]
    fn breach_converts_to_error() {
        let err: PhasegateError = BudgetBreach {
            scope: BudgetScope::Run,
            consumed: 12.0,
            cap: 10.0,
        }
        .into();
        assert_eq!(err.to_string(), "Budget breach (run): consumed 12.00 of cap 10.00");
    }
}
