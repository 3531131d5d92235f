// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! harvest-lanes
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// The four lanes of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneName {
    /// Discovery queries.
    Search,
    /// Page fetches.
    Fetch,
    /// HTML/PDF parsing.
    Parse,
    /// LLM calls.
    Llm,
}

impl LaneName {
    /// All lanes in canonical order.
    pub const ALL: [LaneName; 4] = [LaneName::Search, LaneName::Fetch, LaneName::Parse, LaneName::Llm];

    /// Parse a lane name; unknown names fail fast.
    ///
    /// # Errors
    ///
    /// [`LaneError::UnknownLane`] for anything outside the four names.
    pub fn parse(name: &str) -> Result<Self, LaneError> {
        match name {
            "search" => Ok(LaneName::Search),
            "fetch" => Ok(LaneName::Fetch),
            "parse" => Ok(LaneName::Parse),
            "llm" => Ok(LaneName::Llm),
            other => Err(LaneError::UnknownLane(other.to_string())),
        }
    }

    /// The wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LaneName::Search => "search",
            LaneName::Fetch => "fetch",
            LaneName::Parse => "parse",
            LaneName::Llm => "llm",
        }
    }

    fn index(self) -> usize {
        match self {
            LaneName::Search => 0,
            LaneName::Fetch => 1,
            LaneName::Parse => 2,
            LaneName::Llm => 3,
        }
    }

    /// Default concurrency cap for this lane.
    #[must_use]
    pub fn default_concurrency(self) -> usize {
        match self {
            LaneName::Search | LaneName::Llm => 2,
            LaneName::Fetch | LaneName::Parse => 4,
        }
    }
}

/// Errors from lane operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LaneError {
    /// The lane name is not one of `search`, `fetch`, `parse`, `llm`.
    #[error("unknown lane: {0}")]
    UnknownLane(String),
}

/// Mutable per-lane scheduling state.
#[derive(Debug)]
struct LaneState {
    concurrency: usize,
    paused: bool,
    running: usize,
    started: u64,
    completed: u64,
    budget_rejected: u64,
    /// Next ticket to hand out on submission.
    next_ticket: u64,
    /// The ticket currently allowed to start. Strict FIFO: only the head
    /// ticket may begin, so submissions start in order.
    now_serving: u64,
}

impl LaneState {
    fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            paused: false,
            running: 0,
            started: 0,
            completed: 0,
            budget_rejected: 0,
            next_ticket: 0,
            now_serving: 0,
        }
    }

    fn idle(&self) -> bool {
        self.running == 0 && self.next_ticket == self.now_serving
    }
}

/// Counters and settings for one lane, as returned by
/// [`LaneManager::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSnapshot {
    /// Concurrency cap.
    pub concurrency: usize,
    /// Whether the lane is paused.
    pub paused: bool,
    /// Tasks currently running.
    pub running: usize,
    /// Tasks started since construction.
    pub started: u64,
    /// Tasks completed since construction.
    pub completed: u64,
    /// Tasks vetoed by a budget check before starting.
    pub budget_rejected: u64,
}

/// Snapshot of all four lanes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanesSnapshot {
    /// Search lane.
    pub search: LaneSnapshot,
    /// Fetch lane.
    pub fetch: LaneSnapshot,
    /// Parse lane.
    pub parse: LaneSnapshot,
    /// LLM lane.
    pub llm: LaneSnapshot,
}

/// The lane manager: four cooperative single-owner schedulers.
///
/// Tasks are futures; parallelism within a lane is bounded by the lane's
/// concurrency cap and submissions preserve FIFO start order. The manager
/// never reorders by priority.
pub struct LaneManager {
    lanes: [Mutex<LaneState>; 4],
    /// Generation counter bumped on every state change; waiters watch it
    /// so a freed slot, resume, or concurrency bump is never missed.
    generation: watch::Sender<u64>,
}

impl LaneManager {
    /// Build a manager with the default caps (search 2, fetch 4, parse 4,
    /// llm 2).
    #[must_use]
    pub fn new() -> Self {
        Self::with_concurrency(2, 4, 4, 2)
    }

    /// Build a manager with explicit caps. Each cap is clamped to ≥ 1.
    #[must_use]
    pub fn with_concurrency(search: usize, fetch: usize, parse: usize, llm: usize) -> Self {
        let (generation, _) = watch::channel(0u64);
        Self {
            lanes: [
                Mutex::new(LaneState::new(search.max(1))),
                Mutex::new(LaneState::new(fetch.max(1))),
                Mutex::new(LaneState::new(parse.max(1))),
                Mutex::new(LaneState::new(llm.max(1))),
            ],
            generation,
        }
    }

    fn state(&self, lane: LaneName) -> &Mutex<LaneState> {
        &self.lanes[lane.index()]
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Run `task` on `lane`, waiting for a free slot. FIFO among
    /// submissions to the same lane.
    ///
    /// # Errors
    ///
    /// [`LaneError::UnknownLane`] when `lane` is not a known lane name.
    pub async fn dispatch<F, T>(&self, lane: &str, task: F) -> Result<T, LaneError>
    where
        F: Future<Output = T>,
    {
        let lane = LaneName::parse(lane)?;
        Ok(self
            .dispatch_inner(lane, task, None::<fn() -> bool>)
            .await
            .expect("unguarded dispatch cannot be budget-rejected"))
    }

    /// Run `task` on `lane` unless `check` returns `false` at start time.
    ///
    /// The check runs when the task reaches the head of the lane, right
    /// before it would begin. A failed check increments `budget_rejected`
    /// and returns `Ok(None)` without starting the task.
    ///
    /// # Errors
    ///
    /// [`LaneError::UnknownLane`] when `lane` is not a known lane name.
    pub async fn dispatch_with_budget<F, T, C>(
        &self,
        lane: &str,
        task: F,
        check: C,
    ) -> Result<Option<T>, LaneError>
    where
        F: Future<Output = T>,
        C: Fn() -> bool,
    {
        let lane = LaneName::parse(lane)?;
        Ok(self.dispatch_inner(lane, task, Some(check)).await)
    }

    async fn dispatch_inner<F, T, C>(&self, lane: LaneName, task: F, check: Option<C>) -> Option<T>
    where
        F: Future<Output = T>,
        C: Fn() -> bool,
    {
        // Take a ticket; strict FIFO means only the head ticket may start.
        let ticket = {
            let mut st = self.state(lane).lock().expect("lane state poisoned");
            let t = st.next_ticket;
            st.next_ticket += 1;
            t
        };

        let mut rx = self.generation.subscribe();
        rx.mark_changed(); // evaluate the condition at least once
        loop {
            let _ = rx.changed().await;
            let mut st = self.state(lane).lock().expect("lane state poisoned");
            if st.now_serving != ticket || st.paused || st.running >= st.concurrency {
                continue;
            }
            // Head of the line with a free slot: budget gate, then start.
            if let Some(check) = &check
                && !check()
            {
                st.budget_rejected += 1;
                st.now_serving += 1;
                drop(st);
                self.bump();
                debug!(lane = lane.as_str(), ticket, "budget_rejected");
                return None;
            }
            st.now_serving += 1;
            st.running += 1;
            st.started += 1;
            drop(st);
            self.bump();
            break;
        }

        let out = task.await;

        {
            let mut st = self.state(lane).lock().expect("lane state poisoned");
            st.running -= 1;
            st.completed += 1;
        }
        self.bump();
        Some(out)
    }

    /// Pause a lane. In-flight tasks run to completion; queued tasks wait.
    ///
    /// # Errors
    ///
    /// [`LaneError::UnknownLane`] when `lane` is not a known lane name.
    pub fn pause(&self, lane: &str) -> Result<(), LaneError> {
        let lane = LaneName::parse(lane)?;
        self.state(lane).lock().expect("lane state poisoned").paused = true;
        self.bump();
        Ok(())
    }

    /// Resume a paused lane.
    ///
    /// # Errors
    ///
    /// [`LaneError::UnknownLane`] when `lane` is not a known lane name.
    pub fn resume(&self, lane: &str) -> Result<(), LaneError> {
        let lane = LaneName::parse(lane)?;
        self.state(lane).lock().expect("lane state poisoned").paused = false;
        self.bump();
        Ok(())
    }

    /// Set a lane's concurrency cap, clamped to ≥ 1. Takes effect for the
    /// next start; running tasks are unaffected.
    ///
    /// # Errors
    ///
    /// [`LaneError::UnknownLane`] when `lane` is not a known lane name.
    pub fn set_concurrency(&self, lane: &str, n: usize) -> Result<(), LaneError> {
        let lane = LaneName::parse(lane)?;
        self.state(lane)
            .lock()
            .expect("lane state poisoned")
            .concurrency = n.max(1);
        self.bump();
        Ok(())
    }

    /// Wait until every lane is idle (nothing running, nothing queued).
    /// Paused lanes with queued work never become idle, so `drain` on a
    /// paused, non-empty lane waits for a resume.
    pub async fn drain(&self) {
        let mut rx = self.generation.subscribe();
        rx.mark_changed();
        loop {
            let _ = rx.changed().await;
            let all_idle = LaneName::ALL.iter().all(|lane| {
                self.state(*lane)
                    .lock()
                    .expect("lane state poisoned")
                    .idle()
            });
            if all_idle {
                return;
            }
        }
    }

    fn snapshot_lane(&self, lane: LaneName) -> LaneSnapshot {
        let st = self.state(lane).lock().expect("lane state poisoned");
        LaneSnapshot {
            concurrency: st.concurrency,
            paused: st.paused,
            running: st.running,
            started: st.started,
            completed: st.completed,
            budget_rejected: st.budget_rejected,
        }
    }

    /// Snapshot all four lanes.
    #[must_use]
    pub fn snapshot(&self) -> LanesSnapshot {
        LanesSnapshot {
            search: self.snapshot_lane(LaneName::Search),
            fetch: self.snapshot_lane(LaneName::Fetch),
            parse: self.snapshot_lane(LaneName::Parse),
            llm: self.snapshot_lane(LaneName::Llm),
        }
    }
}

impl Default for LaneManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};

    #[tokio::test]
    async fn unknown_lane_fails_fast() {
        let mgr = LaneManager::new();
        let err = mgr.dispatch("render", async { 1 }).await.unwrap_err();
        assert_eq!(err, LaneError::UnknownLane("render".into()));
        assert!(mgr.pause("renderer").is_err());
    }

    #[tokio::test]
    async fn dispatch_runs_and_counts() {
        let mgr = LaneManager::new();
        let out = mgr.dispatch("fetch", async { 40 + 2 }).await.unwrap();
        assert_eq!(out, 42);
        let snap = mgr.snapshot();
        assert_eq!(snap.fetch.started, 1);
        assert_eq!(snap.fetch.completed, 1);
        assert_eq!(snap.fetch.running, 0);
    }

    #[tokio::test]
    async fn concurrency_cap_is_enforced() {
        let mgr = Arc::new(LaneManager::with_concurrency(2, 2, 2, 2));
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            let peak = Arc::clone(&peak);
            let live = Arc::clone(&live);
            handles.push(tokio::spawn(async move {
                mgr.dispatch("fetch", async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(mgr.snapshot().fetch.completed, 8);
    }

    #[tokio::test]
    async fn fifo_start_order_is_preserved() {
        let mgr = Arc::new(LaneManager::with_concurrency(1, 1, 1, 1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = vec![];
        for i in 0..5u32 {
            let mgr = Arc::clone(&mgr);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                mgr.dispatch("parse", async move {
                    order.lock().unwrap().push(i);
                })
                .await
                .unwrap();
            }));
            // Make submission order deterministic across spawned tasks.
            tokio::task::yield_now().await;
            sleep(Duration::from_millis(2)).await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn pause_blocks_new_starts_only() {
        let mgr = Arc::new(LaneManager::new());
        mgr.pause("search").unwrap();

        let mgr2 = Arc::clone(&mgr);
        let handle = tokio::spawn(async move { mgr2.dispatch("search", async { 7 }).await });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.snapshot().search.started, 0);

        mgr.resume("search").unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 7);
        assert_eq!(mgr.snapshot().search.completed, 1);
    }

    #[tokio::test]
    async fn budget_rejection_skips_task() {
        let mgr = LaneManager::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let out = mgr
            .dispatch_with_budget(
                "llm",
                async move {
                    ran2.fetch_add(1, Ordering::SeqCst);
                },
                || false,
            )
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let snap = mgr.snapshot();
        assert_eq!(snap.llm.budget_rejected, 1);
        assert_eq!(snap.llm.started, 0);
    }

    #[tokio::test]
    async fn budget_pass_runs_task() {
        let mgr = LaneManager::new();
        let out = mgr
            .dispatch_with_budget("llm", async { "ok" }, || true)
            .await
            .unwrap();
        assert_eq!(out, Some("ok"));
        assert_eq!(mgr.snapshot().llm.budget_rejected, 0);
    }

    #[tokio::test]
    async fn set_concurrency_clamps_to_one() {
        let mgr = LaneManager::new();
        mgr.set_concurrency("fetch", 0).unwrap();
        assert_eq!(mgr.snapshot().fetch.concurrency, 1);
        mgr.set_concurrency("fetch", 9).unwrap();
        assert_eq!(mgr.snapshot().fetch.concurrency, 9);
    }

    #[tokio::test]
    async fn drain_waits_for_all_lanes() {
        let mgr = Arc::new(LaneManager::new());
        let mut handles = vec![];
        for lane in ["search", "fetch", "parse", "llm"] {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                mgr.dispatch(lane, async {
                    sleep(Duration::from_millis(15)).await;
                })
                .await
                .unwrap();
            }));
        }
        sleep(Duration::from_millis(5)).await;
        mgr.drain().await;
        let snap = mgr.snapshot();
        assert_eq!(snap.search.completed, 1);
        assert_eq!(snap.fetch.completed, 1);
        assert_eq!(snap.parse.completed, 1);
        assert_eq!(snap.llm.completed, 1);
        for h in handles {
            h.await.unwrap();
        }
    }
}
