//! Bounded worker pool over a stream of candidates.
//!
//! The scheduler owns the dispatch loop. Each row is first checked against the
//! size bounds and the ban list; rows that pass get a spawned fetch task. At
//! most `concurrency` tasks run at once, and a new one starts as soon as a slot
//! frees. Outcomes are settled on the scheduler task itself, so bookkeeping
//! needs no locking beyond what the ban list and telemetry already provide.

use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::banlist::{BanList, FailureReason};
use crate::png::SizeBounds;
use crate::telemetry::{Stage, Telemetry};
use crate::types::{CandidateRow, ErrorKind, Outcome, OutcomeKind, RejectReason};

use super::fetch::FetchWorker;

/// Counts for one run, exact once every dispatched row has settled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTally {
    /// Rows taken from the input, short-circuited or fetched
    pub dispatched: u64,
    pub accepted: u64,
    pub rejected: BTreeMap<&'static str, u64>,
    pub errored: BTreeMap<&'static str, u64>,
    /// Dispatch stopped on an external cancellation signal
    pub cancelled: bool,
    /// Dispatch stopped by the consecutive-error limit
    pub halted: Option<String>,
    /// Dataset URL of the last row dispatched
    pub last_dispatched: Option<String>,
}

impl RunTally {
    /// Outcomes settled so far.
    pub fn settled(&self) -> u64 {
        self.accepted + self.rejected.values().sum::<u64>() + self.errored.values().sum::<u64>()
    }

    pub fn rejected_for(&self, reason: RejectReason) -> u64 {
        self.rejected.get(reason.as_str()).copied().unwrap_or(0)
    }

    pub fn errored_for(&self, kind: ErrorKind) -> u64 {
        self.errored.get(kind.as_str()).copied().unwrap_or(0)
    }

    /// Dispatch ended before the input was exhausted.
    pub fn stopped_early(&self) -> bool {
        self.cancelled || self.halted.is_some()
    }

    fn count(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Accepted => self.accepted += 1,
            OutcomeKind::Rejected(reason) => *self.rejected.entry(reason.as_str()).or_default() += 1,
            OutcomeKind::Errored(kind) => *self.errored.entry(kind.as_str()).or_default() += 1,
        }
    }
}

/// Drives fetch workers over an input channel.
pub struct Scheduler {
    worker: Arc<FetchWorker>,
    bans: Arc<BanList>,
    telemetry: Arc<Telemetry>,
    bounds: SizeBounds,
    concurrency: usize,
    max_consecutive_errors: u32,
}

impl Scheduler {
    pub fn new(
        worker: Arc<FetchWorker>,
        bans: Arc<BanList>,
        telemetry: Arc<Telemetry>,
        bounds: SizeBounds,
        concurrency: usize,
    ) -> Self {
        Self {
            worker,
            bans,
            telemetry,
            bounds,
            concurrency: concurrency.max(1),
            max_consecutive_errors: 0,
        }
    }

    /// Halt dispatch after `limit` consecutive errored outcomes (0 disables).
    pub fn with_max_consecutive_errors(mut self, limit: u32) -> Self {
        self.max_consecutive_errors = limit;
        self
    }

    /// Run until the input is exhausted or dispatch is stopped, then wait for
    /// every in-flight fetch to settle.
    ///
    /// `on_outcome` sees every outcome exactly once, in completion order. If it
    /// fails, dispatch stops, in-flight fetches are still settled into the
    /// telemetry and ban list, and the first error is returned.
    pub async fn run<F, E>(
        &self,
        mut rows: mpsc::Receiver<CandidateRow>,
        cancel: CancellationToken,
        mut on_outcome: F,
    ) -> Result<RunTally, E>
    where
        F: FnMut(&Outcome) -> Result<(), E>,
    {
        let mut state = RunState::default();
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        let mut input_done = false;

        tracing::debug!(concurrency = self.concurrency, "Scheduler started");

        loop {
            if (input_done || state.stopping) && tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !state.stopping => {
                    tracing::info!(in_flight = tasks.len(), "Cancellation requested, no further dispatch");
                    state.tally.cancelled = true;
                    state.stopping = true;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(outcome) => self.settle(outcome, &mut state, &mut on_outcome),
                        Err(err) => {
                            // Only reachable if a task was aborted; panics are caught in the task.
                            tracing::error!(error = %err, "Fetch task lost");
                            self.telemetry.increment_stage(Stage::Internal);
                            state.tally.count(OutcomeKind::Errored(ErrorKind::Internal));
                        }
                    }
                }

                received = rows.recv(), if !state.stopping && !input_done && tasks.len() < self.concurrency => {
                    match received {
                        Some(row) => {
                            state.tally.dispatched += 1;
                            state.tally.last_dispatched = Some(row.url.clone());
                            match self.short_circuit(&row) {
                                Some(kind) => {
                                    let outcome = Outcome::short_circuit(row, kind);
                                    self.settle(outcome, &mut state, &mut on_outcome);
                                }
                                None => self.spawn(&mut tasks, row),
                            }
                        }
                        None => input_done = true,
                    }
                }

                else => break,
            }
        }

        // Stop the input reader if dispatch ended early.
        drop(rows);

        tracing::debug!(
            dispatched = state.tally.dispatched,
            settled = state.tally.settled(),
            "Scheduler finished"
        );

        match state.sink_error {
            Some(err) => Err(err),
            None => Ok(state.tally),
        }
    }

    /// Outcome for rows that never reach the network.
    fn short_circuit(&self, row: &CandidateRow) -> Option<OutcomeKind> {
        if !self.bounds.admits(row.width, row.height) {
            return Some(OutcomeKind::Rejected(RejectReason::WrongSize));
        }
        if self.bans.should_skip(&row.url) {
            return Some(OutcomeKind::Errored(ErrorKind::BanListedSkip));
        }
        None
    }

    fn spawn(&self, tasks: &mut JoinSet<Outcome>, row: CandidateRow) {
        let worker = self.worker.clone();
        let fallback = row.clone();
        tasks.spawn(async move {
            let started = Instant::now();
            match AssertUnwindSafe(worker.fetch(row)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(url = %fallback.url, panic = %message, "Fetch worker panicked");
                    Outcome {
                        row: fallback,
                        kind: OutcomeKind::Errored(ErrorKind::Internal),
                        alpha: None,
                        elapsed: started.elapsed(),
                        attempts: 1,
                        detail: Some(message),
                    }
                }
            }
        });
    }

    fn settle<F, E>(&self, outcome: Outcome, state: &mut RunState<E>, on_outcome: &mut F)
    where
        F: FnMut(&Outcome) -> Result<(), E>,
    {
        let stage = outcome.kind.stage();
        if outcome.attempts == 0 {
            self.telemetry.increment_stage(stage);
        } else {
            self.telemetry.record_stage(stage, outcome.elapsed);
        }
        state.tally.count(outcome.kind);

        if let OutcomeKind::Errored(kind) = outcome.kind {
            if let Some(reason) = FailureReason::from_error_kind(kind) {
                if self.bans.record_failure(&outcome.row.url, reason).is_some() {
                    self.telemetry.increment_stage(Stage::BanUrl);
                }
            }
        }

        match outcome.kind {
            OutcomeKind::Errored(ErrorKind::BanListedSkip) => {}
            OutcomeKind::Errored(_) => state.consecutive_errors += 1,
            _ => state.consecutive_errors = 0,
        }
        if self.max_consecutive_errors > 0
            && state.consecutive_errors >= self.max_consecutive_errors
            && state.tally.halted.is_none()
        {
            let reason = format!("{} consecutive errored outcomes", state.consecutive_errors);
            tracing::warn!(%reason, "Halting dispatch");
            state.tally.halted = Some(reason);
            state.stopping = true;
        }

        if state.sink_error.is_none() {
            if let Err(err) = on_outcome(&outcome) {
                tracing::error!(url = %outcome.row.url, "Outcome sink failed, stopping dispatch");
                state.sink_error = Some(err);
                state.stopping = true;
            }
        }
    }
}

struct RunState<E> {
    tally: RunTally,
    stopping: bool,
    consecutive_errors: u32,
    sink_error: Option<E>,
}

impl<E> Default for RunState<E> {
    fn default() -> Self {
        Self {
            tally: RunTally::default(),
            stopping: false,
            consecutive_errors: 0,
            sink_error: None,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::banlist::{BanEntry, BanPolicy, BanStatus};
    use crate::pipeline::fetch::FetchOptions;
    use crate::png::synth::SynthPng;
    use crate::source::{CannedResponse, MemorySource, SourceStats};
    use std::convert::Infallible;
    use std::time::Duration;

    struct Harness {
        scheduler: Scheduler,
        telemetry: Arc<Telemetry>,
        bans: Arc<BanList>,
        stats: Arc<SourceStats>,
    }

    fn harness(source: MemorySource, bans: BanList, concurrency: usize) -> Harness {
        let stats = source.stats();
        let telemetry = Arc::new(Telemetry::new());
        let bans = Arc::new(bans);
        let mut options = FetchOptions::default();
        options.retry.retry_delay_ms = 0;
        let worker = Arc::new(FetchWorker::new(Arc::new(source), telemetry.clone(), options));
        let scheduler = Scheduler::new(
            worker,
            bans.clone(),
            telemetry.clone(),
            SizeBounds::new(10, 100),
            concurrency,
        );
        Harness {
            scheduler,
            telemetry,
            bans,
            stats,
        }
    }

    fn feed(rows: Vec<CandidateRow>) -> mpsc::Receiver<CandidateRow> {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            tx.try_send(row).unwrap();
        }
        rx
    }

    fn url(i: usize) -> String {
        format!("https://example.org/{i}.png")
    }

    fn semi(w: u32, h: u32) -> Vec<u8> {
        SynthPng::rgba8(w, h, |x, y| [0, 0, 0, if (x + y) % 5 == 0 { 200 } else { 255 }]).encode()
    }

    fn sticker(w: u32, h: u32) -> Vec<u8> {
        SynthPng::rgba8(w, h, |x, _| [0, 0, 0, if x % 2 == 0 { 0 } else { 255 }]).encode()
    }

    #[tokio::test]
    async fn test_ten_row_scenario() {
        let source = MemorySource::new().with_slice_size(97);
        let mut rows = Vec::new();
        for i in 0..3 {
            source.insert_body(url(i), semi(20, 20));
            rows.push(CandidateRow::new(url(i), 20, 20));
        }
        for i in 3..6 {
            source.insert_body(url(i), sticker(20, 20));
            rows.push(CandidateRow::new(url(i), 20, 20));
        }
        for i in 6..8 {
            source.insert_body(url(i), semi(20, 20));
            rows.push(CandidateRow::new(url(i), 500, 20));
        }
        for i in 8..10 {
            source.respond(url(i), CannedResponse::Status(404));
            rows.push(CandidateRow::new(url(i), 20, 20));
        }
        let h = harness(source, BanList::new(BanPolicy::default()), 4);

        let mut accepted = Vec::new();
        let tally = h
            .scheduler
            .run(feed(rows), CancellationToken::new(), |outcome| {
                if outcome.is_accepted() {
                    accepted.push(outcome.row.url.clone());
                }
                Ok::<_, Infallible>(())
            })
            .await
            .unwrap();

        assert_eq!(tally.dispatched, 10);
        assert_eq!(tally.settled(), 10);
        assert_eq!(tally.accepted, 3);
        assert_eq!(tally.rejected_for(RejectReason::BinaryAlphaOnly), 3);
        assert_eq!(tally.rejected_for(RejectReason::WrongSize), 2);
        assert_eq!(tally.errored_for(ErrorKind::HttpStatus(404)), 2);
        assert_eq!(accepted.len(), 3);

        // Oversized rows never touch the network.
        assert_eq!(h.stats.opens(), 8);

        assert_eq!(h.telemetry.terminal_total(), 10);
        assert_eq!(h.telemetry.count("ConfAlpha"), 3);
        assert_eq!(h.telemetry.count("ConfAlphaNeg"), 3);
        assert_eq!(h.telemetry.count("WrongSize"), 2);
        assert_eq!(h.telemetry.count("HttpStatus"), 2);
        assert_eq!(h.telemetry.count("BanURL"), 2);

        let added = h.bans.added();
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|e| e.status == BanStatus::Suggested));
    }

    #[tokio::test]
    async fn test_concurrency_bound_holds() {
        let source = MemorySource::new()
            .with_open_delay(Duration::from_millis(5))
            .with_slice_delay(Duration::from_millis(2))
            .with_slice_size(64);
        let rows: Vec<_> = (0..24)
            .map(|i| {
                source.insert_body(url(i), sticker(16, 16));
                CandidateRow::new(url(i), 16, 16)
            })
            .collect();
        let h = harness(source, BanList::new(BanPolicy::default()), 3);

        let tally = h
            .scheduler
            .run(feed(rows), CancellationToken::new(), |_| Ok::<_, Infallible>(()))
            .await
            .unwrap();

        assert_eq!(tally.settled(), 24);
        assert!(h.stats.max_in_flight() <= 3, "max_in_flight = {}", h.stats.max_in_flight());
        assert!(h.stats.max_in_flight() >= 2);
        assert_eq!(h.stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch() {
        let source = MemorySource::new().with_open_delay(Duration::from_millis(20));
        let rows: Vec<_> = (0..50)
            .map(|i| {
                source.insert_body(url(i), semi(16, 16));
                CandidateRow::new(url(i), 16, 16)
            })
            .collect();
        let h = harness(source, BanList::new(BanPolicy::default()), 2);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut seen = 0;
        let tally = h
            .scheduler
            .run(feed(rows), cancel, |_| {
                seen += 1;
                if seen == 5 {
                    trigger.cancel();
                }
                Ok::<_, Infallible>(())
            })
            .await
            .unwrap();

        assert!(tally.cancelled);
        assert!(tally.dispatched < 50);
        assert_eq!(tally.settled(), tally.dispatched);
        assert_eq!(h.telemetry.terminal_total(), tally.dispatched);
        assert_eq!(h.stats.opens(), tally.dispatched);
        assert_eq!(
            tally.last_dispatched.as_deref(),
            Some(url(tally.dispatched as usize - 1).as_str())
        );
    }

    #[tokio::test]
    async fn test_ban_listed_rows_skip_network() {
        let source = MemorySource::new();
        source.insert_body(url(1), semi(16, 16));
        let bans = BanList::from_entries(
            [BanEntry::new(url(0), "http-404", BanStatus::Confirmed)],
            BanPolicy::default(),
        );
        let h = harness(source, bans, 2);

        let rows = vec![CandidateRow::new(url(0), 16, 16), CandidateRow::new(url(1), 16, 16)];
        let tally = h
            .scheduler
            .run(feed(rows), CancellationToken::new(), |_| Ok::<_, Infallible>(()))
            .await
            .unwrap();

        assert_eq!(tally.errored_for(ErrorKind::BanListedSkip), 1);
        assert_eq!(tally.accepted, 1);
        assert_eq!(h.stats.opens(), 1);
        assert_eq!(h.telemetry.count("BanListedSkip"), 1);
    }

    #[tokio::test]
    async fn test_worker_panic_is_recorded_as_internal() {
        let source = MemorySource::new();
        source.respond(url(0), CannedResponse::Panic);
        source.insert_body(url(1), semi(16, 16));
        let h = harness(source, BanList::new(BanPolicy::default()), 2);

        let rows = vec![CandidateRow::new(url(0), 16, 16), CandidateRow::new(url(1), 16, 16)];
        let mut details = Vec::new();
        let tally = h
            .scheduler
            .run(feed(rows), CancellationToken::new(), |outcome| {
                details.extend(outcome.detail.clone());
                Ok::<_, Infallible>(())
            })
            .await
            .unwrap();

        assert_eq!(tally.errored_for(ErrorKind::Internal), 1);
        assert_eq!(tally.accepted, 1);
        assert_eq!(h.telemetry.count("Internal"), 1);
        assert!(details.iter().any(|d| d.contains("canned panic")));
    }

    #[tokio::test]
    async fn test_consecutive_errors_halt_dispatch() {
        let source = MemorySource::new();
        let rows: Vec<_> = (0..20)
            .map(|i| {
                source.respond(url(i), CannedResponse::ConnectionFailure);
                CandidateRow::new(url(i), 16, 16)
            })
            .collect();
        let mut h = harness(source, BanList::new(BanPolicy::default()), 1);
        h.scheduler = h.scheduler.with_max_consecutive_errors(3);

        let tally = h
            .scheduler
            .run(feed(rows), CancellationToken::new(), |_| Ok::<_, Infallible>(()))
            .await
            .unwrap();

        assert_eq!(tally.settled(), 3);
        assert!(tally.halted.unwrap().contains("3 consecutive"));
        assert!(!tally.cancelled);
        // Connection failures do not count toward bans by default.
        assert!(h.bans.added().is_empty());
    }

    #[tokio::test]
    async fn test_sink_error_stops_dispatch_and_is_returned() {
        let source = MemorySource::new();
        let rows: Vec<_> = (0..10)
            .map(|i| {
                source.insert_body(url(i), semi(16, 16));
                CandidateRow::new(url(i), 16, 16)
            })
            .collect();
        let h = harness(source, BanList::new(BanPolicy::default()), 1);

        let result = h
            .scheduler
            .run(feed(rows), CancellationToken::new(), |_| Err("disk full"))
            .await;

        assert_eq!(result.unwrap_err(), "disk full");
        assert!(h.stats.opens() < 10);
        assert_eq!(h.telemetry.terminal_total(), h.stats.opens());
    }
}
