//! Non-blocking execution: submit, poll with backoff, surface progress, cancel.
//!
//! ```text
//! Idle -> Polling(attempt, elapsed) -> Ready | Failed | Cancelled
//! ```
//!
//! The poller drives exactly one outstanding call. Rejecting a second submission on a busy
//! session is the job of the caller (see [`crate::query::QueryFacade::execute_nb`]).

use crate::gci::session::GemSession;
use crate::gci::{ExecRequest, GciError, Oop, PerformRequest, PollStatus};
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_BACKOFF_MS: &[u64] = &[1, 2, 5, 10, 20, 50, 100, 200, 500];
const MAX_BACKOFF_MS: u64 = 500;

/// Poll schedule.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollConfig {
    /// Delays between polls, the last one repeats.
    pub backoff_ms: Vec<u64>,
    /// Wait time after which a cancellable progress is shown.
    pub progress_after_ms: u64,
    /// How long a hard-cancelled call is polled for its result before it is left draining.
    pub drain_timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            progress_after_ms: 1000,
            drain_timeout_ms: 2000,
        }
    }
}

impl PollConfig {
    pub fn backoff(&self, attempt: usize) -> Duration {
        let ms = match self.backoff_ms.len() {
            0 => MAX_BACKOFF_MS,
            len => self.backoff_ms[attempt.min(len - 1)],
        };
        Duration::from_millis(ms)
    }

    pub fn progress_after(&self) -> Duration {
        Duration::from_millis(self.progress_after_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Counts cancellation requests. The first one asks for a soft break, the second for a hard one.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU32>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cancellation request, return the number of requests so far.
    pub fn cancel(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn requests(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst)
    }
}

/// Receiver of long-running call progress.
pub trait ProgressSink {
    fn start(&self, title: &str);
    fn update(&self, _elapsed: Duration) {}
    fn end(&self);
}

pub struct NopProgress;

impl ProgressSink for NopProgress {
    fn start(&self, _: &str) {}
    fn end(&self) {}
}

#[derive(Debug, Clone, Copy)]
pub enum NbRequest<'a> {
    Execute(ExecRequest<'a>),
    Perform(PerformRequest<'a>),
}

impl NbRequest<'_> {
    fn title(&self) -> String {
        match self {
            NbRequest::Execute(req) => {
                let line = req.source.lines().next().unwrap_or_default();
                let mut title: String = line.chars().take(40).collect();
                if title.len() < req.source.len() {
                    title.push_str("...");
                }
                format!("Executing {title}")
            }
            NbRequest::Perform(req) => format!("Performing #{}", req.selector),
        }
    }
}

/// Terminal result of a non-blocking call.
#[derive(Debug)]
pub enum Outcome {
    Ready(Oop),
    Failed(GciError),
    /// Hard cancelled. `drained` is false when the remote call was still running when the
    /// poller gave up, its result must be drained later.
    Cancelled { drained: bool },
}

impl Outcome {
    /// Suspended process of an unhandled remote error.
    pub fn debuggable_context(&self) -> Option<Oop> {
        match self {
            Outcome::Failed(e) => e.debuggable_context(),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum PollState {
    Idle,
    Polling { attempt: usize, elapsed: Duration },
    Finished(Outcome),
}

pub struct ExecutionPoller<'a> {
    session: &'a GemSession,
    config: PollConfig,
    cancel: CancelToken,
    progress: &'a dyn ProgressSink,
    state: PollState,
    title: String,
    started: Option<Instant>,
    interrupts_sent: u32,
    progress_shown: bool,
}

impl<'a> ExecutionPoller<'a> {
    pub fn new(session: &'a GemSession, config: PollConfig) -> Self {
        Self {
            session,
            config,
            cancel: CancelToken::default(),
            progress: &NopProgress,
            state: PollState::Idle,
            title: String::new(),
            started: None,
            interrupts_sent: 0,
            progress_shown: false,
        }
    }

    pub fn with_cancel(self, cancel: CancelToken) -> Self {
        Self { cancel, ..self }
    }

    pub fn with_progress(self, progress: &'a dyn ProgressSink) -> Self {
        Self { progress, ..self }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Issue the non-blocking call. An immediate failure finishes the poller.
    pub fn submit(&mut self, req: &NbRequest) -> &PollState {
        if !matches!(self.state, PollState::Idle) {
            log::warn!(target: "gci", "poller already used, submit ignored");
            return &self.state;
        }

        let gci = self.session.gci();
        let handle = self.session.handle();
        let submitted = match req {
            NbRequest::Execute(exec) => gci.nb_execute(handle, exec),
            NbRequest::Perform(perform) => gci.nb_perform(handle, perform),
        };
        self.title = req.title();
        self.started = Some(Instant::now());

        match submitted {
            Ok(()) => {
                log::debug!(
                    target: "gci",
                    "session {}: {} submitted",
                    self.session.id(),
                    self.title
                );
                self.state = PollState::Polling {
                    attempt: 0,
                    elapsed: Duration::ZERO,
                };
            }
            Err(e) => self.finish(Outcome::Failed(e)),
        }
        &self.state
    }

    /// Delay before the next poll.
    pub fn next_delay(&self) -> Duration {
        match self.state {
            PollState::Polling { attempt, .. } => self.config.backoff(attempt.saturating_sub(1)),
            _ => Duration::ZERO,
        }
    }

    /// One poll without waiting: handle cancellation requests, progress, then poll the VM.
    pub fn poll(&mut self) -> &PollState {
        let PollState::Polling { attempt, .. } = self.state else {
            return &self.state;
        };
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();

        if self.cancel.requests() > self.interrupts_sent {
            if self.interrupts_sent == 0 {
                self.interrupt(false);
            } else {
                self.interrupt(true);
                let drained = self.drain();
                self.finish(Outcome::Cancelled { drained });
                return &self.state;
            }
        }

        if !self.progress_shown && elapsed >= self.config.progress_after() {
            self.progress_shown = true;
            self.progress.start(&self.title);
        }
        if self.progress_shown {
            self.progress.update(elapsed);
        }

        let gci = self.session.gci();
        let handle = self.session.handle();
        match gci.nb_poll(handle, 0) {
            Ok(PollStatus::NotReady) => {
                self.state = PollState::Polling {
                    attempt: attempt + 1,
                    elapsed,
                };
            }
            Ok(PollStatus::Ready) => {
                let outcome = match gci.nb_result(handle) {
                    Ok(oop) => Outcome::Ready(oop),
                    Err(e) => Outcome::Failed(e),
                };
                self.finish(outcome);
            }
            Err(e) => self.finish(Outcome::Failed(e)),
        }
        &self.state
    }

    /// Submit and poll until a terminal state, sleeping between polls.
    pub fn run(mut self, req: &NbRequest) -> Outcome {
        self.submit(req);
        loop {
            self.poll();
            if let PollState::Finished(_) = self.state {
                break;
            }
            thread::sleep(self.next_delay());
        }
        match std::mem::replace(&mut self.state, PollState::Idle) {
            PollState::Finished(outcome) => outcome,
            _ => unreachable!("poll loop exits only in a finished state"),
        }
    }

    fn interrupt(&mut self, hard: bool) {
        self.interrupts_sent += 1;
        let kind = if hard { "hard" } else { "soft" };
        log::info!(target: "gci", "session {}: {kind} break requested", self.session.id());
        if let Err(e) = self.session.gci().interrupt(self.session.handle(), hard) {
            log::warn!(target: "gci", "session {}: {kind} break: {e}", self.session.id());
        }
    }

    /// Poll a hard-cancelled call until it finishes or the drain timeout passes.
    fn drain(&self) -> bool {
        let deadline = Instant::now() + self.config.drain_timeout();
        let mut attempt = 0;
        loop {
            if self.session.drain_once() {
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    target: "gci",
                    "session {}: cancelled call still running, left draining",
                    self.session.id()
                );
                return false;
            }
            thread::sleep(self.config.backoff(attempt));
            attempt += 1;
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        if self.progress_shown {
            self.progress.end();
        }
        log::debug!(
            target: "gci",
            "session {}: {} finished: {outcome:?}",
            self.session.id(),
            self.title
        );
        self.state = PollState::Finished(outcome);
    }
}
