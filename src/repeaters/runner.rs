//! Live scheduling unit for one repeater.
//!
//! Each runner owns a single tokio task. The task sleeps until the next fire
//! time, or until a command (trigger/reset) or cancellation arrives. Fires
//! only ever happen inside that task, so sends of one repeater never overlap,
//! and a stop issued mid-fire lets the fire finish before the loop exits.

use crate::clock::Clock;
use crate::outbound::MessageSink;
use crate::repeaters::model::Repeater;
use crate::repeaters::schedule;
use crate::repeaters::store::RepeaterStore;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every runner.
#[derive(Clone)]
pub struct RunnerDeps {
    pub store: Arc<dyn RepeaterStore>,
    pub sink: Arc<dyn MessageSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Sent(u64),
    /// Nothing new in the channel since the last post.
    Suppressed,
    /// Transient failure; the next scheduled fire tries again.
    Failed,
    /// The channel is gone or inaccessible; the runner stops.
    Unreachable,
}

/// Sent to the registry when a runner stops itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerExited {
    pub guild_id: u64,
    pub repeater_id: i64,
}

enum Command {
    Trigger(oneshot::Sender<FireOutcome>),
    Reset,
}

struct Shared {
    repeater: RwLock<Repeater>,
    timezone: RwLock<Tz>,
    next_fire: RwLock<Option<DateTime<Utc>>>,
}

impl Shared {
    fn repeater(&self) -> Repeater {
        self.repeater.read().unwrap().clone()
    }

    fn timezone(&self) -> Tz {
        *self.timezone.read().unwrap()
    }

    fn set_next_fire(&self, next: Option<DateTime<Utc>>) {
        *self.next_fire.write().unwrap() = next;
    }
}

pub struct RepeatRunner {
    shared: Arc<Shared>,
    deps: RunnerDeps,
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    started: AtomicBool,
    cancel: CancellationToken,
    exits: Option<mpsc::UnboundedSender<RunnerExited>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes persist-then-apply edits coming from commands.
    edits: tokio::sync::Mutex<()>,
}

impl RepeatRunner {
    pub fn new(
        repeater: Repeater,
        timezone: Tz,
        deps: RunnerDeps,
        exits: Option<mpsc::UnboundedSender<RunnerExited>>,
    ) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                repeater: RwLock::new(repeater),
                timezone: RwLock::new(timezone),
                next_fire: RwLock::new(None),
            }),
            deps,
            commands,
            pending: Mutex::new(Some(pending)),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            exits,
            task: Mutex::new(None),
            edits: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> i64 {
        self.shared.repeater.read().unwrap().id
    }

    pub fn guild_id(&self) -> u64 {
        self.shared.repeater.read().unwrap().guild_id
    }

    /// Copy of the repeater as the runner currently sees it.
    pub fn repeater(&self) -> Repeater {
        self.shared.repeater()
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        *self.shared.next_fire.read().unwrap()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Computes the first fire time and starts the loop. Returns `false` if
    /// the runner was already started or has been stopped.
    pub fn start(&self) -> bool {
        if self.is_stopped() || self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let Some(commands) = self.pending.lock().unwrap().take() else {
            return false;
        };

        let run = RunLoop {
            shared: self.shared.clone(),
            deps: self.deps.clone(),
            commands,
            cancel: self.cancel.clone(),
            exits: self.exits.clone(),
        };
        let first = run.schedule_first();
        *self.task.lock().unwrap() = Some(tokio::spawn(run.run(first)));
        true
    }

    /// Fires now, out of band, then schedules the next fire as if this had
    /// been a natural one. `None` if the runner is not running.
    pub async fn trigger(&self) -> Option<FireOutcome> {
        if !self.started.load(Ordering::SeqCst) || self.is_stopped() {
            return None;
        }
        let (done, outcome) = oneshot::channel();
        self.commands.send(Command::Trigger(done)).ok()?;
        outcome.await.ok()
    }

    /// Recomputes the next fire time without sending.
    pub fn reset(&self) {
        if self.started.load(Ordering::SeqCst) && !self.is_stopped() {
            let _ = self.commands.send(Command::Reset);
        }
    }

    /// No further fires start after this. A fire already in progress
    /// finishes. Calling it again does nothing.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Repeater {}: stopping", self.id());
            self.cancel.cancel();
        }
    }

    /// Waits for the loop task to finish after [`stop`](Self::stop).
    pub async fn join(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Repeater {}: run loop panicked: {}", self.id(), e);
            }
        }
    }

    /// Held by callers across reading, persisting and applying a change.
    pub(crate) async fn lock_edits(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.edits.lock().await
    }

    /// Changes the in-memory copy. Callers persist first.
    pub(crate) fn apply<F: FnOnce(&mut Repeater)>(&self, change: F) {
        change(&mut self.shared.repeater.write().unwrap());
    }

    pub(crate) fn set_timezone(&self, timezone: Tz) {
        *self.shared.timezone.write().unwrap() = timezone;
        self.reset();
    }
}

impl Drop for RepeatRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Wake {
    Cancelled,
    Due,
    Trigger(oneshot::Sender<FireOutcome>),
    Reset,
}

struct RunLoop {
    shared: Arc<Shared>,
    deps: RunnerDeps,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    exits: Option<mpsc::UnboundedSender<RunnerExited>>,
}

impl RunLoop {
    async fn run(mut self, mut next: DateTime<Utc>) {
        loop {
            let delay = (next - self.deps.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                command = self.commands.recv() => match command {
                    Some(Command::Trigger(done)) => Wake::Trigger(done),
                    Some(Command::Reset) => Wake::Reset,
                    None => Wake::Cancelled,
                },
                _ = tokio::time::sleep(delay) => Wake::Due,
            };

            let (outcome, reply) = match wake {
                Wake::Cancelled => break,
                Wake::Reset => {
                    next = self.schedule_first();
                    continue;
                }
                Wake::Due => (self.fire().await, None),
                Wake::Trigger(done) => (self.fire().await, Some(done)),
            };

            let finished = if outcome == FireOutcome::Unreachable {
                self.stop_unreachable();
                true
            } else {
                self.cancel.is_cancelled()
            };
            if !finished {
                next = self.schedule_following();
            }
            if let Some(done) = reply {
                let _ = done.send(outcome);
            }
            if finished {
                break;
            }
        }

        self.shared.set_next_fire(None);
    }

    fn schedule_first(&self) -> DateTime<Utc> {
        let repeater = self.shared.repeater();
        let next = schedule::first_fire(
            self.deps.clock.now(),
            repeater.interval,
            repeater.start_time_of_day,
            self.shared.timezone(),
        );
        self.shared.set_next_fire(Some(next));
        debug!("Repeater {}: next fire at {}", repeater.id, next);
        next
    }

    fn schedule_following(&self) -> DateTime<Utc> {
        let repeater = self.shared.repeater();
        let next = schedule::following_fire(
            self.deps.clock.now(),
            repeater.interval,
            repeater.start_time_of_day,
            self.shared.timezone(),
        );
        self.shared.set_next_fire(Some(next));
        debug!("Repeater {}: next fire at {}", repeater.id, next);
        next
    }

    async fn fire(&self) -> FireOutcome {
        let repeater = self.shared.repeater();
        let sink = &self.deps.sink;

        if let (true, Some(last)) = (repeater.no_redundant, repeater.last_message_id) {
            match sink.has_activity_since(repeater.channel_id, last).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "Repeater {}: no new messages in channel {}, skipping",
                        repeater.id, repeater.channel_id
                    );
                    return FireOutcome::Suppressed;
                }
                Err(e) if e.is_unreachable() => return FireOutcome::Unreachable,
                Err(e) => {
                    warn!("Repeater {}: activity check failed: {}", repeater.id, e);
                    return FireOutcome::Failed;
                }
            }
        }

        if let Some(last) = repeater.last_message_id {
            if let Err(e) = sink.delete_message(repeater.channel_id, last).await {
                debug!(
                    "Repeater {}: could not delete previous message {}: {}",
                    repeater.id, last, e
                );
            }
        }

        let sent = match sink.send_message(repeater.channel_id, &repeater.message).await {
            Ok(id) => id,
            Err(e) if e.is_unreachable() => {
                warn!("Repeater {}: {}", repeater.id, e);
                return FireOutcome::Unreachable;
            }
            Err(e) => {
                warn!(
                    "Repeater {}: send to channel {} failed, retrying next fire: {}",
                    repeater.id, repeater.channel_id, e
                );
                return FireOutcome::Failed;
            }
        };

        // The channel may have been changed while the send was in flight.
        let moved = self.shared.repeater.read().unwrap().channel_id != repeater.channel_id;
        if moved {
            return FireOutcome::Sent(sent);
        }
        if let Err(e) = self.deps.store.set_last_message_id(repeater.id, Some(sent)).await {
            error!(
                "Repeater {}: failed to persist last message id {}: {}",
                repeater.id, sent, e
            );
        }
        self.shared.repeater.write().unwrap().last_message_id = Some(sent);
        debug!(
            "Repeater {}: posted message {} in channel {}",
            repeater.id, sent, repeater.channel_id
        );
        FireOutcome::Sent(sent)
    }

    fn stop_unreachable(&self) {
        let repeater = self.shared.repeater();
        warn!(
            "Repeater {}: channel {} in guild {} is unreachable, stopping",
            repeater.id, repeater.channel_id, repeater.guild_id
        );
        self.cancel.cancel();
        if let Some(exits) = &self.exits {
            let _ = exits.send(RunnerExited {
                guild_id: repeater.guild_id,
                repeater_id: repeater.id,
            });
        }
        info!("Repeater {}: stopped", repeater.id);
    }
}
