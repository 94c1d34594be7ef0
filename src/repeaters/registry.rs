//! Per-guild index of live repeaters.
//!
//! The registry is the only owner of [`RepeatRunner`]s. Callers get copies of
//! repeater state ([`RepeaterInfo`]) and address runners by guild and id.
//! Every operation is rejected with [`RepeaterError::NotReady`] until
//! [`RepeaterRegistry::load_all`] has finished.

use crate::error::RepeaterError;
use crate::repeaters::model::{self, NewRepeater, Repeater, MAX_REPEATERS_PER_GUILD};
use crate::repeaters::runner::{FireOutcome, RepeatRunner, RunnerDeps, RunnerExited};
use crate::repeaters::store::RepeaterStore;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

pub type Result<T> = std::result::Result<T, RepeaterError>;

/// Snapshot of one repeater for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeaterInfo {
    pub repeater: Repeater,
    pub next_fire: Option<DateTime<Utc>>,
}

pub struct RepeaterRegistry {
    deps: RunnerDeps,
    ready: AtomicBool,
    /// guild id -> repeater id -> runner. Ids grow with creation, so map
    /// order is creation order.
    guilds: DashMap<u64, BTreeMap<i64, Arc<RepeatRunner>>>,
    exits: mpsc::UnboundedSender<RunnerExited>,
    _reaper: DropGuard,
}

impl RepeaterRegistry {
    /// Must be called from inside a tokio runtime; spawns the task that
    /// removes runners which stopped themselves.
    pub fn new(deps: RunnerDeps) -> Arc<Self> {
        let (exits, exited) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            tokio::spawn(reap(weak.clone(), exited, cancel.clone()));
            Self {
                deps,
                ready: AtomicBool::new(false),
                guilds: DashMap::new(),
                exits,
                _reaper: cancel.drop_guard(),
            }
        })
    }

    fn store(&self) -> &dyn RepeaterStore {
        self.deps.store.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RepeaterError::NotReady)
        }
    }

    /// Starts a runner for every stored repeater, then opens the registry.
    /// Returns the number of runners started.
    pub async fn load_all(&self) -> Result<usize> {
        if self.is_ready() {
            return Ok(self.guilds.iter().map(|g| g.len()).sum());
        }

        let repeaters = self.store().all_repeaters().await?;
        let mut zones: HashMap<u64, Tz> = HashMap::new();
        let mut count = 0;

        for repeater in repeaters {
            let tz = match zones.get(&repeater.guild_id) {
                Some(tz) => *tz,
                None => {
                    let tz = self.load_timezone(repeater.guild_id).await?;
                    zones.insert(repeater.guild_id, tz);
                    tz
                }
            };
            self.spawn_runner(repeater, tz);
            count += 1;
        }

        self.ready.store(true, Ordering::SeqCst);
        info!(
            "Loaded {} repeaters across {} guilds",
            count,
            self.guilds.len()
        );
        Ok(count)
    }

    async fn load_timezone(&self, guild_id: u64) -> Result<Tz> {
        let Some(name) = self.store().guild_timezone(guild_id).await? else {
            return Ok(Tz::UTC);
        };
        match name.parse::<Tz>() {
            Ok(tz) => Ok(tz),
            Err(_) => {
                warn!(
                    "Guild {} has unknown stored time zone {:?}, using UTC",
                    guild_id, name
                );
                Ok(Tz::UTC)
            }
        }
    }

    fn spawn_runner(&self, repeater: Repeater, tz: Tz) -> Arc<RepeatRunner> {
        let guild_id = repeater.guild_id;
        let id = repeater.id;
        let runner = Arc::new(RepeatRunner::new(
            repeater,
            tz,
            self.deps.clone(),
            Some(self.exits.clone()),
        ));
        runner.start();
        self.guilds
            .entry(guild_id)
            .or_default()
            .insert(id, runner.clone());
        runner
    }

    fn runner(&self, guild_id: u64, id: i64) -> Result<Arc<RepeatRunner>> {
        self.guilds
            .get(&guild_id)
            .and_then(|runners| runners.get(&id).cloned())
            .ok_or(RepeaterError::NotFound(id))
    }

    /// Validates, persists and starts a new repeater.
    pub async fn create(
        &self,
        guild_id: u64,
        channel_id: u64,
        message: &str,
        interval: Duration,
        start_time_of_day: Option<NaiveTime>,
    ) -> Result<Repeater> {
        self.ensure_ready()?;

        let new = NewRepeater {
            guild_id,
            channel_id,
            message: message.to_string(),
            interval: Duration::from_secs(interval.as_secs()),
            start_time_of_day,
            no_redundant: false,
        };
        new.validate()?;

        let tz = self.load_timezone(guild_id).await?;
        let repeater = self
            .store()
            .insert_repeater(&new, MAX_REPEATERS_PER_GUILD)
            .await?
            .ok_or(RepeaterError::TooMany {
                max: MAX_REPEATERS_PER_GUILD,
            })?;

        self.spawn_runner(repeater.clone(), tz);
        info!(
            "Repeater {} created in guild {} channel {} every {}",
            repeater.id,
            guild_id,
            channel_id,
            humantime::format_duration(repeater.interval)
        );
        Ok(repeater)
    }

    /// Stops the runner and deletes the record.
    pub async fn remove(&self, guild_id: u64, id: i64) -> Result<Repeater> {
        self.ensure_ready()?;

        let runner = self
            .guilds
            .get_mut(&guild_id)
            .and_then(|mut runners| runners.remove(&id))
            .ok_or(RepeaterError::NotFound(id))?;
        self.guilds.remove_if(&guild_id, |_, runners| runners.is_empty());

        runner.stop();
        runner.join().await;
        self.store().delete_repeater(id).await?;
        info!("Repeater {} removed from guild {}", id, guild_id);
        Ok(runner.repeater())
    }

    /// Live repeaters of a guild in creation order.
    pub fn list(&self, guild_id: u64) -> Result<Vec<RepeaterInfo>> {
        self.ensure_ready()?;
        Ok(self
            .guilds
            .get(&guild_id)
            .map(|runners| runners.values().map(|r| info_of(r)).collect())
            .unwrap_or_default())
    }

    /// Resolves the 1-based position shown to users.
    pub fn runner_at(&self, guild_id: u64, index: usize) -> Result<RepeaterInfo> {
        let mut list = self.list(guild_id)?;
        if list.is_empty() {
            return Err(RepeaterError::NoRepeaters);
        }
        if index == 0 || index > list.len() {
            return Err(RepeaterError::IndexOutOfRange {
                index,
                count: list.len(),
            });
        }
        Ok(list.swap_remove(index - 1))
    }

    pub async fn trigger(&self, guild_id: u64, id: i64) -> Result<FireOutcome> {
        self.ensure_ready()?;
        let runner = self.runner(guild_id, id)?;
        runner.trigger().await.ok_or(RepeaterError::NotFound(id))
    }

    pub async fn update_message(&self, guild_id: u64, id: i64, message: &str) -> Result<()> {
        self.ensure_ready()?;
        model::validate_message(message)?;
        let runner = self.runner(guild_id, id)?;

        let _edit = runner.lock_edits().await;
        self.store().update_message(id, message).await?;
        runner.apply(|r| r.message = message.to_string());
        Ok(())
    }

    /// Moves the repeater. The old channel's post is left in place.
    pub async fn update_channel(&self, guild_id: u64, id: i64, channel_id: u64) -> Result<()> {
        self.ensure_ready()?;
        let runner = self.runner(guild_id, id)?;

        let _edit = runner.lock_edits().await;
        self.store().update_channel(id, channel_id).await?;
        runner.apply(|r| {
            r.channel_id = channel_id;
            r.last_message_id = None;
        });
        Ok(())
    }

    /// Flips redundancy suppression and returns the new value.
    pub async fn toggle_redundant(&self, guild_id: u64, id: i64) -> Result<bool> {
        self.ensure_ready()?;
        let runner = self.runner(guild_id, id)?;

        let _edit = runner.lock_edits().await;
        let no_redundant = !runner.repeater().no_redundant;
        self.store().set_no_redundant(id, no_redundant).await?;
        runner.apply(|r| r.no_redundant = no_redundant);
        Ok(no_redundant)
    }

    pub async fn reschedule(
        &self,
        guild_id: u64,
        id: i64,
        interval: Duration,
        start_time_of_day: Option<NaiveTime>,
    ) -> Result<()> {
        self.ensure_ready()?;
        let interval = Duration::from_secs(interval.as_secs());
        model::validate_interval(interval)?;
        let runner = self.runner(guild_id, id)?;

        let _edit = runner.lock_edits().await;
        self.store()
            .update_schedule(id, interval, start_time_of_day)
            .await?;
        runner.apply(|r| {
            r.interval = interval;
            r.start_time_of_day = start_time_of_day;
        });
        runner.reset();
        Ok(())
    }

    pub async fn guild_timezone(&self, guild_id: u64) -> Result<Tz> {
        self.ensure_ready()?;
        self.load_timezone(guild_id).await
    }

    /// Sets (or with `None`, clears back to UTC) the zone time-of-day
    /// anchors are read in, and reschedules the guild's runners.
    pub async fn set_guild_timezone(&self, guild_id: u64, name: Option<&str>) -> Result<Tz> {
        self.ensure_ready()?;
        let tz = match name {
            Some(name) => name
                .trim()
                .parse::<Tz>()
                .map_err(|_| RepeaterError::InvalidTimezone(name.to_string()))?,
            None => Tz::UTC,
        };

        self.store()
            .set_guild_timezone(guild_id, name.map(|_| tz.name()))
            .await?;

        let runners: Vec<_> = self
            .guilds
            .get(&guild_id)
            .map(|runners| runners.values().cloned().collect())
            .unwrap_or_default();
        for runner in runners {
            runner.set_timezone(tz);
        }
        info!("Guild {} time zone set to {}", guild_id, tz.name());
        Ok(tz)
    }

    /// Stops every runner and waits for in-flight fires to finish.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let guilds: Vec<u64> = self.guilds.iter().map(|g| *g.key()).collect();
        let mut runners = Vec::new();
        for guild_id in guilds {
            if let Some((_, guild)) = self.guilds.remove(&guild_id) {
                runners.extend(guild.into_values());
            }
        }

        for runner in &runners {
            runner.stop();
        }
        for runner in &runners {
            runner.join().await;
        }
        info!("Stopped {} repeaters", runners.len());
    }

    async fn forget(&self, exited: RunnerExited) {
        let removed = self
            .guilds
            .get_mut(&exited.guild_id)
            .and_then(|mut runners| {
                let stopped = runners.get(&exited.repeater_id)?.is_stopped();
                if stopped {
                    runners.remove(&exited.repeater_id)
                } else {
                    None
                }
            });
        self.guilds
            .remove_if(&exited.guild_id, |_, runners| runners.is_empty());

        if removed.is_none() {
            return;
        }
        match self.store().delete_repeater(exited.repeater_id).await {
            Ok(_) => info!(
                "Repeater {} in guild {} removed after its channel became unreachable",
                exited.repeater_id, exited.guild_id
            ),
            Err(e) => error!(
                "Repeater {}: failed to delete record: {}",
                exited.repeater_id, e
            ),
        }
    }
}

fn info_of(runner: &RepeatRunner) -> RepeaterInfo {
    RepeaterInfo {
        repeater: runner.repeater(),
        next_fire: runner.next_fire(),
    }
}

async fn reap(
    registry: Weak<RepeaterRegistry>,
    mut exited: mpsc::UnboundedReceiver<RunnerExited>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = exited.recv() => next,
        };
        let Some(exit) = next else { break };
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.forget(exit).await;
    }
}
