use crate::repeaters::model::{NewRepeater, Repeater};
use async_trait::async_trait;
use chrono::NaiveTime;
use std::time::Duration;

/// Persistence used by the repeater registry and its runners.
#[async_trait]
pub trait RepeaterStore: Send + Sync {
    async fn all_repeaters(&self) -> anyhow::Result<Vec<Repeater>>;

    /// Inserts `new` unless its guild already has `max_per_guild` repeaters,
    /// in which case nothing is written and `None` is returned.
    async fn insert_repeater(
        &self,
        new: &NewRepeater,
        max_per_guild: usize,
    ) -> anyhow::Result<Option<Repeater>>;

    /// Returns whether a record was deleted.
    async fn delete_repeater(&self, id: i64) -> anyhow::Result<bool>;

    async fn update_message(&self, id: i64, message: &str) -> anyhow::Result<()>;

    /// Moves the repeater and forgets its last posted message.
    async fn update_channel(&self, id: i64, channel_id: u64) -> anyhow::Result<()>;

    async fn set_no_redundant(&self, id: i64, no_redundant: bool) -> anyhow::Result<()>;

    async fn update_schedule(
        &self,
        id: i64,
        interval: Duration,
        start_time_of_day: Option<NaiveTime>,
    ) -> anyhow::Result<()>;

    async fn set_last_message_id(&self, id: i64, message_id: Option<u64>) -> anyhow::Result<()>;

    async fn guild_timezone(&self, guild_id: u64) -> anyhow::Result<Option<String>>;

    async fn set_guild_timezone(&self, guild_id: u64, timezone: Option<&str>) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::Utc;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// Pure in-memory store; keeps runner tests off the blocking pool.
    #[derive(Default)]
    pub struct MemoryStore {
        next_id: Mutex<i64>,
        pub repeaters: Mutex<BTreeMap<i64, Repeater>>,
        timezones: Mutex<HashMap<u64, String>>,
        /// Slows every write down so callers overlap.
        pub write_delay: Mutex<Option<std::time::Duration>>,
    }

    impl MemoryStore {
        pub fn get(&self, id: i64) -> Option<Repeater> {
            self.repeaters.lock().unwrap().get(&id).cloned()
        }

        async fn slow_write(&self) {
            let delay = *self.write_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        fn with<F: FnOnce(&mut Repeater)>(&self, id: i64, f: F) -> anyhow::Result<()> {
            let mut repeaters = self.repeaters.lock().unwrap();
            let repeater = repeaters
                .get_mut(&id)
                .ok_or_else(|| anyhow::anyhow!("no repeater {}", id))?;
            f(repeater);
            Ok(())
        }
    }

    #[async_trait]
    impl RepeaterStore for MemoryStore {
        async fn all_repeaters(&self) -> anyhow::Result<Vec<Repeater>> {
            Ok(self.repeaters.lock().unwrap().values().cloned().collect())
        }

        async fn insert_repeater(
            &self,
            new: &NewRepeater,
            max_per_guild: usize,
        ) -> anyhow::Result<Option<Repeater>> {
            let mut repeaters = self.repeaters.lock().unwrap();
            let existing = repeaters
                .values()
                .filter(|r| r.guild_id == new.guild_id)
                .count();
            if existing >= max_per_guild {
                return Ok(None);
            }
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let repeater = Repeater {
                id: *next_id,
                guild_id: new.guild_id,
                channel_id: new.channel_id,
                message: new.message.clone(),
                interval: new.interval,
                start_time_of_day: new.start_time_of_day,
                no_redundant: new.no_redundant,
                last_message_id: None,
                date_added: Utc::now(),
            };
            repeaters.insert(repeater.id, repeater.clone());
            Ok(Some(repeater))
        }

        async fn delete_repeater(&self, id: i64) -> anyhow::Result<bool> {
            Ok(self.repeaters.lock().unwrap().remove(&id).is_some())
        }

        async fn update_message(&self, id: i64, message: &str) -> anyhow::Result<()> {
            self.with(id, |r| r.message = message.to_string())
        }

        async fn update_channel(&self, id: i64, channel_id: u64) -> anyhow::Result<()> {
            self.with(id, |r| {
                r.channel_id = channel_id;
                r.last_message_id = None;
            })
        }

        async fn set_no_redundant(&self, id: i64, no_redundant: bool) -> anyhow::Result<()> {
            self.slow_write().await;
            self.with(id, |r| r.no_redundant = no_redundant)
        }

        async fn update_schedule(
            &self,
            id: i64,
            interval: Duration,
            start_time_of_day: Option<NaiveTime>,
        ) -> anyhow::Result<()> {
            self.with(id, |r| {
                r.interval = interval;
                r.start_time_of_day = start_time_of_day;
            })
        }

        async fn set_last_message_id(&self, id: i64, message_id: Option<u64>) -> anyhow::Result<()> {
            self.with(id, |r| r.last_message_id = message_id)
        }

        async fn guild_timezone(&self, guild_id: u64) -> anyhow::Result<Option<String>> {
            Ok(self.timezones.lock().unwrap().get(&guild_id).cloned())
        }

        async fn set_guild_timezone(&self, guild_id: u64, timezone: Option<&str>) -> anyhow::Result<()> {
            let mut timezones = self.timezones.lock().unwrap();
            match timezone {
                Some(tz) => timezones.insert(guild_id, tz.to_string()),
                None => timezones.remove(&guild_id),
            };
            Ok(())
        }
    }
}
