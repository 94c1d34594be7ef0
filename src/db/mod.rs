use crate::config::Config;
use crate::repeaters::model::{NewRepeater, Repeater};
use crate::repeaters::store::RepeaterStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const SQLITE_DATETIME: &str = "%Y-%m-%d %H:%M:%S";
const TIME_OF_DAY: &str = "%H:%M:%S";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// Runs `f` on the blocking pool so SQLite work never stalls the runtime.
    pub async fn run_blocking<F, R>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&Database) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    /// Unit of work: commits if `f` succeeds, rolls back otherwise.
    pub fn transaction<F, R>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> anyhow::Result<R>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // --- Repeaters ---

    pub fn list_repeaters(&self) -> anyhow::Result<Vec<Repeater>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, channel_id, message, interval_secs, start_time_of_day,
                    no_redundant, last_message_id, date_added
             FROM repeaters ORDER BY guild_id, id",
        )?;
        let rows = stmt.query_map([], repeater_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        debug!("Database: Loaded {} repeaters", results.len());
        Ok(results)
    }

    pub fn get_repeater(&self, id: i64) -> anyhow::Result<Option<Repeater>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, channel_id, message, interval_secs, start_time_of_day,
                    no_redundant, last_message_id, date_added
             FROM repeaters WHERE id = ?1",
        )?;
        Ok(stmt.query_row([id], repeater_from_row).optional()?)
    }

    pub fn create_repeater(
        &self,
        new: &NewRepeater,
        max_per_guild: usize,
    ) -> anyhow::Result<Option<Repeater>> {
        let date_added = Utc::now().format(SQLITE_DATETIME).to_string();
        self.transaction(|tx| {
            let existing: usize = tx.query_row(
                "SELECT COUNT(*) FROM repeaters WHERE guild_id = ?1",
                [new.guild_id.to_string()],
                |row| row.get(0),
            )?;
            if existing >= max_per_guild {
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO repeaters (guild_id, channel_id, message, interval_secs,
                                        start_time_of_day, no_redundant, date_added)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                (
                    new.guild_id.to_string(),
                    new.channel_id.to_string(),
                    &new.message,
                    new.interval.as_secs() as i64,
                    new.start_time_of_day.map(|t| t.format(TIME_OF_DAY).to_string()),
                    new.no_redundant,
                    &date_added,
                ),
            )?;
            let id = tx.last_insert_rowid();
            debug!("Database: Created repeater {} in guild {}", id, new.guild_id);

            Ok(Some(Repeater {
                id,
                guild_id: new.guild_id,
                channel_id: new.channel_id,
                message: new.message.clone(),
                interval: Duration::from_secs(new.interval.as_secs()),
                start_time_of_day: new.start_time_of_day,
                no_redundant: new.no_redundant,
                last_message_id: None,
                date_added: parse_sqlite_utc(&date_added).unwrap_or_else(Utc::now),
            }))
        })
    }

    pub fn delete_repeater(&self, id: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM repeaters WHERE id = ?1", [id])?)
    }

    pub fn update_repeater_message(&self, id: i64, message: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE repeaters SET message = ?1 WHERE id = ?2", (message, id))?;
        Ok(())
    }

    pub fn update_repeater_channel(&self, id: i64, channel_id: u64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE repeaters SET channel_id = ?1, last_message_id = NULL WHERE id = ?2",
            (channel_id.to_string(), id),
        )?;
        Ok(())
    }

    pub fn set_repeater_no_redundant(&self, id: i64, no_redundant: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE repeaters SET no_redundant = ?1 WHERE id = ?2",
            (no_redundant, id),
        )?;
        Ok(())
    }

    pub fn update_repeater_schedule(
        &self,
        id: i64,
        interval: Duration,
        start_time_of_day: Option<NaiveTime>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE repeaters SET interval_secs = ?1, start_time_of_day = ?2 WHERE id = ?3",
            (
                interval.as_secs() as i64,
                start_time_of_day.map(|t| t.format(TIME_OF_DAY).to_string()),
                id,
            ),
        )?;
        Ok(())
    }

    pub fn set_repeater_last_message(&self, id: i64, message_id: Option<u64>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE repeaters SET last_message_id = ?1 WHERE id = ?2",
            (message_id.map(|m| m.to_string()), id),
        )?;
        Ok(())
    }

    // --- Guild time zones ---

    pub fn get_guild_timezone(&self, guild_id: u64) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT timezone FROM guild_timezones WHERE guild_id = ?1")?;
        Ok(stmt
            .query_row([guild_id.to_string()], |row| row.get(0))
            .optional()?)
    }

    pub fn set_guild_timezone(&self, guild_id: u64, timezone: Option<&str>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        match timezone {
            Some(tz) => conn.execute(
                "INSERT INTO guild_timezones (guild_id, timezone) VALUES (?1, ?2)
                 ON CONFLICT(guild_id) DO UPDATE SET timezone = ?2",
                (guild_id.to_string(), tz),
            )?,
            None => conn.execute(
                "DELETE FROM guild_timezones WHERE guild_id = ?1",
                [guild_id.to_string()],
            )?,
        };
        Ok(())
    }
}

#[async_trait]
impl RepeaterStore for Database {
    async fn all_repeaters(&self) -> anyhow::Result<Vec<Repeater>> {
        self.run_blocking(|db| db.list_repeaters()).await
    }

    async fn insert_repeater(
        &self,
        new: &NewRepeater,
        max_per_guild: usize,
    ) -> anyhow::Result<Option<Repeater>> {
        let new = new.clone();
        self.run_blocking(move |db| db.create_repeater(&new, max_per_guild))
            .await
    }

    async fn delete_repeater(&self, id: i64) -> anyhow::Result<bool> {
        let deleted = self.run_blocking(move |db| db.delete_repeater(id)).await?;
        Ok(deleted > 0)
    }

    async fn update_message(&self, id: i64, message: &str) -> anyhow::Result<()> {
        let message = message.to_string();
        self.run_blocking(move |db| db.update_repeater_message(id, &message))
            .await
    }

    async fn update_channel(&self, id: i64, channel_id: u64) -> anyhow::Result<()> {
        self.run_blocking(move |db| db.update_repeater_channel(id, channel_id))
            .await
    }

    async fn set_no_redundant(&self, id: i64, no_redundant: bool) -> anyhow::Result<()> {
        self.run_blocking(move |db| db.set_repeater_no_redundant(id, no_redundant))
            .await
    }

    async fn update_schedule(
        &self,
        id: i64,
        interval: Duration,
        start_time_of_day: Option<NaiveTime>,
    ) -> anyhow::Result<()> {
        self.run_blocking(move |db| db.update_repeater_schedule(id, interval, start_time_of_day))
            .await
    }

    async fn set_last_message_id(&self, id: i64, message_id: Option<u64>) -> anyhow::Result<()> {
        self.run_blocking(move |db| db.set_repeater_last_message(id, message_id))
            .await
    }

    async fn guild_timezone(&self, guild_id: u64) -> anyhow::Result<Option<String>> {
        self.run_blocking(move |db| db.get_guild_timezone(guild_id))
            .await
    }

    async fn set_guild_timezone(&self, guild_id: u64, timezone: Option<&str>) -> anyhow::Result<()> {
        let timezone = timezone.map(str::to_string);
        self.run_blocking(move |db| db.set_guild_timezone(guild_id, timezone.as_deref()))
            .await
    }
}

pub fn parse_sqlite_utc(ts: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(ts, SQLITE_DATETIME).ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

fn repeater_from_row(row: &Row<'_>) -> rusqlite::Result<Repeater> {
    let interval_secs: i64 = row.get(4)?;
    let start_time_of_day: Option<String> = row.get(5)?;
    let last_message_id: Option<String> = row.get(7)?;
    let date_added: String = row.get(8)?;

    Ok(Repeater {
        id: row.get(0)?,
        guild_id: parse_id(row, 1)?,
        channel_id: parse_id(row, 2)?,
        message: row.get(3)?,
        interval: Duration::from_secs(interval_secs.max(0) as u64),
        start_time_of_day: start_time_of_day
            .map(|t| NaiveTime::parse_from_str(&t, TIME_OF_DAY).map_err(|e| conversion_error(5, e)))
            .transpose()?,
        no_redundant: row.get(6)?,
        last_message_id: last_message_id
            .map(|m| m.parse::<u64>().map_err(|e| conversion_error(7, e)))
            .transpose()?,
        date_added: parse_sqlite_utc(&date_added).unwrap_or_else(Utc::now),
    })
}

fn parse_id(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}
