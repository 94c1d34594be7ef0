//! File-backed typed settings with string get/set by key.
//!
//! A [`SettingsStore`] owns the current settings value. Readers always get
//! a deep copy. Every change goes through [`SettingsStore::modify`], which
//! serializes writers, persists the new value, swaps it in and publishes it
//! so other stores on the same topic pick it up.
//!
//! Stores on one topic share one file. The file is what changes are built
//! on and what listeners refresh from; the published payload is only used
//! when the file cannot be read.

pub mod parse;

use crate::error::SettingsError;
use crate::pubsub::{self, PubSub, TypedKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

pub trait Settings: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

impl<T> Settings for T where T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {}

type Apply<T> = Box<dyn FnOnce(&mut T) + Send>;
type Printer<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type Parser<T> = Box<dyn Fn(&str) -> Result<Apply<T>, SettingsError> + Send + Sync>;

struct Binding<T> {
    print: Printer<T>,
    parse: Parser<T>,
}

/// Collects key bindings. Bindings are frozen once [`SettingsBuilder::load`]
/// returns a store, so nothing can be registered after startup.
pub struct SettingsBuilder<T> {
    bindings: BTreeMap<String, Binding<T>>,
}

impl<T: Settings> Default for SettingsBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Settings> SettingsBuilder<T> {
    pub fn new() -> Self {
        Self {
            bindings: BTreeMap::new(),
        }
    }

    /// Binds `key` (case-insensitive) to a field reached through `get`/`set`.
    pub fn prop<V>(
        self,
        key: &str,
        get: fn(&T) -> V,
        set: fn(&mut T, V),
        parse: fn(&str) -> Option<V>,
        print: fn(&V) -> String,
    ) -> Self
    where
        V: Send + 'static,
    {
        self.prop_checked(key, get, set, parse, print, |_| true)
    }

    /// Like [`prop`](Self::prop), with `check` vetting parsed values.
    pub fn prop_checked<V>(
        mut self,
        key: &str,
        get: fn(&T) -> V,
        set: fn(&mut T, V),
        parse: fn(&str) -> Option<V>,
        print: fn(&V) -> String,
        check: fn(&V) -> bool,
    ) -> Self
    where
        V: Send + 'static,
    {
        let name = key.to_lowercase();
        let parse_key = name.clone();
        let binding = Binding {
            print: Box::new(move |settings: &T| print(&get(settings))),
            parse: Box::new(move |raw: &str| {
                let value = parse(raw).ok_or_else(|| SettingsError::Parse {
                    key: parse_key.clone(),
                    value: raw.to_string(),
                })?;
                if !check(&value) {
                    return Err(SettingsError::Rejected {
                        key: parse_key.clone(),
                        value: raw.to_string(),
                    });
                }
                Ok(Box::new(move |settings: &mut T| set(settings, value)) as Apply<T>)
            }),
        };
        if self.bindings.insert(name, binding).is_some() {
            debug!("Settings: binding for '{}' registered twice, keeping the last", key);
        }
        self
    }

    /// Loads settings from `path`, writing defaults there if the file does not
    /// exist, and starts listening for changes published on `topic`.
    pub async fn load(
        self,
        path: impl Into<PathBuf>,
        topic: &str,
        bus: Arc<dyn PubSub>,
    ) -> Result<Arc<SettingsStore<T>>, SettingsError> {
        let path = path.into();
        let origin = next_origin();
        let data = match read_settings::<T>(&path).await? {
            Some(data) => data,
            None => {
                info!("Settings: {} not found, writing defaults", path.display());
                let data = T::default();
                write_settings(&path, &data, origin).await?;
                data
            }
        };

        let shutdown = CancellationToken::new();
        let store = Arc::new(SettingsStore {
            path,
            origin,
            key: TypedKey::new(topic),
            bus,
            bindings: self.bindings,
            data: RwLock::new(Arc::new(data)),
            write_gate: tokio::sync::Mutex::new(()),
            _listener: shutdown.clone().drop_guard(),
        });
        SettingsStore::spawn_listener(&store, shutdown);
        Ok(store)
    }
}

#[derive(Serialize, Deserialize)]
struct SettingsChanged<T> {
    origin: u64,
    settings: T,
}

pub struct SettingsStore<T: Settings> {
    path: PathBuf,
    origin: u64,
    key: TypedKey<SettingsChanged<T>>,
    bus: Arc<dyn PubSub>,
    bindings: BTreeMap<String, Binding<T>>,
    data: RwLock<Arc<T>>,
    /// Held for the whole copy-mutate-save-swap-publish sequence and while
    /// applying changes received from the bus.
    write_gate: tokio::sync::Mutex<()>,
    _listener: DropGuard,
}

impl<T: Settings> SettingsStore<T> {
    pub fn builder() -> SettingsBuilder<T> {
        SettingsBuilder::new()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Independent copy of the current settings.
    pub fn snapshot(&self) -> T {
        (*self.current()).clone()
    }

    fn current(&self) -> Arc<T> {
        self.data.read().unwrap().clone()
    }

    fn replace(&self, next: T) {
        *self.data.write().unwrap() = Arc::new(next);
    }

    /// Applies `mutate` to a copy of the current settings, saves it, makes it
    /// current and publishes it. Returns the new settings.
    pub async fn modify<F>(&self, mutate: F) -> Result<T, SettingsError>
    where
        F: FnOnce(&mut T),
    {
        let _gate = self.write_gate.lock().await;
        let mut next = self.latest().await?;
        mutate(&mut next);
        write_settings(&self.path, &next, self.origin).await?;
        self.replace(next.clone());
        self.publish(&next).await;
        Ok(next)
    }

    /// Discards the in-memory value in favour of what is on disk. A missing
    /// file is an `Io` error and leaves the current value in place.
    pub async fn reload(&self) -> Result<T, SettingsError> {
        let _gate = self.write_gate.lock().await;
        let next = read_settings::<T>(&self.path)
            .await?
            .ok_or_else(|| SettingsError::Io {
                path: self.path.clone(),
                source: std::io::ErrorKind::NotFound.into(),
            })?;
        self.replace(next.clone());
        self.publish(&next).await;
        info!("Settings: reloaded {}", self.path.display());
        Ok(next)
    }

    /// The file is shared by every store on the topic, so it is the base for
    /// changes. Falls back to memory if the file has gone missing. Callers
    /// hold the write gate.
    async fn latest(&self) -> Result<T, SettingsError> {
        Ok(read_settings::<T>(&self.path)
            .await?
            .unwrap_or_else(|| self.snapshot()))
    }

    pub fn get_setting(&self, key: &str) -> Option<String> {
        let binding = self.bindings.get(&key.to_lowercase())?;
        Some((binding.print)(&self.current()))
    }

    /// Parses `value` for `key` and applies it. Nothing changes on failure.
    pub async fn try_set_setting(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let name = key.to_lowercase();
        let binding = self
            .bindings
            .get(&name)
            .ok_or_else(|| SettingsError::UnknownKey(key.to_string()))?;
        let apply = (binding.parse)(value)?;
        self.modify(apply).await?;
        info!("Settings: '{}' set to '{}'", name, value);
        Ok(())
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> bool {
        match self.try_set_setting(key, value).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Settings: set '{}' failed: {}", key, e);
                false
            }
        }
    }

    pub fn settable_keys(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    async fn publish(&self, settings: &T) {
        let change = SettingsChanged {
            origin: self.origin,
            settings: settings.clone(),
        };
        if let Err(e) = pubsub::publish(self.bus.as_ref(), &self.key, &change).await {
            error!(
                "Settings: saved {} but could not publish the change: {}",
                self.path.display(),
                e
            );
        }
    }

    fn spawn_listener(store: &Arc<Self>, shutdown: CancellationToken) {
        let mut changes = pubsub::subscribe(store.bus.as_ref(), &store.key);
        let weak = Arc::downgrade(store);
        let topic = store.key.name().to_string();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = changes.recv() => change,
                };
                let Some(change) = change else { break };
                let Some(store) = weak.upgrade() else { break };
                if change.origin == store.origin {
                    continue;
                }
                // Notifications can arrive after this store has written a
                // newer value, so take what is on disk rather than the payload.
                let _gate = store.write_gate.lock().await;
                let next = match read_settings::<T>(&store.path).await {
                    Ok(Some(on_disk)) => on_disk,
                    Ok(None) => change.settings,
                    Err(e) => {
                        warn!("Settings: could not re-read after change on '{}': {}", topic, e);
                        change.settings
                    }
                };
                store.replace(next);
                debug!("Settings: applied change from {} on '{}'", change.origin, topic);
            }
        });
    }
}

fn next_origin() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    (u64::from(std::process::id()) << 32) | COUNTER.fetch_add(1, Ordering::Relaxed)
}

async fn read_settings<T: Settings>(path: &Path) -> Result<Option<T>, SettingsError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| SettingsError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes through a sibling temp file and renames it over `path` so readers
/// never see a partial file.
async fn write_settings<T: Settings>(
    path: &Path,
    settings: &T,
    origin: u64,
) -> Result<(), SettingsError> {
    let contents = toml::to_string_pretty(settings)?;
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    // Per-store temp name: stores sharing the file may write at the same time.
    let tmp_path = path.with_extension(format!("toml.{:x}.new", origin));
    tokio::fs::write(&tmp_path, contents).await.map_err(io_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse::{parse_bool, parse_hex_color, parse_string, print_display, print_hex_color};
    use super::*;
    use crate::pubsub::LocalPubSub;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct TestSettings {
        prefix: String,
        verbose: bool,
        color: Colors,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Colors {
        ok: u32,
    }

    impl Default for TestSettings {
        fn default() -> Self {
            Self {
                prefix: ".".to_string(),
                verbose: false,
                color: Colors::default(),
            }
        }
    }

    impl Default for Colors {
        fn default() -> Self {
            Self { ok: 0x00E584 }
        }
    }

    fn builder() -> SettingsBuilder<TestSettings> {
        SettingsBuilder::new()
            .prop(
                "prefix",
                |s: &TestSettings| s.prefix.clone(),
                |s, v| s.prefix = v,
                parse_string,
                print_display,
            )
            .prop(
                "verbose",
                |s| s.verbose,
                |s, v| s.verbose = v,
                parse_bool,
                print_display,
            )
            .prop(
                "color.ok",
                |s| s.color.ok,
                |s, v| s.color.ok = v,
                parse_hex_color,
                print_hex_color,
            )
    }

    async fn load_in(dir: &TempDir, bus: Arc<dyn PubSub>) -> Arc<SettingsStore<TestSettings>> {
        builder()
            .load(dir.path().join("bot.toml"), "settings:test", bus)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let store = load_in(&dir, Arc::new(LocalPubSub::new())).await;

        assert_eq!(store.snapshot(), TestSettings::default());
        let on_disk = std::fs::read_to_string(dir.path().join("bot.toml")).unwrap();
        let parsed: TestSettings = toml::from_str(&on_disk).unwrap();
        assert_eq!(parsed, TestSettings::default());
    }

    #[tokio::test]
    async fn test_saved_settings_load_back_identically() {
        let dir = TempDir::new().unwrap();
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let store = load_in(&dir, bus.clone()).await;
        let saved = store
            .modify(|s| {
                s.prefix = "!!".to_string();
                s.verbose = true;
                s.color.ok = 0x123456;
            })
            .await
            .unwrap();
        drop(store);

        let reopened = load_in(&dir, bus).await;
        assert_eq!(reopened.snapshot(), saved);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bot.toml"), "prefix = [unterminated").unwrap();

        let result = builder()
            .load(dir.path().join("bot.toml"), "settings:test", Arc::new(LocalPubSub::new()))
            .await;
        assert!(matches!(result, Err(SettingsError::Corrupt { .. })));
        // The broken file is left for an operator to fix.
        let contents = std::fs::read_to_string(dir.path().join("bot.toml")).unwrap();
        assert_eq!(contents, "prefix = [unterminated");
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated() {
        let dir = TempDir::new().unwrap();
        let store = load_in(&dir, Arc::new(LocalPubSub::new())).await;

        let mut copy = store.snapshot();
        copy.prefix = "mutated".to_string();
        copy.color.ok = 0;

        assert_eq!(store.snapshot(), TestSettings::default());
    }

    #[tokio::test]
    async fn test_get_and_set_by_key() {
        let dir = TempDir::new().unwrap();
        let store = load_in(&dir, Arc::new(LocalPubSub::new())).await;

        assert_eq!(store.get_setting("PREFIX").as_deref(), Some("."));
        assert_eq!(store.get_setting("color.ok").as_deref(), Some("#00E584"));
        assert_eq!(store.get_setting("nope"), None);

        assert!(store.set_setting("Color.Ok", "#ff0000").await);
        assert_eq!(store.snapshot().color.ok, 0xFF0000);
        assert!(store.set_setting("verbose", "on").await);
        assert!(store.snapshot().verbose);
    }

    #[tokio::test]
    async fn test_failed_set_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let store = load_in(&dir, Arc::new(LocalPubSub::new())).await;
        let before = store.snapshot();

        assert!(!store.set_setting("missing", "x").await);
        assert!(!store.set_setting("verbose", "perhaps").await);
        assert!(matches!(
            store.try_set_setting("color.ok", "#12").await,
            Err(SettingsError::Parse { .. })
        ));
        assert!(matches!(
            store.try_set_setting("unknown", "1").await,
            Err(SettingsError::UnknownKey(_))
        ));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_checked_binding_rejects_value() {
        let dir = TempDir::new().unwrap();
        let store = SettingsBuilder::<TestSettings>::new()
            .prop_checked(
                "prefix",
                |s| s.prefix.clone(),
                |s, v| s.prefix = v,
                parse_string,
                print_display,
                |v| v.len() <= 3,
            )
            .load(dir.path().join("bot.toml"), "settings:test", Arc::new(LocalPubSub::new()))
            .await
            .unwrap();

        assert!(matches!(
            store.try_set_setting("prefix", "toolong").await,
            Err(SettingsError::Rejected { .. })
        ));
        assert_eq!(store.snapshot().prefix, ".");
    }

    #[tokio::test]
    async fn test_concurrent_sets_resolve_to_one_value() {
        let dir = TempDir::new().unwrap();
        let store = load_in(&dir, Arc::new(LocalPubSub::new())).await;

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.set_setting("prefix", "!").await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.set_setting("prefix", "?").await })
        };
        assert!(a.await.unwrap());
        assert!(b.await.unwrap());

        let final_prefix = store.snapshot().prefix;
        assert!(final_prefix == "!" || final_prefix == "?");
        let on_disk: TestSettings =
            toml::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk.prefix, final_prefix);
    }

    #[tokio::test]
    async fn test_concurrent_modifies_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let store = load_in(&dir, Arc::new(LocalPubSub::new())).await;

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.modify(|s| s.color.ok += 1).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.snapshot().color.ok, 0x00E584 + 20);
    }

    #[tokio::test]
    async fn test_changes_propagate_between_stores() {
        let dir = TempDir::new().unwrap();
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let writer = load_in(&dir, bus.clone()).await;
        let reader = load_in(&dir, bus).await;

        writer.set_setting("prefix", ">").await;

        for _ in 0..50 {
            if reader.snapshot().prefix == ">" {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("reader never saw the published change");
    }

    #[tokio::test]
    async fn test_reload_discards_memory_for_disk() {
        let dir = TempDir::new().unwrap();
        let store = load_in(&dir, Arc::new(LocalPubSub::new())).await;
        store.set_setting("prefix", "+").await;

        std::fs::write(store.path(), "prefix = \"-\"\n").unwrap();
        let reloaded = store.reload().await.unwrap();

        assert_eq!(reloaded.prefix, "-");
        assert_eq!(store.snapshot().prefix, "-");
        assert!(!store.snapshot().verbose);
    }

    #[tokio::test]
    async fn test_reload_of_missing_file_keeps_current_value() {
        let dir = TempDir::new().unwrap();
        let store = load_in(&dir, Arc::new(LocalPubSub::new())).await;
        store.set_setting("prefix", "+").await;

        std::fs::remove_file(store.path()).unwrap();
        assert!(matches!(store.reload().await, Err(SettingsError::Io { .. })));
        assert_eq!(store.snapshot().prefix, "+");
    }

    async fn settle(stores: &[&Arc<SettingsStore<TestSettings>>]) -> TestSettings {
        let path = stores[0].path().to_path_buf();
        for _ in 0..100 {
            let on_disk: TestSettings =
                toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
            if stores.iter().all(|s| s.snapshot() == on_disk) {
                return on_disk;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("stores never agreed with the file");
    }

    #[tokio::test]
    async fn test_back_to_back_writes_from_two_stores_converge() {
        let dir = TempDir::new().unwrap();
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let a = load_in(&dir, bus.clone()).await;
        let b = load_in(&dir, bus).await;

        // `b` writes before its listener has seen `a`'s change.
        a.modify(|s| s.prefix = "a".to_string()).await.unwrap();
        b.modify(|s| s.verbose = true).await.unwrap();

        let agreed = settle(&[&a, &b]).await;
        assert_eq!(agreed.prefix, "a");
        assert!(agreed.verbose);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_writes_from_two_stores_converge() {
        let dir = TempDir::new().unwrap();
        let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
        let a = load_in(&dir, bus.clone()).await;
        let b = load_in(&dir, bus).await;

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = if i % 2 == 0 { a.clone() } else { b.clone() };
            tasks.push(tokio::spawn(async move {
                store.modify(|s| s.color.ok += 1).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        settle(&[&a, &b]).await;
    }

    #[tokio::test]
    async fn test_settable_keys_are_sorted() {
        let dir = TempDir::new().unwrap();
        let store = load_in(&dir, Arc::new(LocalPubSub::new())).await;
        assert_eq!(store.settable_keys(), vec!["color.ok", "prefix", "verbose"]);
    }
}
