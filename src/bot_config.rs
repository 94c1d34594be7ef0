//! Global bot settings kept in `bot.toml` and editable through `/botconfig`.

use crate::error::SettingsError;
use crate::pubsub::PubSub;
use crate::settings::parse::{parse_bool, parse_hex_color, parse_string, print_display, print_hex_color};
use crate::settings::{SettingsBuilder, SettingsStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const BOT_CONFIG_TOPIC: &str = "config.bot.updated";
pub const CURRENT_VERSION: u32 = 2;

const DEFAULT_DM_HELP_TEXT: &str =
    "Type `/help` in a server I share with you to see what I can do.";
const MAX_PREFIX_CHARS: usize = 10;

pub type BotConfigStore = SettingsStore<BotConfig>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub version: u32,
    pub prefix: String,
    pub locale: String,
    /// Forward DMs sent to the bot to its owners.
    pub forward_messages: bool,
    /// Forward to every owner instead of only the first.
    pub forward_to_all_owners: bool,
    pub dm_help_text: String,
    pub color: EmbedColors,
}

/// Embed accent colours as `0xRRGGBB`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedColors {
    pub ok: u32,
    pub error: u32,
    pub pending: u32,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            prefix: ".".to_string(),
            locale: "en-US".to_string(),
            forward_messages: false,
            forward_to_all_owners: false,
            dm_help_text: DEFAULT_DM_HELP_TEXT.to_string(),
            color: EmbedColors::default(),
        }
    }
}

impl Default for EmbedColors {
    fn default() -> Self {
        Self {
            ok: 0x00E584,
            error: 0xEE281F,
            pending: 0xFAA61A,
        }
    }
}

fn valid_prefix(prefix: &String) -> bool {
    prefix.chars().count() <= MAX_PREFIX_CHARS && !prefix.chars().any(char::is_whitespace)
}

fn bindings() -> SettingsBuilder<BotConfig> {
    SettingsBuilder::new()
        .prop_checked(
            "prefix",
            |c: &BotConfig| c.prefix.clone(),
            |c, v| c.prefix = v,
            parse_string,
            print_display,
            valid_prefix,
        )
        .prop(
            "locale",
            |c| c.locale.clone(),
            |c, v| c.locale = v,
            parse_string,
            print_display,
        )
        .prop(
            "forward_messages",
            |c| c.forward_messages,
            |c, v| c.forward_messages = v,
            parse_bool,
            print_display,
        )
        .prop(
            "forward_to_all_owners",
            |c| c.forward_to_all_owners,
            |c, v| c.forward_to_all_owners = v,
            parse_bool,
            print_display,
        )
        .prop(
            "dm_help_text",
            |c| c.dm_help_text.clone(),
            |c, v| c.dm_help_text = v,
            parse_string,
            print_display,
        )
        .prop(
            "color.ok",
            |c| c.color.ok,
            |c, v| c.color.ok = v,
            parse_hex_color,
            print_hex_color,
        )
        .prop(
            "color.error",
            |c| c.color.error,
            |c, v| c.color.error = v,
            parse_hex_color,
            print_hex_color,
        )
        .prop(
            "color.pending",
            |c| c.color.pending,
            |c, v| c.color.pending = v,
            parse_hex_color,
            print_hex_color,
        )
}

/// Loads the bot settings and brings an older file up to [`CURRENT_VERSION`].
pub async fn load(
    path: impl Into<PathBuf>,
    bus: Arc<dyn PubSub>,
) -> Result<Arc<BotConfigStore>, SettingsError> {
    let store = bindings().load(path, BOT_CONFIG_TOPIC, bus).await?;
    migrate(&store).await?;
    Ok(store)
}

async fn migrate(store: &BotConfigStore) -> Result<(), SettingsError> {
    let from = store.snapshot().version;
    if from >= CURRENT_VERSION {
        return Ok(());
    }

    store
        .modify(|c| {
            if c.version < 2 && c.dm_help_text.trim().is_empty() {
                c.dm_help_text = DEFAULT_DM_HELP_TEXT.to_string();
            }
            c.version = CURRENT_VERSION;
        })
        .await?;
    info!("Bot config: migrated from version {} to {}", from, CURRENT_VERSION);
    Ok(())
}
