use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub database_url: String,
    /// TOML file backing the bot-wide settings store.
    pub bot_settings_path: PathBuf,
    /// How many channels the gateway activity tracker remembers.
    pub activity_cache_channels: usize,
    pub dev_guild_id: Option<u64>,
    pub register_commands: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/mewdeko.db".to_string()),
            bot_settings_path: env::var("BOT_SETTINGS_PATH")
                .unwrap_or_else(|_| "data/bot.toml".to_string())
                .into(),
            activity_cache_channels: env::var("ACTIVITY_CACHE_CHANNELS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            dev_guild_id: env::var("DEV_GUILD_ID").ok().and_then(|id| id.parse().ok()),
            register_commands: env::var("REGISTER_COMMANDS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("database_url", &self.database_url)
            .field("bot_settings_path", &self.bot_settings_path)
            .field("activity_cache_channels", &self.activity_cache_channels)
            .field("dev_guild_id", &self.dev_guild_id)
            .field("register_commands", &self.register_commands)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Missing token
        env::remove_var("DISCORD_TOKEN");
        assert!(Config::build().is_err(), "Should fail without DISCORD_TOKEN");

        // 2. Defaults
        env::set_var("DISCORD_TOKEN", "test_token");
        env::remove_var("DATABASE_URL");
        env::remove_var("BOT_SETTINGS_PATH");
        env::set_var("ACTIVITY_CACHE_CHANNELS", "not a number");
        let config = Config::build().unwrap();
        assert_eq!(config.discord_token, "test_token");
        assert_eq!(config.database_url, "data/mewdeko.db");
        assert_eq!(config.bot_settings_path, PathBuf::from("data/bot.toml"));
        assert_eq!(config.activity_cache_channels, 1000);

        // 3. Debug redaction
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("test_token"));
        assert!(debug_output.contains("[REDACTED]"));

        env::remove_var("DISCORD_TOKEN");
        env::remove_var("ACTIVITY_CACHE_CHANNELS");
    }
}
