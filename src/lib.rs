pub mod activity;
pub mod bot_config;
pub mod clock;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod outbound;
pub mod pubsub;
pub mod repeaters;
pub mod settings;

use std::sync::Arc;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub db: db::Database,
    pub settings: Arc<bot_config::BotConfigStore>,
    pub repeaters: Arc<repeaters::RepeaterRegistry>,
    /// Newest message id per channel, fed by the gateway
    pub activity: activity::ChannelActivity,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
