use mewdeko::activity::ChannelActivity;
use mewdeko::clock::SystemClock;
use mewdeko::outbound::DiscordSink;
use mewdeko::pubsub::{LocalPubSub, PubSub};
use mewdeko::repeaters::{RepeaterRegistry, RunnerDeps};
use mewdeko::{bot_config, commands, config::Config, db::Database, Data};
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);
    let discord_token = config.discord_token.clone();

    let db = Database::new(&config)?;
    db.execute_init()?;

    let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::new());
    let settings = bot_config::load(&config.bot_settings_path, bus).await?;

    let activity = ChannelActivity::new(config.activity_cache_channels);
    let http = Arc::new(serenity::Http::new(&discord_token));
    let repeaters = RepeaterRegistry::new(RunnerDeps {
        store: Arc::new(db.clone()),
        sink: Arc::new(DiscordSink::new(http, activity.clone())),
        clock: Arc::new(SystemClock),
    });

    let registry = repeaters.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            event_handler: |_ctx, event, _framework, data| {
                Box::pin(async move {
                    if let serenity::FullEvent::Message { new_message } = event {
                        data.activity
                            .record(new_message.channel_id.get(), new_message.id.get());
                    }
                    Ok(())
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                if config.register_commands {
                    let commands = &framework.options().commands;
                    match config.dev_guild_id {
                        Some(guild_id) => {
                            poise::builtins::register_in_guild(
                                ctx,
                                commands,
                                serenity::GuildId::new(guild_id),
                            )
                            .await?;
                            info!("Registered commands in guild {}", guild_id);
                        }
                        None => {
                            poise::builtins::register_globally(ctx, commands).await?;
                            info!("Registered commands globally");
                        }
                    }
                }

                let loader = repeaters.clone();
                tokio::spawn(async move {
                    if let Err(e) = loader.load_all().await {
                        error!("Failed to load repeaters: {}", e);
                    }
                });

                Ok(Data {
                    config,
                    db,
                    settings,
                    repeaters,
                    activity,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged() | serenity::GatewayIntents::GUILD_MESSAGES;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    registry.shutdown().await;
    Ok(())
}
