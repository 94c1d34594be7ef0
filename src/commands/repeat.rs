use crate::error::RepeaterError;
use crate::repeaters::{FireOutcome, RepeaterInfo};
use crate::{Context, Error};
use chrono::NaiveTime;
use humantime::parse_duration;
use poise::serenity_prelude as serenity;
use std::time::Duration;
use tracing::{error, info};

const PREVIEW_CHARS: usize = 60;

/// Messages re-posted on a schedule
#[poise::command(
    slash_command,
    subcommands(
        "add", "list", "remove", "trigger", "message", "channel", "redundant", "schedule",
        "timezone"
    ),
    required_permissions = "MANAGE_MESSAGES",
    guild_only
)]
pub async fn repeat(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Add a repeater (interval examples: 30m, 2h, 1d)
#[poise::command(slash_command, guild_only)]
pub async fn add(
    ctx: Context<'_>,
    #[description = "How often to post (e.g., 30m, 2h, 1d)"] interval: String,
    #[description = "Message to post"] message: String,
    #[description = "Channel to post in (default: this channel)"]
    #[channel_types("Text", "News")]
    channel: Option<serenity::GuildChannel>,
    #[description = "Time of day to align to, HH:MM in the server time zone"]
    start_time: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let channel_id = channel.map(|c| c.id).unwrap_or_else(|| ctx.channel_id());

    let Some(interval) = parse_interval(&interval) else {
        ctx.say("❌ Invalid interval. Examples: `30m`, `2h`, `1d 2h`.")
            .await?;
        return Ok(());
    };
    let start_time = match start_time.as_deref().map(parse_time_of_day) {
        None => None,
        Some(Some(time)) => Some(time),
        Some(None) => {
            ctx.say("❌ Invalid time of day. Use `HH:MM`, e.g. `09:30`.")
                .await?;
            return Ok(());
        }
    };

    let created = match ctx
        .data()
        .repeaters
        .create(
            guild_id.get(),
            channel_id.get(),
            message.trim(),
            interval,
            start_time,
        )
        .await
    {
        Ok(created) => created,
        Err(e) => return report(ctx, e).await,
    };

    let position = ctx
        .data()
        .repeaters
        .list(guild_id.get())
        .ok()
        .and_then(|list| list.iter().position(|i| i.repeater.id == created.id))
        .map_or(1, |p| p + 1);
    ctx.say(format!(
        "✅ Repeater #{} will post in <#{}> every **{}**.",
        position,
        created.channel_id,
        humantime::format_duration(created.interval)
    ))
    .await?;
    Ok(())
}

/// List this server's repeaters
#[poise::command(slash_command, guild_only)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let repeaters = match ctx.data().repeaters.list(guild_id.get()) {
        Ok(list) => list,
        Err(e) => return report(ctx, e).await,
    };

    if repeaters.is_empty() {
        ctx.say("📭 No repeaters on this server.").await?;
        return Ok(());
    }

    let color = ctx.data().settings.snapshot().color.ok;
    let lines: Vec<String> = repeaters
        .iter()
        .enumerate()
        .map(|(i, info)| format_entry(i + 1, info))
        .collect();
    let embed = serenity::CreateEmbed::new()
        .title("🔁 Repeaters")
        .description(lines.join("\n"))
        .color(color);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Remove a repeater
#[poise::command(slash_command, guild_only)]
pub async fn remove(
    ctx: Context<'_>,
    #[description = "Number shown by /repeat list"]
    #[min = 1]
    index: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let registry = &ctx.data().repeaters;

    let result = match registry.runner_at(guild_id, index) {
        Ok(info) => registry.remove(guild_id, info.repeater.id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(removed) => {
            ctx.say(format!(
                "✅ Removed repeater #{}: {}",
                index,
                preview(&removed.message)
            ))
            .await?;
            Ok(())
        }
        Err(e) => report(ctx, e).await,
    }
}

/// Post a repeater's message right now
#[poise::command(slash_command, guild_only)]
pub async fn trigger(
    ctx: Context<'_>,
    #[description = "Number shown by /repeat list"]
    #[min = 1]
    index: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let registry = &ctx.data().repeaters;
    ctx.defer_ephemeral().await?;

    let result = match registry.runner_at(guild_id, index) {
        Ok(info) => registry.trigger(guild_id, info.repeater.id).await,
        Err(e) => Err(e),
    };
    let reply = match result {
        Ok(FireOutcome::Sent(_)) => format!("✅ Repeater #{} posted.", index),
        Ok(FireOutcome::Suppressed) => format!(
            "🤫 Repeater #{} skipped: nothing new in the channel since its last post.",
            index
        ),
        Ok(FireOutcome::Failed) => format!(
            "⚠️ Repeater #{} could not post right now; it will try again on schedule.",
            index
        ),
        Ok(FireOutcome::Unreachable) => format!(
            "❌ Repeater #{} can no longer post in its channel and was removed.",
            index
        ),
        Err(e) => return report(ctx, e).await,
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Change a repeater's message
#[poise::command(slash_command, guild_only)]
pub async fn message(
    ctx: Context<'_>,
    #[description = "Number shown by /repeat list"]
    #[min = 1]
    index: usize,
    #[description = "New message"] text: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let registry = &ctx.data().repeaters;

    let result = match registry.runner_at(guild_id, index) {
        Ok(info) => {
            registry
                .update_message(guild_id, info.repeater.id, text.trim())
                .await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            ctx.say(format!("✅ Repeater #{} message updated.", index))
                .await?;
            Ok(())
        }
        Err(e) => report(ctx, e).await,
    }
}

/// Move a repeater to another channel
#[poise::command(slash_command, guild_only)]
pub async fn channel(
    ctx: Context<'_>,
    #[description = "Number shown by /repeat list"]
    #[min = 1]
    index: usize,
    #[description = "New channel"]
    #[channel_types("Text", "News")]
    channel: serenity::GuildChannel,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let registry = &ctx.data().repeaters;

    let result = match registry.runner_at(guild_id, index) {
        Ok(info) => {
            registry
                .update_channel(guild_id, info.repeater.id, channel.id.get())
                .await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            ctx.say(format!("✅ Repeater #{} now posts in <#{}>.", index, channel.id))
                .await?;
            Ok(())
        }
        Err(e) => report(ctx, e).await,
    }
}

/// Toggle skipping posts when nobody wrote since the last one
#[poise::command(slash_command, guild_only)]
pub async fn redundant(
    ctx: Context<'_>,
    #[description = "Number shown by /repeat list"]
    #[min = 1]
    index: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let registry = &ctx.data().repeaters;

    let result = match registry.runner_at(guild_id, index) {
        Ok(info) => registry.toggle_redundant(guild_id, info.repeater.id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(true) => {
            ctx.say(format!(
                "✅ Repeater #{} will skip posting while the channel is quiet.",
                index
            ))
            .await?;
            Ok(())
        }
        Ok(false) => {
            ctx.say(format!("✅ Repeater #{} will always post.", index))
                .await?;
            Ok(())
        }
        Err(e) => report(ctx, e).await,
    }
}

/// Change a repeater's interval and time of day
#[poise::command(slash_command, guild_only)]
pub async fn schedule(
    ctx: Context<'_>,
    #[description = "Number shown by /repeat list"]
    #[min = 1]
    index: usize,
    #[description = "How often to post (e.g., 30m, 2h, 1d)"] interval: String,
    #[description = "Time of day to align to, HH:MM (omit to clear)"]
    start_time: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let registry = &ctx.data().repeaters;

    let Some(interval) = parse_interval(&interval) else {
        ctx.say("❌ Invalid interval. Examples: `30m`, `2h`, `1d 2h`.")
            .await?;
        return Ok(());
    };
    let start_time = match start_time.as_deref().map(parse_time_of_day) {
        None => None,
        Some(Some(time)) => Some(time),
        Some(None) => {
            ctx.say("❌ Invalid time of day. Use `HH:MM`, e.g. `09:30`.")
                .await?;
            return Ok(());
        }
    };

    let result = match registry.runner_at(guild_id, index) {
        Ok(info) => {
            registry
                .reschedule(guild_id, info.repeater.id, interval, start_time)
                .await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            ctx.say(format!(
                "✅ Repeater #{} now posts every **{}**.",
                index,
                humantime::format_duration(interval)
            ))
            .await?;
            Ok(())
        }
        Err(e) => report(ctx, e).await,
    }
}

/// Show or set the time zone used for repeater times of day
#[poise::command(slash_command, guild_only)]
pub async fn timezone(
    ctx: Context<'_>,
    #[description = "IANA zone, e.g. Europe/Berlin (omit to show the current one)"]
    zone: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?.get();
    let registry = &ctx.data().repeaters;

    let Some(zone) = zone else {
        match registry.guild_timezone(guild_id).await {
            Ok(tz) => {
                ctx.say(format!("🕒 Repeater times are in **{}**.", tz.name()))
                    .await?;
                return Ok(());
            }
            Err(e) => return report(ctx, e).await,
        }
    };

    match registry.set_guild_timezone(guild_id, Some(&zone)).await {
        Ok(tz) => {
            info!("Guild {} set repeater time zone to {}", guild_id, tz.name());
            ctx.say(format!("✅ Repeater times are now in **{}**.", tz.name()))
                .await?;
            Ok(())
        }
        Err(e) => report(ctx, e).await,
    }
}

async fn report(ctx: Context<'_>, err: RepeaterError) -> Result<(), Error> {
    if let RepeaterError::Storage(e) = &err {
        error!("Repeater command failed: {:?}", e);
        ctx.say("❌ Something went wrong saving that change.").await?;
        return Ok(());
    }
    ctx.say(format!("❌ {}.", capitalize(&err.to_string())))
        .await?;
    Ok(())
}

fn parse_interval(input: &str) -> Option<Duration> {
    parse_duration(input.trim()).ok()
}

/// Accepts `HH:MM` or `HH:MM:SS`, 24-hour.
fn parse_time_of_day(input: &str) -> Option<NaiveTime> {
    let input = input.trim();
    NaiveTime::parse_from_str(input, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(input, "%H:%M:%S"))
        .ok()
}

fn format_entry(position: usize, info: &RepeaterInfo) -> String {
    let r = &info.repeater;
    let mut line = format!(
        "`#{}` <#{}> every **{}**",
        position,
        r.channel_id,
        humantime::format_duration(r.interval)
    );
    if let Some(time) = r.start_time_of_day {
        line.push_str(&format!(" at {}", time.format("%H:%M")));
    }
    if r.no_redundant {
        line.push_str(" (skips when quiet)");
    }
    if let Some(next) = info.next_fire {
        line.push_str(&format!(", next <t:{}:R>", next.timestamp()));
    }
    line.push_str(&format!("\n> {}", preview(&r.message)));
    line
}

fn preview(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default();
    let mut snippet: String = first_line.chars().take(PREVIEW_CHARS).collect();
    if message.chars().count() > snippet.chars().count() {
        snippet.push_str("...");
    }
    snippet
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
