use crate::error::SettingsError;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::{error, info};

/// Bot-wide settings (owner only)
#[poise::command(
    slash_command,
    subcommands("get", "set", "list"),
    owners_only,
    hide_in_help
)]
pub async fn botconfig(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

async fn autocomplete_key<'a>(
    ctx: Context<'a>,
    partial: &'a str,
) -> impl Iterator<Item = String> + 'a {
    let partial = partial.to_lowercase();
    ctx.data()
        .settings
        .settable_keys()
        .into_iter()
        .filter(move |key| key.starts_with(&partial))
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
}

/// Show one setting
#[poise::command(slash_command, owners_only)]
pub async fn get(
    ctx: Context<'_>,
    #[description = "Setting name"]
    #[autocomplete = "autocomplete_key"]
    key: String,
) -> Result<(), Error> {
    match ctx.data().settings.get_setting(&key) {
        Some(value) => ctx.say(format!("`{}` = `{}`", key.to_lowercase(), value)).await?,
        None => ctx.say(format!("❌ Unknown setting `{}`.", key)).await?,
    };
    Ok(())
}

/// Change one setting
#[poise::command(slash_command, owners_only)]
pub async fn set(
    ctx: Context<'_>,
    #[description = "Setting name"]
    #[autocomplete = "autocomplete_key"]
    key: String,
    #[description = "New value"] value: String,
) -> Result<(), Error> {
    let settings = &ctx.data().settings;
    match settings.try_set_setting(&key, &value).await {
        Ok(()) => {
            let shown = settings.get_setting(&key).unwrap_or(value);
            info!("{} set bot setting {} = {}", ctx.author().name, key, shown);
            ctx.say(format!("✅ `{}` is now `{}`.", key.to_lowercase(), shown))
                .await?;
        }
        Err(
            e @ (SettingsError::UnknownKey(_)
            | SettingsError::Parse { .. }
            | SettingsError::Rejected { .. }),
        ) => {
            ctx.say(format!("❌ {}.", e)).await?;
        }
        Err(e) => {
            error!("Failed to save bot setting {}: {}", key, e);
            ctx.say("❌ The setting could not be saved.").await?;
        }
    }
    Ok(())
}

/// List every setting with its current value
#[poise::command(slash_command, owners_only)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let settings = &ctx.data().settings;
    let lines: Vec<String> = settings
        .settable_keys()
        .into_iter()
        .map(|key| {
            let value = settings.get_setting(key).unwrap_or_default();
            format!("`{}` = `{}`", key, value)
        })
        .collect();

    let embed = serenity::CreateEmbed::new()
        .title("⚙️ Bot settings")
        .description(lines.join("\n"))
        .color(settings.snapshot().color.ok);
    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}
