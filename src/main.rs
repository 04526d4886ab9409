use std::env;
use std::sync::Arc;

use poise::serenity_prelude as serenity;
use serenity::all::FullEvent;
use tracing::{error, info, warn};

mod commands;
mod helpers;
mod structs;
mod types;

use types::{Data, Error};

use crate::commands::all_commands;
use crate::helpers::locks::EntryLocks;
use crate::helpers::retention_task::{retention_task, sweep_interval};
use crate::helpers::starboard::{SqliteStarboardStore, StarboardStore};
use crate::helpers::starboard_manager::{
    handle_reaction_add, handle_reaction_remove, handle_reaction_remove_all,
};

async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match &error {
        poise::FrameworkError::Setup { error, .. } => panic!("Failed to start bot: {}", error),
        poise::FrameworkError::Command { ctx, error, .. }
        | poise::FrameworkError::ArgumentParse { ctx, error, .. } => {
            warn!(command = %ctx.command().name, error = %error, "command failed");
            let _ = ctx.say(format!("That didn't work: {error}")).await;
        }
        poise::FrameworkError::MissingUserPermissions { ctx, .. } => {
            let _ = ctx.say("You don't have permission to do that.").await;
        }
        _ => {
            if let Err(e) = poise::builtins::on_error(error).await {
                error!(error = %e, "error handler failed");
            }
        }
    }
}

/// Reaction traffic drives the starboards. Nothing here is allowed to
/// propagate: a failed event is logged and dropped, never retried.
async fn event_handler(
    ctx: &serenity::Context,
    event: &FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        FullEvent::Ready { data_about_bot } => {
            info!("logged in as {}", data_about_bot.user.name);
        }
        FullEvent::ReactionAdd { add_reaction } => {
            if let Err(e) = handle_reaction_add(ctx, add_reaction, data).await {
                warn!(
                    message = add_reaction.message_id.get(),
                    error = %e,
                    "reaction add handling failed"
                );
            }
        }
        FullEvent::ReactionRemove { removed_reaction } => {
            if let Err(e) = handle_reaction_remove(ctx, removed_reaction, data).await {
                warn!(
                    message = removed_reaction.message_id.get(),
                    error = %e,
                    "reaction remove handling failed"
                );
            }
        }
        FullEvent::ReactionRemoveAll {
            channel_id,
            removed_from_message_id,
        } => {
            if let Err(e) =
                handle_reaction_remove_all(ctx, *channel_id, *removed_from_message_id, data).await
            {
                warn!(
                    message = removed_from_message_id.get(),
                    error = %e,
                    "reaction clear handling failed"
                );
            }
        }
        _ => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lumen=info")),
        )
        .init();

    let token = env::var("DISCORD_TOKEN").expect("Missing DISCORD_TOKEN");
    let db_url = env::var("DATABASE_URL").expect("Missing DATABASE_URL");
    let sweep = sweep_interval(env::var("SWEEP_INTERVAL_HOURS").ok().as_deref());

    let store: Arc<dyn StarboardStore> = Arc::new(SqliteStarboardStore::new(&db_url).await?);
    let locks = Arc::new(EntryLocks::new());

    let intents = serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MEMBERS
        | serenity::GatewayIntents::GUILD_MESSAGE_REACTIONS;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: all_commands(),
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            on_error: |error| Box::pin(on_error(error)),
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            let store = Arc::clone(&store);
            let locks = Arc::clone(&locks);

            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                tokio::spawn(retention_task(Arc::clone(&store), Arc::clone(&locks), sweep));

                Ok(Data { store, locks })
            })
        })
        .build();

    let mut client = serenity::Client::builder(token, intents)
        .framework(framework)
        .await?;

    client.start().await?;

    Ok(())
}
