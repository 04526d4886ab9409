use poise::serenity_prelude as serenity;
use poise::CreateReply;

use crate::helpers::starboard_manager::{self, StarEvent};
use crate::structs::starboard_entry::{ColourPolicy, StarboardEntry};
use crate::types::{Context, Data, Error};

pub fn all_commands() -> Vec<poise::Command<Data, Error>> {
    vec![starboard(), star(), unstar()]
}

/// Manage this server's starboards.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands(
        "create",
        "remove",
        "list",
        "info",
        "enable",
        "disable",
        "threshold",
        "emoji",
        "channel",
        "colour",
        "selfstar",
        "autostar",
        "purge",
        "whitelist",
        "blacklist"
    )
)]
pub async fn starboard(ctx: Context<'_>) -> Result<(), Error> {
    ctx.say("Use one of the `starboard` subcommands; `starboard list` shows what exists.")
        .await?;
    Ok(())
}

/// Create a new starboard.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn create(
    ctx: Context<'_>,
    #[description = "Name for the new starboard"] name: String,
    #[description = "Channel mirrors are posted into"] board_channel: serenity::ChannelId,
    #[description = "Reaction that drives it (default ⭐)"] emoji: Option<String>,
    #[description = "Votes needed to promote (default 2)"] threshold: Option<u64>,
) -> Result<(), Error> {
    let guild = ctx.guild_id().ok_or("guild only command")?.get();
    let name = name.to_lowercase();
    let threshold = threshold.unwrap_or(2);
    if threshold < 1 {
        ctx.say("The threshold must be at least 1.").await?;
        return Ok(());
    }
    let emoji = match normalize_emoji(emoji.as_deref().unwrap_or("⭐")) {
        Ok(emoji) => emoji,
        Err(reply) => {
            ctx.say(reply).await?;
            return Ok(());
        }
    };

    let data = ctx.data();
    let lock = data.locks.get(guild, &name);
    let _guard = lock.lock().await;
    if data.store.get(guild, &name).await?.is_some() {
        ctx.say(format!("A starboard named `{name}` already exists."))
            .await?;
        return Ok(());
    }
    let entry = StarboardEntry::new(&name, board_channel.get(), emoji, threshold);
    data.store.save(guild, &entry).await?;
    ctx.say(format!(
        "Starboard `{name}` created; mirrors go to <#{}>.",
        board_channel.get()
    ))
    .await?;
    Ok(())
}

/// Delete a starboard and every record it tracks.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn remove(
    ctx: Context<'_>,
    #[description = "Starboard to delete"] name: String,
) -> Result<(), Error> {
    let guild = ctx.guild_id().ok_or("guild only command")?.get();
    let name = name.to_lowercase();
    let data = ctx.data();
    let lock = data.locks.get(guild, &name);
    let _guard = lock.lock().await;
    if data.store.delete(guild, &name).await? {
        data.locks.remove(guild, &name);
        ctx.say(format!(
            "Starboard `{name}` and its tracked messages are gone."
        ))
        .await?;
    } else {
        ctx.say(format!("No starboard named `{name}` exists here."))
            .await?;
    }
    Ok(())
}

/// List this server's starboards.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let guild = ctx.guild_id().ok_or("guild only command")?.get();
    let entries = ctx.data().store.list(guild).await?;
    if entries.is_empty() {
        ctx.say("No starboard is configured in this server.").await?;
        return Ok(());
    }
    let lines: Vec<String> = entries
        .iter()
        .map(|e| {
            format!(
                "`{}` — {} in <#{}>, threshold {}{} ({} tracked)",
                e.name,
                e.emoji,
                e.channel,
                e.threshold,
                if e.enabled { "" } else { ", disabled" },
                e.messages.len()
            )
        })
        .collect();
    ctx.say(lines.join("\n")).await?;
    Ok(())
}

/// Show one starboard's full configuration.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn info(
    ctx: Context<'_>,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    let guild = ctx.guild_id().ok_or("guild only command")?.get();
    let Some(name) = resolve_name(&ctx, guild, name.as_deref()).await? else {
        return Ok(());
    };
    // No lock: display may observe a slightly stale snapshot, which is fine.
    let Some(entry) = ctx.data().store.get(guild, &name).await? else {
        return Ok(());
    };

    let colour = match entry.colour {
        ColourPolicy::Fixed(n) => serenity::Colour::new(n),
        _ => serenity::Colour::new(crate::structs::starboard_entry::DEFAULT_COLOUR),
    };
    let embed = serenity::CreateEmbed::default()
        .title(format!("Starboard `{}`", entry.name))
        .colour(colour)
        .field("Channel", format!("<#{}>", entry.channel), true)
        .field("Emoji", entry.emoji.clone(), true)
        .field("Threshold", entry.threshold.to_string(), true)
        .field("Enabled", entry.enabled.to_string(), true)
        .field("Selfstar", entry.selfstar.to_string(), true)
        .field("Autostar", entry.autostar.to_string(), true)
        .field("Colour", entry.colour.to_string(), true)
        .field(
            "Retention",
            entry
                .purge_days
                .map(|d| format!("{d} days"))
                .unwrap_or_else(|| "keep forever".to_string()),
            true,
        )
        .field("Tracked messages", entry.messages.len().to_string(), true)
        .field(
            "Allowed channels",
            fmt_mentions(&entry.whitelist_channel, "<#{}>"),
            false,
        )
        .field(
            "Blocked channels",
            fmt_mentions(&entry.blacklist_channel, "<#{}>"),
            false,
        )
        .field(
            "Allowed roles",
            fmt_mentions(&entry.whitelist_role, "<@&{}>"),
            false,
        )
        .field(
            "Blocked roles",
            fmt_mentions(&entry.blacklist_role, "<@&{}>"),
            false,
        );
    ctx.send(CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Turn a starboard on.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn enable(
    ctx: Context<'_>,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    with_entry(&ctx, name, |entry| {
        entry.enabled = true;
        Ok(format!("Starboard `{}` is enabled.", entry.name))
    })
    .await
}

/// Turn a starboard off without deleting it.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn disable(
    ctx: Context<'_>,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    with_entry(&ctx, name, |entry| {
        entry.enabled = false;
        Ok(format!("Starboard `{}` is disabled.", entry.name))
    })
    .await
}

/// Set how many votes promote a message.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn threshold(
    ctx: Context<'_>,
    #[description = "Votes needed to promote"] threshold: u64,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    if threshold < 1 {
        ctx.say("The threshold must be at least 1.").await?;
        return Ok(());
    }
    with_entry(&ctx, name, |entry| {
        entry.threshold = threshold;
        Ok(format!(
            "Starboard `{}` now promotes at {threshold} votes.",
            entry.name
        ))
    })
    .await
}

/// Change the reaction a starboard listens for.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn emoji(
    ctx: Context<'_>,
    #[description = "New emoji"] emoji: String,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    let emoji = match normalize_emoji(&emoji) {
        Ok(emoji) => emoji,
        Err(reply) => {
            ctx.say(reply).await?;
            return Ok(());
        }
    };
    with_entry(&ctx, name, move |entry| {
        entry.emoji = emoji.clone();
        Ok(format!("Starboard `{}` now watches {}.", entry.name, emoji))
    })
    .await
}

/// Move a starboard's mirror channel.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn channel(
    ctx: Context<'_>,
    #[description = "New mirror channel"] board_channel: serenity::ChannelId,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    with_entry(&ctx, name, move |entry| {
        entry.channel = board_channel.get();
        Ok(format!(
            "Starboard `{}` now mirrors into <#{}>.",
            entry.name,
            board_channel.get()
        ))
    })
    .await
}

/// Set the embed colour: a hex value, `member`, or `bot`.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn colour(
    ctx: Context<'_>,
    #[description = "Hex value, `member`, or `bot`"] colour: String,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    let policy = match colour.parse::<ColourPolicy>() {
        Ok(policy) => policy,
        Err(reply) => {
            ctx.say(reply).await?;
            return Ok(());
        }
    };
    with_entry(&ctx, name, move |entry| {
        entry.colour = policy;
        Ok(format!(
            "Starboard `{}` embeds are now coloured `{policy}`.",
            entry.name
        ))
    })
    .await
}

/// Allow or forbid authors starring their own messages.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn selfstar(
    ctx: Context<'_>,
    #[description = "Whether self-stars count"] allowed: bool,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    with_entry(&ctx, name, move |entry| {
        entry.selfstar = allowed;
        Ok(format!(
            "Self-stars on `{}` are now {}.",
            entry.name,
            if allowed { "counted" } else { "ignored" }
        ))
    })
    .await
}

/// Toggle the bot seeding its own reaction on new mirrors.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn autostar(
    ctx: Context<'_>,
    #[description = "Whether the bot reacts on new mirrors"] enabled: bool,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    with_entry(&ctx, name, move |entry| {
        entry.autostar = enabled;
        Ok(format!(
            "Autostar on `{}` is now {}.",
            entry.name,
            if enabled { "on" } else { "off" }
        ))
    })
    .await
}

/// Set how long records are kept before the daily sweep drops them.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn purge(
    ctx: Context<'_>,
    #[description = "Days to keep records; 0 or empty keeps them forever"] days: Option<u32>,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    let days = days.filter(|d| *d > 0);
    with_entry(&ctx, name, move |entry| {
        entry.purge_days = days;
        Ok(match days {
            Some(d) => format!("Records on `{}` are now dropped after {d} days.", entry.name),
            None => format!("Records on `{}` are now kept forever.", entry.name),
        })
    })
    .await
}

/// Manage the allow lists. A non-empty allow list overrides the block list.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("whitelist_add", "whitelist_remove")
)]
pub async fn whitelist(ctx: Context<'_>) -> Result<(), Error> {
    ctx.say("Use `starboard whitelist add` or `starboard whitelist remove`.")
        .await?;
    Ok(())
}

#[poise::command(slash_command, prefix_command, guild_only, rename = "add", required_permissions = "MANAGE_GUILD")]
pub async fn whitelist_add(
    ctx: Context<'_>,
    #[description = "Channel or category to allow"] allow_channel: Option<serenity::ChannelId>,
    #[description = "Role to allow"] role: Option<serenity::RoleId>,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    list_edit(ctx, true, ListOp::Add, allow_channel, role, name).await
}

#[poise::command(slash_command, prefix_command, guild_only, rename = "remove", required_permissions = "MANAGE_GUILD")]
pub async fn whitelist_remove(
    ctx: Context<'_>,
    #[description = "Channel or category to stop allowing"] allow_channel: Option<serenity::ChannelId>,
    #[description = "Role to stop allowing"] role: Option<serenity::RoleId>,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    list_edit(ctx, true, ListOp::Remove, allow_channel, role, name).await
}

/// Manage the block lists.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("blacklist_add", "blacklist_remove")
)]
pub async fn blacklist(ctx: Context<'_>) -> Result<(), Error> {
    ctx.say("Use `starboard blacklist add` or `starboard blacklist remove`.")
        .await?;
    Ok(())
}

#[poise::command(slash_command, prefix_command, guild_only, rename = "add", required_permissions = "MANAGE_GUILD")]
pub async fn blacklist_add(
    ctx: Context<'_>,
    #[description = "Channel or category to block"] block_channel: Option<serenity::ChannelId>,
    #[description = "Role to block"] role: Option<serenity::RoleId>,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    list_edit(ctx, false, ListOp::Add, block_channel, role, name).await
}

#[poise::command(slash_command, prefix_command, guild_only, rename = "remove", required_permissions = "MANAGE_GUILD")]
pub async fn blacklist_remove(
    ctx: Context<'_>,
    #[description = "Channel or category to unblock"] block_channel: Option<serenity::ChannelId>,
    #[description = "Role to unblock"] role: Option<serenity::RoleId>,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    list_edit(ctx, false, ListOp::Remove, block_channel, role, name).await
}

/// Manually star a message, exactly as if you had reacted to it.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn star(
    ctx: Context<'_>,
    #[description = "Link to the message"] message_link: String,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    manual(ctx, &message_link, name, true).await
}

/// Withdraw your star from a message.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn unstar(
    ctx: Context<'_>,
    #[description = "Link to the message"] message_link: String,
    #[description = "Starboard name"] name: Option<String>,
) -> Result<(), Error> {
    manual(ctx, &message_link, name, false).await
}

#[derive(Clone, Copy)]
enum ListOp {
    Add,
    Remove,
}

fn apply_list(list: &mut Vec<u64>, id: u64, op: ListOp) {
    match op {
        ListOp::Add => {
            if !list.contains(&id) {
                list.push(id);
            }
        }
        ListOp::Remove => list.retain(|&x| x != id),
    }
}

async fn list_edit(
    ctx: Context<'_>,
    whitelist: bool,
    op: ListOp,
    channel: Option<serenity::ChannelId>,
    role: Option<serenity::RoleId>,
    name: Option<String>,
) -> Result<(), Error> {
    if channel.is_none() && role.is_none() {
        ctx.say("Give a channel, a role, or both.").await?;
        return Ok(());
    }
    with_entry(&ctx, name, move |entry| {
        let mut touched = Vec::new();
        if let Some(ch) = channel {
            let list = if whitelist {
                &mut entry.whitelist_channel
            } else {
                &mut entry.blacklist_channel
            };
            apply_list(list, ch.get(), op);
            touched.push(format!("<#{}>", ch.get()));
        }
        if let Some(role) = role {
            let list = if whitelist {
                &mut entry.whitelist_role
            } else {
                &mut entry.blacklist_role
            };
            apply_list(list, role.get(), op);
            touched.push(format!("<@&{}>", role.get()));
        }
        let verb = match op {
            ListOp::Add => "Added",
            ListOp::Remove => "Removed",
        };
        let which = if whitelist { "allow" } else { "block" };
        Ok(format!(
            "{verb} {} on `{}`'s {which} list.",
            touched.join(" and "),
            entry.name
        ))
    })
    .await
}

async fn manual(
    ctx: Context<'_>,
    link: &str,
    name: Option<String>,
    add: bool,
) -> Result<(), Error> {
    let guild = ctx.guild_id().ok_or("guild only command")?;
    let Some((link_guild, channel, message)) = parse_message_link(link) else {
        ctx.say("That doesn't look like a message link.").await?;
        return Ok(());
    };
    if link_guild != guild.get() {
        ctx.say("That message is not from this server.").await?;
        return Ok(());
    }
    let Some(name) = resolve_name(&ctx, guild.get(), name.as_deref()).await? else {
        return Ok(());
    };

    let actor = ctx.author().id.get();
    let event = if add {
        StarEvent::Add(actor)
    } else {
        StarEvent::Remove(actor)
    };
    let changed = starboard_manager::process_named(
        ctx.serenity_context(),
        ctx.data(),
        guild,
        &name,
        serenity::ChannelId::new(channel),
        serenity::MessageId::new(message),
        event,
    )
    .await?;

    if changed {
        ctx.say(if add {
            "Starred; the board has been updated."
        } else {
            "Unstarred; the board has been updated."
        })
        .await?;
    } else {
        ctx.say("Nothing to update for that message.").await?;
    }
    Ok(())
}

/// Resolves which starboard a command means: an explicit name, or the only
/// one that exists. Anything else is explained in a reply and aborts.
async fn resolve_name(
    ctx: &Context<'_>,
    guild: u64,
    name: Option<&str>,
) -> Result<Option<String>, Error> {
    let data = ctx.data();
    match name {
        Some(name) => {
            let name = name.to_lowercase();
            if data.store.get(guild, &name).await?.is_some() {
                Ok(Some(name))
            } else {
                ctx.say(format!("No starboard named `{name}` exists here."))
                    .await?;
                Ok(None)
            }
        }
        None => {
            let entries = data.store.list(guild).await?;
            match entries.len() {
                0 => {
                    ctx.say("No starboard is configured in this server.").await?;
                    Ok(None)
                }
                1 => Ok(Some(entries[0].name.clone())),
                _ => {
                    let names: Vec<String> =
                        entries.iter().map(|e| format!("`{}`", e.name)).collect();
                    ctx.say(format!(
                        "Multiple starboards exist ({}); specify one by name.",
                        names.join(", ")
                    ))
                    .await?;
                    Ok(None)
                }
            }
        }
    }
}

/// Locked read-modify-write of one entry's settings, replying with whatever
/// the mutation returns.
async fn with_entry<F>(ctx: &Context<'_>, name: Option<String>, mutate: F) -> Result<(), Error>
where
    F: FnOnce(&mut StarboardEntry) -> Result<String, String>,
{
    let guild = ctx.guild_id().ok_or("guild only command")?.get();
    let Some(name) = resolve_name(ctx, guild, name.as_deref()).await? else {
        return Ok(());
    };
    let data = ctx.data();
    let lock = data.locks.get(guild, &name);
    let _guard = lock.lock().await;
    let Some(mut entry) = data.store.get(guild, &name).await? else {
        ctx.say(format!("Starboard `{name}` vanished while editing."))
            .await?;
        return Ok(());
    };
    match mutate(&mut entry) {
        Ok(reply) => {
            data.store.save(guild, &entry).await?;
            ctx.say(reply).await?;
        }
        Err(reply) => {
            ctx.say(reply).await?;
        }
    }
    Ok(())
}

fn normalize_emoji(input: &str) -> Result<String, String> {
    let input = input.trim();
    serenity::ReactionType::try_from(input)
        .map(|r| r.to_string())
        .map_err(|_| format!("`{input}` is not an emoji I can react with."))
}

fn fmt_mentions(ids: &[u64], template: &str) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter()
        .map(|id| template.replacen("{}", &id.to_string(), 1))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accepts the jump links Discord hands out from any of its domains.
pub(crate) fn parse_message_link(link: &str) -> Option<(u64, u64, u64)> {
    let rest = link
        .trim()
        .strip_prefix("https://")
        .or_else(|| link.trim().strip_prefix("http://"))?;
    let rest = rest
        .strip_prefix("discord.com/")
        .or_else(|| rest.strip_prefix("ptb.discord.com/"))
        .or_else(|| rest.strip_prefix("canary.discord.com/"))
        .or_else(|| rest.strip_prefix("discordapp.com/"))?;
    let rest = rest.strip_prefix("channels/")?;
    let mut parts = rest.split('/');
    let guild = parts.next()?.parse().ok()?;
    let channel = parts.next()?.parse().ok()?;
    let message = parts.next()?.parse().ok()?;
    Some((guild, channel, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_links_parse() {
        assert_eq!(
            parse_message_link("https://discord.com/channels/1/2/3"),
            Some((1, 2, 3))
        );
        assert_eq!(
            parse_message_link("https://ptb.discord.com/channels/10/20/30"),
            Some((10, 20, 30))
        );
        assert_eq!(
            parse_message_link(" https://canary.discord.com/channels/1/2/3 "),
            Some((1, 2, 3))
        );
        assert_eq!(parse_message_link("https://discord.com/channels/1/2"), None);
        assert_eq!(parse_message_link("https://example.com/channels/1/2/3"), None);
        assert_eq!(parse_message_link("not a link"), None);
    }

    #[test]
    fn list_edits_deduplicate_and_remove() {
        let mut list = vec![1];
        apply_list(&mut list, 1, ListOp::Add);
        apply_list(&mut list, 2, ListOp::Add);
        assert_eq!(list, vec![1, 2]);
        apply_list(&mut list, 1, ListOp::Remove);
        assert_eq!(list, vec![2]);
        apply_list(&mut list, 9, ListOp::Remove);
        assert_eq!(list, vec![2]);
    }

    #[test]
    fn mention_formatting() {
        assert_eq!(fmt_mentions(&[], "<#{}>"), "none");
        assert_eq!(fmt_mentions(&[1, 2], "<#{}>"), "<#1> <#2>");
    }
}
