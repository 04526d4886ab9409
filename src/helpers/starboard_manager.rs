use std::collections::BTreeSet;

use chrono::Utc;
use poise::serenity_prelude as serenity;
use tracing::{debug, warn};

use crate::structs::starboard_entry::{ColourPolicy, StarboardEntry, DEFAULT_COLOUR};
use crate::structs::starboard_message::StarboardMessage;
use crate::types::{Data, Error};

/// A reaction change as seen by the pipeline. Manual star/unstar commands
/// synthesize the same events the gateway delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarEvent {
    Add(u64),
    Remove(u64),
    /// All reactions bulk-cleared; recount with no acting user.
    RemoveAll,
}

/// What the state machine wants done with the mirror after a recount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Below threshold, no mirror: keep the pending record as-is.
    Keep,
    /// Crossed up: post the mirror.
    Promote,
    /// Still at/above threshold with a mirror up: refresh the count.
    Refresh,
    /// Dropped below threshold with a mirror up: take it down.
    Demote,
}

pub fn decide(count: u64, threshold: u64, promoted: bool) -> Action {
    match (count >= threshold, promoted) {
        (true, false) => Action::Promote,
        (true, true) => Action::Refresh,
        (false, true) => Action::Demote,
        (false, false) => Action::Keep,
    }
}

pub struct VoterInfo {
    pub id: u64,
    pub is_bot: bool,
    /// `None` when the user is no longer a guild member.
    pub roles: Option<Vec<u64>>,
}

/// Vote filter applied to every candidate from the live fetches. Bots never
/// count; the author counts only with selfstar on; role lists apply last.
pub fn eligible_voter(entry: &StarboardEntry, author: u64, voter: &VoterInfo) -> bool {
    if voter.is_bot {
        return false;
    }
    if !entry.selfstar && voter.id == author {
        return false;
    }
    entry.check_roles(voter.roles.as_deref())
}

pub fn star_content(emoji: &str, count: u64) -> String {
    format!("{emoji} **#{count}**")
}

/// Turns the fetched candidates into the record's voter set. The seed is the
/// acting user on an add, whose reaction may not be visible to the fetch yet;
/// the `remove` id is authoritative and wins over a stale fetch that still
/// reports the withdrawn vote. Same inputs, same set: reapplying this to its
/// own output changes nothing.
pub fn settle_voters<F>(
    entry: &StarboardEntry,
    author: u64,
    mut candidates: BTreeSet<u64>,
    seed: Option<u64>,
    remove: Option<u64>,
    mut lookup: F,
) -> BTreeSet<u64>
where
    F: FnMut(u64) -> VoterInfo,
{
    if let Some(user) = seed {
        candidates.insert(user);
    }
    let mut voters = BTreeSet::new();
    for id in candidates {
        if eligible_voter(entry, author, &lookup(id)) {
            voters.insert(id);
        }
    }
    if let Some(user) = remove {
        voters.remove(&user);
    }
    voters
}

pub(crate) async fn handle_reaction_add(
    ctx: &serenity::Context,
    reaction: &serenity::Reaction,
    data: &Data,
) -> Result<(), Error> {
    let Some(guild_id) = reaction.guild_id else {
        return Ok(());
    };
    let Some(user_id) = reaction.user_id else {
        return Ok(());
    };
    process_event(
        ctx,
        data,
        guild_id,
        reaction.channel_id,
        reaction.message_id,
        Some(&reaction.emoji.to_string()),
        StarEvent::Add(user_id.get()),
    )
    .await
}

pub(crate) async fn handle_reaction_remove(
    ctx: &serenity::Context,
    reaction: &serenity::Reaction,
    data: &Data,
) -> Result<(), Error> {
    let Some(guild_id) = reaction.guild_id else {
        return Ok(());
    };
    let Some(user_id) = reaction.user_id else {
        return Ok(());
    };
    process_event(
        ctx,
        data,
        guild_id,
        reaction.channel_id,
        reaction.message_id,
        Some(&reaction.emoji.to_string()),
        StarEvent::Remove(user_id.get()),
    )
    .await
}

pub(crate) async fn handle_reaction_remove_all(
    ctx: &serenity::Context,
    channel_id: serenity::ChannelId,
    message_id: serenity::MessageId,
    data: &Data,
) -> Result<(), Error> {
    // The bulk-clear payload carries no guild id; resolve it via the channel.
    let guild_id = match channel_id.to_channel(ctx).await {
        Ok(channel) => match channel.guild() {
            Some(gc) => gc.guild_id,
            None => return Ok(()),
        },
        Err(_) => return Ok(()),
    };
    process_event(
        ctx,
        data,
        guild_id,
        channel_id,
        message_id,
        None,
        StarEvent::RemoveAll,
    )
    .await
}

/// Runs the event against every enabled entry whose emoji matches (all
/// entries for bulk clears). Each entry is processed under its own lock so
/// concurrent reactions cannot race into duplicate promotions.
pub async fn process_event(
    ctx: &serenity::Context,
    data: &Data,
    guild: serenity::GuildId,
    channel: serenity::ChannelId,
    message: serenity::MessageId,
    emoji: Option<&str>,
    event: StarEvent,
) -> Result<(), Error> {
    let names: Vec<String> = data
        .store
        .list(guild.get())
        .await?
        .into_iter()
        .filter(|e| e.enabled && emoji.map_or(true, |em| e.emoji == em))
        .map(|e| e.name)
        .collect();

    drive_entries(names, |name| async move {
        process_named(ctx, data, guild, &name, channel, message, event).await
    })
    .await;
    Ok(())
}

/// Runs one update per matching entry, isolating failures: a broken entry is
/// logged and skipped so it cannot starve its siblings.
async fn drive_entries<F, Fut>(names: Vec<String>, mut run: F)
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Result<bool, Error>>,
{
    for name in names {
        let label = name.clone();
        if let Err(e) = run(name).await {
            warn!(starboard = %label, error = %e, "starboard update failed");
        }
    }
}

/// Runs the event against one entry by name. Returns whether a record was
/// touched (and therefore persisted).
pub async fn process_named(
    ctx: &serenity::Context,
    data: &Data,
    guild: serenity::GuildId,
    name: &str,
    channel: serenity::ChannelId,
    message: serenity::MessageId,
    event: StarEvent,
) -> Result<bool, Error> {
    let lock = data.locks.get(guild.get(), name);
    let _guard = lock.lock().await;

    let Some(mut entry) = data.store.get(guild.get(), name).await? else {
        return Ok(false);
    };
    if !entry.enabled {
        return Ok(false);
    }

    let changed = update_entry(ctx, guild, channel, message, event, &mut entry).await?;
    if changed {
        data.store.save(guild.get(), &entry).await?;
    }
    Ok(changed)
}

/// The promotion state machine: untracked -> pending -> promoted -> pending,
/// with records only ever dropped by the retention sweep or entry deletion.
async fn update_entry(
    ctx: &serenity::Context,
    guild: serenity::GuildId,
    channel: serenity::ChannelId,
    message: serenity::MessageId,
    event: StarEvent,
    entry: &mut StarboardEntry,
) -> Result<bool, Error> {
    let idx = match entry.find_message(message.get()) {
        Some(idx) => {
            if let StarEvent::Add(actor) = event {
                let author = entry.messages[idx].author;
                let source_channel = entry.messages[idx].original_channel;
                if !entry.selfstar && actor == author {
                    return Ok(false);
                }
                if !actor_allowed(ctx, guild, entry, actor).await {
                    return Ok(false);
                }
                if !channel_allowed(ctx, entry, source_channel).await {
                    return Ok(false);
                }
            }
            idx
        }
        None => {
            // Only an add can bring a message under tracking, and only if the
            // source still resolves.
            let StarEvent::Add(actor) = event else {
                return Ok(false);
            };
            let Ok(source) = channel.message(&ctx.http, message).await else {
                return Ok(false);
            };
            if !entry.selfstar && actor == source.author.id.get() {
                return Ok(false);
            }
            if !actor_allowed(ctx, guild, entry, actor).await {
                return Ok(false);
            }
            if !channel_allowed(ctx, entry, channel.get()).await {
                return Ok(false);
            }
            entry.messages.push(StarboardMessage::new(
                message.get(),
                channel.get(),
                source.author.id.get(),
            ));
            entry.messages.len() - 1
        }
    };

    let (seed, remove) = match event {
        StarEvent::Add(user) => (Some(user), None),
        StarEvent::Remove(user) => (None, Some(user)),
        StarEvent::RemoveAll => (None, None),
    };

    let mut record = entry.messages[idx].clone();
    recount(ctx, guild, entry, &mut record, seed, remove).await;

    match decide(record.count(), entry.threshold, record.is_promoted()) {
        Action::Promote => promote(ctx, guild, entry, &mut record).await,
        Action::Refresh => refresh(ctx, entry, &mut record).await,
        Action::Demote => demote(ctx, &mut record).await,
        Action::Keep => {}
    }

    entry.messages[idx] = record;
    Ok(true)
}

/// Rebuilds the voter set from the live reactions on both copies of the
/// message rather than trusting event payload deltas. Missed or duplicated
/// gateway events and reactions placed directly on the mirror all come out
/// in the wash on the next recount.
async fn recount(
    ctx: &serenity::Context,
    guild: serenity::GuildId,
    entry: &StarboardEntry,
    record: &mut StarboardMessage,
    seed: Option<u64>,
    remove: Option<u64>,
) {
    let Ok(emoji) = serenity::ReactionType::try_from(entry.emoji.as_str()) else {
        warn!(emoji = %entry.emoji, "stored emoji no longer parses");
        return;
    };

    let mut candidates: BTreeSet<u64> = BTreeSet::new();
    candidates.extend(
        fetch_reactors(ctx, record.original_channel, record.original_message, &emoji).await,
    );
    if let (Some(ch), Some(mid)) = (record.new_channel, record.new_message) {
        candidates.extend(fetch_reactors(ctx, ch, mid, &emoji).await);
    }
    if let Some(user) = seed {
        candidates.insert(user);
    }

    let mut infos = std::collections::BTreeMap::new();
    for &id in &candidates {
        infos.insert(id, voter_info(ctx, guild, id).await);
    }

    record.reactions = settle_voters(entry, record.author, candidates, seed, remove, |id| {
        infos.remove(&id).unwrap_or(VoterInfo {
            id,
            is_bot: false,
            roles: None,
        })
    });
}

/// Users who reacted with the entry's emoji on one copy of the message.
/// A vanished or forbidden message counts for nothing.
async fn fetch_reactors(
    ctx: &serenity::Context,
    channel: u64,
    message: u64,
    emoji: &serenity::ReactionType,
) -> Vec<u64> {
    let channel = serenity::ChannelId::new(channel);
    let message = match channel
        .message(&ctx.http, serenity::MessageId::new(message))
        .await
    {
        Ok(message) => message,
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::new();
    let mut after: Option<serenity::UserId> = None;
    loop {
        let page = match message
            .reaction_users(&ctx.http, emoji.clone(), Some(100), after)
            .await
        {
            Ok(page) => page,
            Err(_) => break,
        };
        let full = page.len() == 100;
        after = page.last().map(|u| u.id);
        out.extend(page.into_iter().map(|u| u.id.get()));
        if !full {
            break;
        }
    }
    out
}

async fn voter_info(ctx: &serenity::Context, guild: serenity::GuildId, id: u64) -> VoterInfo {
    match guild.member(&ctx.http, serenity::UserId::new(id)).await {
        Ok(member) => VoterInfo {
            id,
            is_bot: member.user.bot,
            roles: Some(member.roles.iter().map(|r| r.get()).collect()),
        },
        // Left the guild; their star still counts and they hold no roles.
        Err(_) => VoterInfo {
            id,
            is_bot: false,
            roles: None,
        },
    }
}

async fn actor_allowed(
    ctx: &serenity::Context,
    guild: serenity::GuildId,
    entry: &StarboardEntry,
    actor: u64,
) -> bool {
    let roles = match guild.member(&ctx.http, serenity::UserId::new(actor)).await {
        Ok(member) => {
            if member.user.bot {
                return false;
            }
            Some(member.roles.iter().map(|r| r.get()).collect::<Vec<_>>())
        }
        Err(_) => None,
    };
    entry.check_roles(roles.as_deref())
}

async fn channel_allowed(ctx: &serenity::Context, entry: &StarboardEntry, source: u64) -> bool {
    let Some((parent, source_nsfw)) = channel_info(ctx, source).await else {
        return false;
    };
    let target_nsfw = channel_info(ctx, entry.channel)
        .await
        .map(|(_, nsfw)| nsfw)
        .unwrap_or(false);
    entry.check_channel(source, parent, source_nsfw, target_nsfw)
}

async fn channel_info(ctx: &serenity::Context, channel: u64) -> Option<(Option<u64>, bool)> {
    match serenity::ChannelId::new(channel).to_channel(ctx).await {
        Ok(channel) => channel
            .guild()
            .map(|gc| (gc.parent_id.map(|p| p.get()), gc.nsfw)),
        Err(_) => None,
    }
}

async fn promote(
    ctx: &serenity::Context,
    guild: serenity::GuildId,
    entry: &StarboardEntry,
    record: &mut StarboardMessage,
) {
    let source = match serenity::ChannelId::new(record.original_channel)
        .message(&ctx.http, serenity::MessageId::new(record.original_message))
        .await
    {
        Ok(message) => message,
        Err(_) => {
            debug!(
                message = record.original_message,
                "source vanished before promotion"
            );
            return;
        }
    };

    let colour = resolve_colour(ctx, guild, entry, record.author).await;
    let embed = render_embed(&source, guild.get(), colour);
    let builder = serenity::CreateMessage::new()
        .content(star_content(&entry.emoji, record.count()))
        .embed(embed);

    let target = serenity::ChannelId::new(entry.channel);
    match target.send_message(&ctx.http, builder).await {
        Ok(mirror) => {
            if entry.autostar {
                if let Ok(emoji) = serenity::ReactionType::try_from(entry.emoji.as_str()) {
                    if let Err(e) = mirror.react(&ctx.http, emoji).await {
                        debug!(error = %e, "autostar react failed");
                    }
                }
            }
            record.new_message = Some(mirror.id.get());
            record.new_channel = Some(target.get());
            record.mirrored_at = Some(Utc::now());
        }
        Err(e) => {
            warn!(guild = guild.get(), channel = entry.channel, error = %e, "failed to post mirror");
        }
    }
}

async fn refresh(ctx: &serenity::Context, entry: &StarboardEntry, record: &mut StarboardMessage) {
    let (Some(ch), Some(mid)) = (record.new_channel, record.new_message) else {
        return;
    };
    let builder =
        serenity::EditMessage::new().content(star_content(&entry.emoji, record.count()));
    if serenity::ChannelId::new(ch)
        .edit_message(&ctx.http, serenity::MessageId::new(mid), builder)
        .await
        .is_err()
    {
        // Mirror was deleted out from under us; a later event may re-promote.
        record.new_message = None;
        record.new_channel = None;
        record.mirrored_at = None;
    }
}

async fn demote(ctx: &serenity::Context, record: &mut StarboardMessage) {
    if let (Some(ch), Some(mid)) = (record.new_channel, record.new_message) {
        if let Err(e) = serenity::ChannelId::new(ch)
            .delete_message(&ctx.http, serenity::MessageId::new(mid))
            .await
        {
            debug!(error = %e, "mirror already gone on demotion");
        }
    }
    record.new_message = None;
    record.new_channel = None;
    record.mirrored_at = None;
}

async fn resolve_colour(
    ctx: &serenity::Context,
    guild: serenity::GuildId,
    entry: &StarboardEntry,
    author: u64,
) -> serenity::Colour {
    let member_colour = |id: u64| async move {
        guild
            .member(&ctx.http, serenity::UserId::new(id))
            .await
            .ok()
            .and_then(|m| m.colour(&ctx.cache))
    };
    match entry.colour {
        ColourPolicy::Fixed(n) => serenity::Colour::new(n),
        ColourPolicy::Member => member_colour(author)
            .await
            .unwrap_or(serenity::Colour::new(DEFAULT_COLOUR)),
        ColourPolicy::Bot => {
            let bot_id = ctx.cache.current_user().id.get();
            member_colour(bot_id)
                .await
                .unwrap_or(serenity::Colour::new(DEFAULT_COLOUR))
        }
    }
}

fn render_embed(
    message: &serenity::Message,
    guild: u64,
    colour: serenity::Colour,
) -> serenity::CreateEmbed {
    let author = serenity::CreateEmbedAuthor::new(&message.author.name)
        .icon_url(message.author.face());

    let mut embed = serenity::CreateEmbed::default()
        .author(author)
        .description(&message.content)
        .field(
            "Original",
            format!(
                "[Jump to message](https://discord.com/channels/{}/{}/{})",
                guild,
                message.channel_id.get(),
                message.id.get()
            ),
            false,
        )
        .colour(colour)
        .timestamp(message.timestamp);

    if let Some(attachment) = message.attachments.first() {
        if attachment.width.is_some() && attachment.height.is_some() {
            embed = embed.image(&attachment.url);
        } else {
            embed = embed.field(
                "Attachment",
                format!("[{}]({})", attachment.filename, attachment.url),
                false,
            );
        }
    }

    embed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(threshold: u64) -> StarboardEntry {
        StarboardEntry::new("gold", 10, "⭐".to_string(), threshold)
    }

    fn voter(id: u64) -> VoterInfo {
        VoterInfo {
            id,
            is_bot: false,
            roles: Some(vec![]),
        }
    }

    #[test]
    fn threshold_boundary() {
        // one short of the threshold never promotes
        assert_eq!(decide(1, 2, false), Action::Keep);
        // exactly at threshold promotes
        assert_eq!(decide(2, 2, false), Action::Promote);
        // staying at/above refreshes the displayed count
        assert_eq!(decide(3, 2, true), Action::Refresh);
        // falling below takes the mirror down
        assert_eq!(decide(1, 2, true), Action::Demote);
        assert_eq!(decide(0, 2, false), Action::Keep);
    }

    #[test]
    fn decide_is_stable_across_recounts() {
        // same inputs, same outcome: the recount path is idempotent
        for _ in 0..2 {
            assert_eq!(decide(2, 2, true), Action::Refresh);
            assert_eq!(decide(1, 2, false), Action::Keep);
        }
    }

    #[test]
    fn bots_never_count() {
        let e = entry(2);
        let bot = VoterInfo {
            is_bot: true,
            ..voter(5)
        };
        assert!(!eligible_voter(&e, 1, &bot));
        assert!(eligible_voter(&e, 1, &voter(5)));
    }

    #[test]
    fn selfstar_gates_the_author() {
        let mut e = entry(2);
        assert!(!eligible_voter(&e, 5, &voter(5)));
        e.selfstar = true;
        assert!(eligible_voter(&e, 5, &voter(5)));
    }

    #[test]
    fn role_lists_apply_to_voters() {
        let mut e = entry(2);
        e.whitelist_role = vec![9];
        let mut v = voter(5);
        assert!(!eligible_voter(&e, 1, &v));
        v.roles = Some(vec![9]);
        assert!(eligible_voter(&e, 1, &v));
        // departed members have no role info and still count
        v.roles = None;
        assert!(eligible_voter(&e, 1, &v));
    }

    #[test]
    fn displayed_count_format() {
        assert_eq!(star_content("⭐", 2), "⭐ **#2**");
    }

    #[test]
    fn settling_seeds_the_acting_user() {
        // the triggering reaction is not visible to the fetch yet
        let e = entry(2);
        let voters = settle_voters(&e, 1, BTreeSet::from([5]), Some(6), None, voter);
        assert_eq!(voters, BTreeSet::from([5, 6]));
    }

    #[test]
    fn settling_honours_a_removal_the_fetch_missed() {
        // the fetch still reports the vote that was just withdrawn
        let e = entry(2);
        let voters = settle_voters(&e, 1, BTreeSet::from([5, 6]), None, Some(6), voter);
        assert_eq!(voters, BTreeSet::from([5]));
    }

    #[test]
    fn settling_its_own_output_changes_nothing() {
        let e = entry(2);
        let once = settle_voters(&e, 1, BTreeSet::from([5, 6, 7]), Some(7), None, voter);
        let again = settle_voters(&e, 1, once.clone(), Some(7), None, voter);
        assert_eq!(once, again);
    }

    #[test]
    fn reactors_on_both_copies_count_once() {
        let mut candidates = BTreeSet::new();
        candidates.extend([5u64, 6]);
        candidates.extend([6u64, 7]);
        let voters = settle_voters(&entry(2), 1, candidates, None, None, voter);
        assert_eq!(voters, BTreeSet::from([5, 6, 7]));
    }

    #[test]
    fn seeded_author_still_respects_selfstar() {
        let e = entry(2);
        let voters = settle_voters(&e, 9, BTreeSet::new(), Some(9), None, voter);
        assert!(voters.is_empty());
    }

    #[tokio::test]
    async fn one_broken_entry_does_not_starve_the_rest() {
        let seen = std::sync::Mutex::new(Vec::new());
        drive_entries(vec!["bad".to_string(), "good".to_string()], |name| {
            let seen = &seen;
            async move {
                seen.lock().unwrap().push(name.clone());
                if name == "bad" {
                    Err("corrupt blob".into())
                } else {
                    Ok(true)
                }
            }
        })
        .await;
        assert_eq!(*seen.lock().unwrap(), vec!["bad", "good"]);
    }
}
