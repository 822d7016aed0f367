use std::fmt::Display;
use std::sync::Arc;

use serenity::builder::CreateEmbed;
use serenity::client::Context;
use serenity::framework::standard::macros::{command, group};
use serenity::framework::standard::{Args, CommandError, CommandResult};
use serenity::http::Http;
use serenity::model::channel::Message;
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::id::{ChannelId, UserId};
use serenity::prelude::TypeMapKey;
use serenity::Result as SerenityResult;
use tracing::info;

use crate::error::{MusicError, MusicResult, VoiceConnectionError};
use crate::messages::{self, EmbedContent};
use crate::player::{PlayOutcome, PlaybackController};

pub struct PlayerKey;

impl TypeMapKey for PlayerKey {
    type Value = Arc<PlaybackController>;
}

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
    pub prefix: String,
}

impl TypeMapKey for BotDataMap {
    type Value = BotData;
}

#[group]
#[commands(
    play,
    pause,
    resume,
    skip,
    stop,
    queue,
    now_playing,
    loop_track,
    loop_queue,
    shuffle,
    remove,
    clear,
    volume,
    join,
    leave,
    help
)]
pub struct General;

#[command]
#[aliases(p)]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let bot_id = {
        let data = ctx.data.read().await;
        data.get::<BotDataMap>().map(|data| data.id)
    };

    let loading_emoji = Unicode("⏳".to_string());

    check_reaction(msg.react(&ctx.http, loading_emoji.clone()).await);

    let controller = controller(ctx).await?;
    let result = play_track(ctx, msg, &controller, args.message()).await;

    if let Some(bot_id) = bot_id {
        check_reaction(
            msg.channel_id
                .delete_reaction(&ctx.http, msg.id, Some(UserId(bot_id)), loading_emoji)
                .await,
        );
    }

    let answer_emoji = match result {
        Ok(_) => "👍",
        Err(_) => "💀",
    };

    check_reaction(msg.react(&ctx.http, Unicode(answer_emoji.to_string())).await);

    respond(ctx, msg, result, |outcome| match outcome {
        PlayOutcome::Started(track) => messages::started(&track),
        PlayOutcome::Queued { track, position } => messages::queued(&track, position),
        PlayOutcome::Playlist {
            first,
            started,
            pending,
            failed,
        } => messages::playlist_queued(&first, started, pending, failed),
    })
    .await;

    Ok(())
}

async fn play_track(
    ctx: &Context,
    msg: &Message,
    controller: &Arc<PlaybackController>,
    input: &str,
) -> MusicResult<PlayOutcome> {
    let guild_id = msg.guild_id.ok_or(VoiceConnectionError::NotConnected)?.0;

    if controller.voice_channel(guild_id).await.is_none() {
        let channel_id = author_voice_channel(ctx, msg).ok_or(VoiceConnectionError::UserNotInVoice)?;
        controller.join(guild_id, channel_id, msg.channel_id.0).await?;
    }

    controller.play(guild_id, msg.author.id.0, input).await
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;
    let result = controller.pause(guild_id).await;

    respond(ctx, msg, result, |_| "⏸️ Playback paused.".to_string()).await;

    Ok(())
}

#[command]
#[aliases(unpause)]
#[only_in(guilds)]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;
    let result = controller.resume(guild_id).await;

    respond(ctx, msg, result, |_| "▶️ Playback resumed.".to_string()).await;

    Ok(())
}

#[command]
#[aliases(n, next)]
#[only_in(guilds)]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;

    info!("Skip command invoked from guild {guild_id}");

    let controller = controller(ctx).await?;
    let result = controller.skip(guild_id).await;

    respond(ctx, msg, result, |skipped| match skipped {
        Some(track) => format!("⏭️ Skipped **{}**.", track.title),
        None => "⏭️ Skipped.".to_string(),
    })
    .await;

    Ok(())
}

#[command]
#[aliases(s)]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;
    let result = controller.stop(guild_id).await;

    respond(ctx, msg, result, |_| "⏹️ Playback stopped and queue cleared.".to_string()).await;

    Ok(())
}

#[command]
#[aliases(q, playlist)]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let snapshot = controller(ctx).await?.queue(guild_id).await;

    match snapshot {
        Some(snapshot) => send_embed(&ctx.http, msg.channel_id, &messages::queue_view(&snapshot)).await,
        None => check_msg(msg.channel_id.say(&ctx.http, "📭 The queue is empty!").await),
    }

    Ok(())
}

#[command("nowplaying")]
#[aliases(np, current)]
#[only_in(guilds)]
async fn now_playing(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let snapshot = controller(ctx).await?.queue(guild_id).await;

    match snapshot.and_then(|snapshot| snapshot.now_playing.map(|track| (track, snapshot.volume))) {
        Some((track, volume)) => send_embed(&ctx.http, msg.channel_id, &messages::now_playing(&track, volume)).await,
        None => send_embed(&ctx.http, msg.channel_id, &messages::error(&MusicError::NothingPlaying)).await,
    }

    Ok(())
}

#[command("loop")]
#[aliases(l, repeat)]
#[only_in(guilds)]
async fn loop_track(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;
    let result = controller.toggle_loop(guild_id).await;

    respond(ctx, msg, result, |mode| messages::loop_mode(mode).to_string()).await;

    Ok(())
}

#[command("loopqueue")]
#[aliases(lq, queueloop)]
#[only_in(guilds)]
async fn loop_queue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;
    let result = controller.toggle_loop_queue(guild_id).await;

    respond(ctx, msg, result, |mode| messages::loop_mode(mode).to_string()).await;

    Ok(())
}

#[command]
#[aliases(sh)]
#[only_in(guilds)]
async fn shuffle(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;

    info!("Shuffle command invoked from guild {guild_id}");

    let controller = controller(ctx).await?;
    let result = controller.shuffle(guild_id).await;

    respond(ctx, msg, result, |count| format!("🔀 Shuffled **{count}** songs!")).await;

    Ok(())
}

#[command]
#[aliases(rm)]
#[only_in(guilds)]
async fn remove(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let position = match args.single::<i64>() {
        Ok(position) => position,
        Err(_) => {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, "❌ Invalid song position. Check the queue to list the songs.")
                    .await,
            );

            return Ok(());
        }
    };

    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;
    let result = controller.remove(guild_id, position).await;

    respond(ctx, msg, result, |track| format!("🗑️ Removed **{}** from the queue.", track.title)).await;

    Ok(())
}

#[command]
#[aliases(cl)]
#[only_in(guilds)]
async fn clear(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;
    let result = controller.clear(guild_id).await;

    respond(ctx, msg, result, |count| format!("🗑️ Queue cleared! ({count} songs removed)")).await;

    Ok(())
}

#[command]
#[aliases(v)]
#[only_in(guilds)]
async fn volume(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;

    if args.is_empty() {
        let current = controller
            .queue(guild_id)
            .await
            .map(|snapshot| (snapshot.volume * 100.0).round() as u8)
            .ok_or(MusicError::from(VoiceConnectionError::NotConnected));

        respond(ctx, msg, current, messages::volume).await;

        return Ok(());
    }

    let percent = match args.single::<i64>() {
        Ok(percent) => percent,
        Err(_) => {
            check_msg(msg.channel_id.say(&ctx.http, "❌ Volume must be a number between 0 and 100!").await);

            return Ok(());
        }
    };

    let result = controller.set_volume(guild_id, percent).await;

    respond(ctx, msg, result, |volume| messages::volume((volume * 100.0).round() as u8)).await;

    Ok(())
}

#[command]
#[aliases(j, connect)]
#[only_in(guilds)]
async fn join(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;

    let result = match author_voice_channel(ctx, msg) {
        None => Err(VoiceConnectionError::UserNotInVoice.into()),
        Some(channel_id) => controller
            .join(guild_id, channel_id, msg.channel_id.0)
            .await
            .map(|moved| (moved, channel_id)),
    };

    respond(ctx, msg, result, |(moved, channel_id)| {
        if moved {
            format!("🎵 Joined <#{channel_id}>!")
        } else {
            format!("🎵 Already in <#{channel_id}>.")
        }
    })
    .await;

    Ok(())
}

#[command]
#[aliases(dc, disconnect)]
#[only_in(guilds)]
async fn leave(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = guild_id(msg)?;
    let controller = controller(ctx).await?;
    let result = controller.leave(guild_id).await;

    respond(ctx, msg, result, |_| "👋 Disconnected from voice.".to_string()).await;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let prefix = {
        let data = ctx.data.read().await;
        data.get::<BotDataMap>()
            .map(|data| data.prefix.clone())
            .unwrap_or_else(|| "!".to_string())
    };

    check_msg(msg.channel_id.say(&ctx.http, messages::help(&prefix)).await);

    Ok(())
}

async fn controller(ctx: &Context) -> CommandResult<Arc<PlaybackController>> {
    let data = ctx.data.read().await;

    data.get::<PlayerKey>()
        .cloned()
        .ok_or_else(|| CommandError::from("Player not found"))
}

fn guild_id(msg: &Message) -> CommandResult<u64> {
    msg.guild_id
        .map(|guild_id| guild_id.0)
        .ok_or_else(|| CommandError::from("Guild not found"))
}

fn author_voice_channel(ctx: &Context, msg: &Message) -> Option<u64> {
    msg.guild(&ctx.cache)?
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id)
        .map(|channel_id| channel_id.0)
}

/// Answers in the channel: the rendered value on success, the friendly error otherwise.
async fn respond<T, F, S>(ctx: &Context, msg: &Message, result: MusicResult<T>, render: F)
where
    F: FnOnce(T) -> S,
    S: Display,
{
    match result {
        Ok(value) => check_msg(msg.channel_id.say(&ctx.http, render(value)).await),
        Err(why) => {
            info!("Command {:?} in channel {} failed: {why}", msg.content, msg.channel_id.0);
            send_embed(&ctx.http, msg.channel_id, &messages::error(&why)).await;
        }
    }
}

pub fn render_embed<'a>(embed: &'a mut CreateEmbed, content: &EmbedContent) -> &'a mut CreateEmbed {
    embed
        .title(&content.title)
        .description(&content.description)
        .colour(content.color);

    if let Some(url) = &content.url {
        embed.url(url);
    }

    if let Some(thumbnail) = &content.thumbnail {
        embed.thumbnail(thumbnail);
    }

    for (name, value) in &content.fields {
        embed.field(name, value, true);
    }

    if let Some(footer) = &content.footer {
        embed.footer(|f| f.text(footer));
    }

    embed
}

pub async fn send_embed(http: &Arc<Http>, channel_id: ChannelId, content: &EmbedContent) {
    check_msg(
        channel_id
            .send_message(http, |m| m.embed(|e| render_embed(e, content)))
            .await,
    );
}

/// Checks that a message successfully sent; if not, then logs why to stdout.
pub fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}

/// Logs a failed reaction change. Returns whether it went through.
fn check_reaction<T>(result: SerenityResult<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(why) => {
            info!("Error updating reaction: {why:?}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use serenity::Error as SerenityError;

    use super::*;

    #[test]
    fn reaction_failures_do_not_stop_the_command() {
        assert!(!check_reaction::<()>(Err(SerenityError::Other("Missing Permissions"))));
        assert!(check_reaction(Ok(())));
    }
}
