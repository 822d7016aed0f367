use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, Context, EventHandler},
    framework::StandardFramework,
    http::Http,
    model::{
        channel::{ChannelType, GuildChannel},
        gateway::{Activity, Ready},
        guild::Guild,
        id::ChannelId,
        prelude::VoiceState,
    },
    prelude::GatewayIntents,
};
use songbird::{SerenityInit, Songbird};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};

use crate::cache::StreamCache;
use crate::commands::{check_msg, render_embed, send_embed, BotData, BotDataMap, PlayerKey, GENERAL_GROUP};
use crate::config::Config;
use crate::output::SongbirdOutput;
use crate::player::{PlaybackController, PlayerEvent};
use crate::playlists::YoutubePlaylists;
use crate::resolver::TrackResolver;
use crate::session::SessionSettings;
use crate::spotify::Spotify;
use crate::ytdl::YtDlp;

mod cache;
mod commands;
mod config;
mod error;
mod messages;
mod models;
mod output;
mod player;
mod playlists;
mod resolver;
mod session;
mod spotify;
#[cfg(test)]
mod testing;
mod ytdl;

struct Handler {
    prefix: String,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        let bot_data = BotData {
            id: ready.user.id.0,
            prefix: self.prefix.clone(),
        };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);

        ctx.set_activity(Activity::listening(format!("{}help | Music", self.prefix)))
            .await;
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, is_new: bool) {
        if !is_new {
            return;
        }

        info!("Joined new guild: {} (ID: {})", guild.name, guild.id.0);

        let mut channels: Vec<GuildChannel> = guild
            .channels
            .values()
            .filter_map(|channel| channel.clone().guild())
            .filter(|channel| channel.kind == ChannelType::Text)
            .collect();
        channels.sort_by_key(|channel| channel.position);

        let welcome = messages::welcome(&self.prefix);

        // The first channel that accepts the message gets it.
        for channel in channels {
            let sent = channel
                .id
                .send_message(&ctx.http, |m| m.embed(|e| render_embed(e, &welcome)))
                .await;

            match sent {
                Ok(_) => break,
                Err(why) => debug!("Welcome message not allowed in {}: {why:?}", channel.name),
            }
        }
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };

        let (bot_id, controller) = {
            let data = ctx.data.read().await;
            (
                data.get::<BotDataMap>().map(|data| data.id),
                data.get::<PlayerKey>().cloned(),
            )
        };

        let (Some(bot_id), Some(controller)) = (bot_id, controller) else {
            return;
        };

        if bot_id == new.user_id.0 {
            match new.channel_id {
                None => {
                    info!("Bot ID matches disconnected user");
                    controller.bot_disconnected(guild_id.0).await;
                    return;
                }
                Some(channel_id) => controller.bot_moved(guild_id.0, channel_id.0).await,
            }
        }

        let Some(channel_id) = controller.voice_channel(guild_id.0).await else {
            return;
        };

        let Some(guild) = ctx.cache.guild(guild_id) else {
            return;
        };

        let listeners = guild
            .voice_states
            .values()
            .filter(|state| state.channel_id == Some(ChannelId(channel_id)))
            .filter(|state| state.user_id.0 != bot_id)
            .filter(|state| !state.member.as_ref().is_some_and(|member| member.user.bot))
            .count();

        controller.set_alone(guild_id.0, listeners == 0).await;
    }
}

/// Renders player events in the text channel each session is bound to.
async fn announce(http: Arc<Http>, mut events: UnboundedReceiver<PlayerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PlayerEvent::NowPlaying {
                guild_id,
                text_channel_id,
                track,
                volume,
            } => {
                info!("Announcing {} in guild {guild_id}", track.title);
                send_embed(&http, ChannelId(text_channel_id), &messages::now_playing(&track, volume)).await;
            }
            PlayerEvent::TrackFailed {
                guild_id,
                text_channel_id,
                title,
                error,
            } => {
                info!("Announcing failure of {title} in guild {guild_id}");
                let text = messages::track_failed(&title, &error);
                check_msg(ChannelId(text_channel_id).say(&http, text).await);
            }
            PlayerEvent::PlaylistFinished {
                guild_id,
                text_channel_id,
                added,
                failed,
                truncated,
            } => {
                info!("Playlist finished in guild {guild_id}");
                let text = messages::playlist_finished(added, failed, truncated);
                check_msg(ChannelId(text_channel_id).say(&http, text).await);
            }
            PlayerEvent::Disconnected {
                guild_id,
                text_channel_id,
                reason,
            } => {
                info!("Announcing disconnect from guild {guild_id}");
                let text = messages::disconnected(reason);
                check_msg(ChannelId(text_channel_id).say(&http, text).await);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if dotenv().is_err() {
        info!(".env file not found, reading settings from the environment");
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(why) => {
            error!("Invalid configuration: {why}");
            return;
        }
    };

    let cache = Arc::new(match &config.cache_path {
        Some(path) => StreamCache::open(path.clone(), config.cache_ttl).await,
        None => StreamCache::in_memory(config.cache_ttl),
    });

    let resolver = TrackResolver::new(Arc::new(YtDlp::new()), cache.clone())
        .with_playlists(Arc::new(YoutubePlaylists))
        .with_playlists(Arc::new(Spotify::new(config.spotify.clone())));

    let songbird = Songbird::serenity();

    let (controller, events) = PlaybackController::start(
        SessionSettings {
            default_volume: config.default_volume,
            max_queue_size: config.max_queue_size,
        },
        config.idle_timeout,
        Arc::new(resolver),
        Arc::new(SongbirdOutput::new(songbird.clone())),
    );

    let framework = StandardFramework::new()
        .configure(|c| c.prefix(config.prefix.as_str()))
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let handler = Handler {
        prefix: config.prefix.clone(),
    };

    let mut client = match Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .framework(framework)
        .register_songbird_with(songbird)
        .await
    {
        Ok(client) => client,
        Err(why) => {
            error!("Err creating client: {why:?}");
            return;
        }
    };

    {
        let mut w = client.data.write().await;
        w.insert::<PlayerKey>(controller.clone());
    }

    tokio::spawn(announce(client.cache_and_http.http.clone(), events));

    let shard_manager = client.shard_manager.clone();

    tokio::spawn(async move {
        let _ = client.start().await.map_err(|why| info!("Client ended: {why:?}"));
    });

    if let Err(why) = tokio::signal::ctrl_c().await {
        error!("Control-C interruption failed: {why:?}");
    }

    info!("Received Ctrl-C, shutting down.");

    for guild_id in controller.registry().guild_ids().await {
        let _ = controller.leave(guild_id).await;
    }

    shard_manager.lock().await.shutdown_all().await;

    cache.flush().await;

    let stats = cache.stats().await;
    info!(
        "Stream cache: {} entries, {} hits, {} misses ({:.1}% hit rate)",
        stats.size,
        stats.hits,
        stats.misses,
        stats.hit_rate()
    );
}
