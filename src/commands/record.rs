//! /record command: join the caller's voice channel and start capturing

use serenity::all::{CommandInteraction, Context, CreateCommand, EditInteractionResponse};
use std::sync::Arc;
use tracing::info;

use crate::session::{SessionError, SessionManager};
use crate::transport::ChannelRef;

pub fn register() -> CreateCommand {
    CreateCommand::new("record").description("Start recording your current voice channel")
}

pub async fn handle(
    ctx: &Context,
    command: &CommandInteraction,
    session_manager: Arc<SessionManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let guild_id = command.guild_id.ok_or("Must be used in a guild")?;

    // Get user's voice channel from guild cache
    let voice_channel_id = {
        let guild = ctx.cache.guild(guild_id).ok_or("Guild not in cache")?;
        guild
            .voice_states
            .get(&command.user.id)
            .and_then(|vs| vs.channel_id)
    };

    let Some(voice_channel_id) = voice_channel_id else {
        super::respond(
            ctx,
            command,
            "Join a voice channel first, then run /record again.",
        )
        .await?;
        return Ok(());
    };

    // Joining voice can take a while; acknowledge first
    command.defer(&ctx.http).await?;

    let channel = ChannelRef {
        guild_id: guild_id.get(),
        channel_id: voice_channel_id.get(),
    };

    let content = match session_manager
        .start_session(command.user.id.get(), channel)
        .await
    {
        Ok(()) => {
            info!(
                "Started recording for user {} in channel {}",
                command.user.id, voice_channel_id
            );
            format!(
                "🎙️ Recording <#{}>. Use /stop to finish.",
                voice_channel_id
            )
        }
        Err(SessionError::AlreadyRecording) => {
            "⚠️ You already have an active recording. Use /stop to end it first.".to_string()
        }
        Err(e) => format!("❌ Unable to start recording: {}", e),
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;
    Ok(())
}
