//! /status command: report whether the caller is recording

use serenity::all::{CommandInteraction, Context, CreateCommand};
use std::sync::Arc;

use crate::session::SessionManager;

pub fn register() -> CreateCommand {
    CreateCommand::new("status").description("Check whether you have an active recording")
}

pub async fn handle(
    ctx: &Context,
    command: &CommandInteraction,
    session_manager: Arc<SessionManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let content = if session_manager.is_active(command.user.id.get()) {
        "🎙️ You have an active recording."
    } else {
        "No active recording. Use /record to start one."
    };

    super::respond(ctx, command, content).await?;
    Ok(())
}
