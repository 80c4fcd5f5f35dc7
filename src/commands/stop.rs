//! /stop command: end the caller's recording and report the raw file

use serenity::all::{CommandInteraction, Context, CreateCommand, EditInteractionResponse};
use std::sync::Arc;
use tracing::info;

use crate::session::SessionManager;

pub fn register() -> CreateCommand {
    CreateCommand::new("stop").description("Stop your recording")
}

pub async fn handle(
    ctx: &Context,
    command: &CommandInteraction,
    session_manager: Arc<SessionManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    command.defer(&ctx.http).await?;

    let content = match session_manager.stop_session(command.user.id.get()).await {
        Ok(Some(handle)) => {
            let secs = handle.duration().num_seconds().max(0);
            info!(
                "Stopped recording for user {} after {}s",
                command.user.id, secs
            );
            let path = handle
                .output_path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            format!(
                "⏹️ Recording stopped after {}m {}s. Raw audio saved to `{}`.",
                secs / 60,
                secs % 60,
                path
            )
        }
        Ok(None) => "You don't have an active recording. Use /record to start one.".to_string(),
        Err(e) => format!("❌ Recording ended with an error: {}", e),
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;
    Ok(())
}
