//! Discord bot event handler, voice receive handler, and the songbird
//! implementation of the voice transport boundary

use crate::commands;
use crate::config::Config;
use crate::session::SessionManager;
use crate::transport::{
    ChannelRef, SpeakerId, TransportError, TransportEvent, TransportHandle, VoiceTransport,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serenity::all::{
    ChannelId, Client, Context, EventHandler, GatewayIntents, GuildId, Interaction, Ready,
};
use songbird::driver::DecodeMode;
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler};
use songbird::{CoreEvent, SerenityInit, Songbird};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bot state shared across handlers
pub struct BotState {
    pub config: Arc<Config>,
    pub session_manager: Arc<SessionManager>,
}

/// Main event handler for the bot
pub struct Handler {
    pub state: Arc<BotState>,
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Logged in as {}", ready.user.name);

        let commands = vec![
            commands::record::register(),
            commands::stop::register(),
            commands::status::register(),
        ];

        // If guild ID is set, register to specific guild (faster for dev)
        if let Some(guild_id) = self.state.config.guild_id {
            let guild = GuildId::new(guild_id);
            match guild.set_commands(&ctx.http, commands).await {
                Ok(cmds) => info!("Registered {} guild commands", cmds.len()),
                Err(e) => error!("Failed to register guild commands: {}", e),
            }
        } else {
            match serenity::all::Command::set_global_commands(&ctx.http, commands).await {
                Ok(cmds) => info!("Registered {} global commands", cmds.len()),
                Err(e) => error!("Failed to register global commands: {}", e),
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            let manager = self.state.session_manager.clone();
            let result = match command.data.name.as_str() {
                "record" => commands::record::handle(&ctx, &command, manager).await,
                "stop" => commands::stop::handle(&ctx, &command, manager).await,
                "status" => commands::status::handle(&ctx, &command, manager).await,
                _ => Ok(()),
            };

            if let Err(e) = result {
                error!("Command error: {}", e);
            }
        }
    }
}

/// Voice receive event handler: turns songbird driver events into
/// transport events for one session
#[derive(Clone)]
struct VoiceReceiver {
    events: mpsc::Sender<TransportEvent>,
    /// RTP source id to Discord user id, learned from speaking updates
    ssrc_to_user: Arc<DashMap<u32, u64>>,
}

#[async_trait]
impl VoiceEventHandler for VoiceReceiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(speaking) => {
                if let Some(user_id) = speaking.user_id {
                    self.ssrc_to_user.insert(speaking.ssrc, user_id.0);
                    let _ = self.events.try_send(TransportEvent::SpeakingStarted {
                        speaker: SpeakerId(user_id.0),
                    });
                }
            }
            EventContext::VoiceTick(tick) => {
                for (ssrc, data) in &tick.speaking {
                    let Some(user_id) = self.ssrc_to_user.get(ssrc).map(|r| *r.value()) else {
                        debug!("Dropping packet for unmapped ssrc {}", ssrc);
                        continue;
                    };
                    if let Some(packet) = &data.packet {
                        let payload = &packet.packet
                            [packet.payload_offset..packet.packet.len() - packet.payload_end_pad];
                        if !payload.is_empty()
                            && self
                                .events
                                .try_send(TransportEvent::Frame {
                                    speaker: SpeakerId(user_id),
                                    payload: payload.to_vec(),
                                })
                                .is_err()
                        {
                            warn!("Transport event queue full, dropping frame");
                        }
                    }
                }
            }
            EventContext::ClientDisconnect(disconnect) => {
                let _ = self.events.try_send(TransportEvent::SpeakerLeft {
                    speaker: SpeakerId(disconnect.user_id.0),
                });
            }
            EventContext::DriverDisconnect(_) => {
                let _ = self.events.try_send(TransportEvent::Disconnected);
            }
            _ => {}
        }

        None
    }
}

/// Songbird-backed voice transport
pub struct DiscordTransport {
    songbird: Arc<Songbird>,
}

impl DiscordTransport {
    pub fn new(songbird: Arc<Songbird>) -> Self {
        Self { songbird }
    }
}

#[async_trait]
impl VoiceTransport for DiscordTransport {
    async fn connect(
        &self,
        channel: ChannelRef,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let guild_id = GuildId::new(channel.guild_id);
        let call = self
            .songbird
            .join(guild_id, ChannelId::new(channel.channel_id))
            .await
            .map_err(|e| TransportError::Join(e.to_string()))?;

        let receiver = VoiceReceiver {
            events,
            ssrc_to_user: Arc::new(DashMap::new()),
        };
        {
            let mut call = call.lock().await;
            call.add_global_event(CoreEvent::SpeakingStateUpdate.into(), receiver.clone());
            call.add_global_event(CoreEvent::VoiceTick.into(), receiver.clone());
            call.add_global_event(CoreEvent::ClientDisconnect.into(), receiver.clone());
            call.add_global_event(CoreEvent::DriverDisconnect.into(), receiver);
        }

        info!(
            "Joined voice channel {} in guild {}",
            channel.channel_id, channel.guild_id
        );

        Ok(Box::new(DiscordCallHandle {
            songbird: self.songbird.clone(),
            guild_id,
        }))
    }
}

struct DiscordCallHandle {
    songbird: Arc<Songbird>,
    guild_id: GuildId,
}

#[async_trait]
impl TransportHandle for DiscordCallHandle {
    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.songbird
            .remove(self.guild_id)
            .await
            .map_err(|e| TransportError::Leave(e.to_string()))
    }
}

/// Create and run the Discord bot
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);

    // The engine decodes opus itself, so the driver only decrypts
    let songbird = Songbird::serenity_from_config(
        songbird::Config::default().decode_mode(DecodeMode::Decrypt),
    );

    let transport = Arc::new(DiscordTransport::new(songbird.clone()));
    let decoders = Arc::new(crate::audio::OpusDecoderFactory);
    let session_manager = Arc::new(SessionManager::new(transport, decoders, config.clone()));

    let state = Arc::new(BotState {
        config: config.clone(),
        session_manager,
    });

    let handler = Handler { state };

    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    info!("Starting bot...");
    client.start().await?;

    Ok(())
}
