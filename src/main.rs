//! Guildlink - guild chat bridge between Discord and Minecraft
//!
//! Relays guild and officer chat between Discord channels and one or more
//! game sessions, and lets officers moderate the guild from Discord.

mod bridge;
mod bus;
mod common;
mod config;
mod discord;
mod game;
mod moderation;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use bridge::{Bridge, BridgeResolver, LogErrorSink};
use bus::{EventBus, InstanceIdentity, InstanceRegistry};
use common::persist::JsonFile;
use common::InstanceType;
use config::{env::get_config_path, load_and_validate};
use discord::bridge::verify_channels;
use discord::{CommandExecutor, DiscordBridge, DiscordClient, DiscordHandler, SerenityApi};
use game::{ChatTriggerCorrelator, MinecraftBridge, MinecraftInstance, TriggerRuleSet};
use moderation::{HeatTracker, Moderation, PunishmentStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Guildlink v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path);

    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is properly formatted.", config_path);
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  Game instances: {}", config.minecraft.instances.len());
    info!("  Static bridges: {}", config.bridges.len());
    info!("  Data directory: {}", config.general.data_dir);

    // ============================================================
    // Bus and identities
    // ============================================================
    let registry = Arc::new(InstanceRegistry::new());
    let bus = Arc::new(EventBus::new(Arc::clone(&registry)));

    let discord_identity = InstanceIdentity::new("discord", InstanceType::Discord);
    let moderation_identity = InstanceIdentity::internal("moderation", InstanceType::Moderation);
    let correlator_identity = InstanceIdentity::internal("correlator", InstanceType::Main);
    for identity in [&discord_identity, &moderation_identity, &correlator_identity] {
        registry.register(identity.clone())?;
    }

    // ============================================================
    // Bridges and moderation ledgers
    // ============================================================
    let data_dir = PathBuf::from(&config.general.data_dir);
    let resolver = Arc::new(BridgeResolver::with_dynamic_store(
        config.bridges.clone(),
        JsonFile::new(data_dir.join("bridges.json")),
    )?);
    if !resolver.is_multi_bridge_enabled() {
        info!("No bridge configured, running in single-bridge mode");
    }

    let moderation = Arc::new(Moderation::new(
        Arc::clone(&bus),
        moderation_identity,
        HeatTracker::open(
            config.moderation.clone(),
            JsonFile::new(data_dir.join("heat.json")),
        )?,
        PunishmentStore::open(JsonFile::new(data_dir.join("punishments.json")))?,
    )?);
    let moderation_listener = moderation.spawn_listener();

    // ============================================================
    // Game instances
    // ============================================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut instances = Vec::new();
    for instance_config in &config.minecraft.instances {
        let instance = MinecraftInstance::new(
            instance_config.clone(),
            Arc::clone(&bus),
            Arc::clone(&resolver),
            &config.minecraft.limbo,
            config.minecraft.antispam.clone(),
        )?;
        info!(
            instance = %instance.name(),
            bridge = ?instance.bridge_id(),
            "Game instance registered"
        );
        instances.push(instance);
    }
    registry.verify_integrity()?;

    let game_tasks: Vec<_> = instances
        .iter()
        .map(|instance| tokio::spawn(Arc::clone(instance).run(shutdown_rx.clone())))
        .collect();
    let mut game_task = tokio::spawn(async move {
        join_all(game_tasks).await;
    });

    // ============================================================
    // Discord
    // ============================================================
    let correlator = ChatTriggerCorrelator::new(Arc::clone(&bus), correlator_identity);
    let commands = Arc::new(CommandExecutor::new(
        Arc::clone(&bus),
        discord_identity.clone(),
        Arc::clone(&resolver),
        correlator,
        TriggerRuleSet::builtin()?,
        Arc::clone(&moderation),
    ));
    let handler = Arc::new(DiscordHandler::new(
        &config.discord,
        Arc::clone(&bus),
        discord_identity,
        Arc::clone(&resolver),
        Arc::clone(&moderation),
        commands,
    ));
    let ready = handler.ready_signal();

    let discord_client = DiscordClient::build(config.discord.token.clone(), handler).await?;
    let api = Arc::new(SerenityApi::new(discord_client.http()));

    // ============================================================
    // Platform bridges
    // ============================================================
    let sink = Arc::new(LogErrorSink);
    let bridges = vec![
        Bridge::spawn(
            "minecraft",
            Arc::clone(&bus),
            MinecraftBridge::new(instances.clone(), Arc::clone(&resolver)),
            sink.clone(),
        ),
        Bridge::spawn(
            "discord",
            Arc::clone(&bus),
            DiscordBridge::new(
                api.clone(),
                Arc::clone(&resolver),
                config.discord.public_channel_ids.clone(),
                config.discord.officer_channel_ids.clone(),
            ),
            sink,
        ),
    ];

    let channel_check = {
        let resolver = Arc::clone(&resolver);
        let mut legacy = config.discord.public_channel_ids.clone();
        legacy.extend(&config.discord.officer_channel_ids);
        tokio::spawn(async move {
            loop {
                ready.notified().await;
                verify_channels(api.as_ref(), &resolver, &legacy).await;
            }
        })
    };

    info!("Starting Discord bot...");
    let mut discord_task = tokio::spawn(discord_client.run(shutdown_rx.clone()));

    // ============================================================
    // Run until shutdown
    // ============================================================
    let (game_done, discord_done) = tokio::select! {
        biased;
        _ = shutdown_signal() => {
            info!("Shutdown signal received - stopping...");
            (false, false)
        }
        _ = &mut game_task => {
            warn!("All game instances stopped");
            (true, false)
        }
        _ = &mut discord_task => {
            warn!("Discord client stopped");
            (false, true)
        }
    };

    // Signal every task to stop (fire-and-forget - if channel closed, they are already gone)
    if let Err(e) = shutdown_tx.send(true) {
        debug!("Shutdown channel closed (tasks already exited): {}", e);
    }
    let timeout = Duration::from_secs(5);
    if !game_done {
        match tokio::time::timeout(timeout, game_task).await {
            Ok(Ok(())) => info!("Game instances disconnected gracefully"),
            Ok(Err(e)) => warn!("Game task panicked: {}", e),
            Err(_) => warn!("Game disconnect timed out"),
        }
    }
    if !discord_done && tokio::time::timeout(timeout, discord_task).await.is_err() {
        warn!("Discord shutdown timed out");
    }

    for bridge in bridges {
        bridge.shutdown().await;
    }
    channel_check.abort();
    moderation_listener.abort();

    info!("Exiting...");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
