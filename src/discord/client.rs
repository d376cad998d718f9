//! Discord gateway client.
//!
//! Wraps serenity's client so the rest of the application only deals with
//! building it, grabbing its REST handle and running it until shutdown.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use serenity::http::{Http, HttpBuilder};
use serenity::prelude::*;
use serenity::Client;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::discord::handler::DiscordHandler;

/// 5s initial, 5min max, factor 1.1, with jitter, unlimited retries.
fn discord_backoff() -> impl Iterator<Item = Duration> {
    backon::ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(5))
        .with_max_delay(Duration::from_secs(5 * 60))
        .with_factor(1.1)
        .with_jitter()
        .without_max_times()
        .build()
}

fn intents() -> GatewayIntents {
    GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
}

async fn build_client(token: &str, handler: Arc<DiscordHandler>) -> anyhow::Result<Client> {
    // Build a custom reqwest client with timeout settings
    let reqwest_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let http = HttpBuilder::new(token).client(reqwest_client).build();

    let client = serenity::client::ClientBuilder::new_with_http(http, intents())
        .event_handler_arc(handler)
        .await?;
    Ok(client)
}

pub struct DiscordClient {
    client: Option<Client>,
    token: String,
    handler: Arc<DiscordHandler>,
    http: Arc<Http>,
}

impl DiscordClient {
    pub async fn build(token: String, handler: Arc<DiscordHandler>) -> anyhow::Result<Self> {
        let client = build_client(&token, Arc::clone(&handler)).await?;
        let http = Arc::clone(&client.http);
        Ok(Self {
            client: Some(client),
            token,
            handler,
            http,
        })
    }

    /// REST handle, usable whether or not the gateway is connected.
    pub fn http(&self) -> Arc<Http> {
        Arc::clone(&self.http)
    }

    /// Keep the gateway connected until `shutdown_rx` flips to `true`.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = discord_backoff();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            info!("Connecting to Discord...");
            let mut client = match self.client.take() {
                Some(client) => client,
                None => {
                    // serenity mostly handles reconnections itself.
                    match build_client(&self.token, Arc::clone(&self.handler)).await {
                        Ok(client) => {
                            backoff = discord_backoff();
                            client
                        }
                        Err(e) => {
                            error!("Failed to rebuild Discord client: {}", e);
                            let delay = backoff.next().unwrap_or(Duration::from_secs(5 * 60));
                            warn!("Retrying in {:.1}s...", delay.as_secs_f64());
                            sleep(delay).await;
                            continue;
                        }
                    }
                }
            };
            let shard_manager = Arc::clone(&client.shard_manager);

            let result = tokio::select! {
                result = client.start() => Some(result),
                _ = wait_for_shutdown(&mut shutdown_rx) => None,
            };

            match result {
                None => {
                    info!("Initiating graceful Discord shutdown...");
                    shard_manager.shutdown_all().await;
                    info!("Discord shutdown complete");
                    break;
                }
                Some(Ok(())) => {
                    info!("Discord client disconnected normally");
                    break;
                }
                Some(Err(e)) => {
                    error!("Discord client error: {}", e);
                    let delay = backoff.next().unwrap_or(Duration::from_secs(5 * 60));
                    warn!(
                        "Discord disconnected. Reconnecting in {:.1}s...",
                        delay.as_secs_f64(),
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    }
                }
            }
        }
        info!("Discord task ended");
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
