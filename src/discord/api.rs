//! Outbound Discord calls.
//!
//! Everything that talks to Discord goes through [`PlatformApi`] so the
//! delivery logic can be exercised without a gateway connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use backon::BackoffBuilder;
use serenity::http::{Http, HttpError};
use serenity::model::channel::Channel;
use serenity::model::id::ChannelId;
use tracing::warn;

/// Discord rejects longer messages.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

#[async_trait]
pub trait PlatformApi: Send + Sync + 'static {
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<()>;

    /// Display name of a channel, `None` if it is not a guild channel.
    async fn channel_name(&self, channel_id: u64) -> Result<Option<String>>;
}

/// 500ms initial, 10s max, 4 attempts.
fn send_backoff() -> impl Iterator<Item = Duration> {
    backon::ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(4)
        .with_jitter()
        .build()
}

/// Run `op` until it succeeds, fails permanently or the backoff runs out.
pub async fn retry_transient<T, E, F, Fut, B, P>(
    what: &str,
    mut backoff: B,
    is_transient: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: Iterator<Item = Duration>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => match backoff.next() {
                Some(delay) => {
                    warn!("{} failed: {}. Retrying in {:.1}s...", what, e, delay.as_secs_f64());
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Network trouble and server-side errors are worth another attempt.
fn is_transient(error: &serenity::Error) -> bool {
    match error {
        serenity::Error::Io(_) => true,
        serenity::Error::Http(HttpError::Request(_)) => true,
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => {
            response.status_code.is_server_error()
        }
        _ => false,
    }
}

/// Cut `content` to Discord's limit on a character boundary.
pub fn truncate_message(content: &str) -> &str {
    if content.len() <= MAX_MESSAGE_LENGTH {
        return content;
    }
    let mut end = MAX_MESSAGE_LENGTH;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

/// [`PlatformApi`] backed by serenity's REST client.
pub struct SerenityApi {
    http: Arc<Http>,
}

impl SerenityApi {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PlatformApi for SerenityApi {
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<()> {
        let channel = ChannelId::new(channel_id);
        let content = truncate_message(content);
        retry_transient("Discord send", send_backoff(), is_transient, || {
            channel.say(&self.http, content)
        })
        .await?;
        Ok(())
    }

    async fn channel_name(&self, channel_id: u64) -> Result<Option<String>> {
        let channel = ChannelId::new(channel_id);
        let channel = retry_transient("Discord channel fetch", send_backoff(), is_transient, || {
            channel.to_channel(&self.http)
        })
        .await?;
        Ok(match channel {
            Channel::Guild(channel) => Some(channel.name),
            _ => None,
        })
    }
}
