//! Line-oriented game session transport.
//!
//! Each game instance talks to a relay over TCP, one UTF-8 line per message.
//! Inbound lines are chat as the game client saw it, except relay control
//! lines starting with [`CONTROL_PREFIX`]:
//!
//! - `#!spawn`: the bot joined a world or respawned
//! - `#!kicked <reason>`: the server dropped the bot
//!
//! Outbound lines are typed into the game chat verbatim.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use backon::BackoffBuilder;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::common::events::InstanceStatus;
use crate::config::MinecraftInstanceConfig;
use crate::game::send_queue::GameSender;

pub const CONTROL_PREFIX: &str = "#!";

/// Longest accepted inbound line.
const MAX_LINE_LENGTH: usize = 32 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum InboundLine<'a> {
    Chat(&'a str),
    Spawn,
    Kicked(&'a str),
    /// A control line this version does not know.
    Control(&'a str),
}

pub fn classify_inbound(line: &str) -> InboundLine<'_> {
    let Some(control) = line.strip_prefix(CONTROL_PREFIX) else {
        return InboundLine::Chat(line);
    };
    let (name, rest) = control.split_once(' ').unwrap_or((control, ""));
    match name {
        "spawn" => InboundLine::Spawn,
        "kicked" => InboundLine::Kicked(rest.trim()),
        _ => InboundLine::Control(control),
    }
}

/// Writer side of whichever session is currently open.
#[derive(Default)]
pub struct OutboundLink {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl OutboundLink {
    fn attach(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn detach(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_connected(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl GameSender for OutboundLink {
    fn send(&self, line: &str) -> Result<()> {
        match self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx
                .send(line.to_string())
                .map_err(|_| anyhow!("game session closed")),
            None => bail!("not connected to the game"),
        }
    }
}

/// What a session reports back to its instance.
pub trait SessionObserver: Send + Sync {
    fn on_status(&self, status: InstanceStatus, message: &str);
    fn on_line(&self, line: &str);
    fn on_spawn(&self);
}

#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Closed,
    Kicked(String),
    Reconnect,
    Shutdown,
}

/// Pump one established session until it ends.
pub async fn run_session<S>(
    stream: S,
    link: &OutboundLink,
    observer: &dyn SessionObserver,
    reconnect: &Notify,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut outbound = link.attach();
    observer.on_status(InstanceStatus::Connected, "session established");

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                match line {
                    Some(Ok(line)) => match classify_inbound(&line) {
                        InboundLine::Chat(text) => observer.on_line(text),
                        InboundLine::Spawn => observer.on_spawn(),
                        InboundLine::Kicked(reason) => break Ok(SessionEnd::Kicked(reason.to_string())),
                        InboundLine::Control(other) => debug!("Ignoring relay control line: {}", other),
                    },
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(SessionEnd::Closed),
                }
            }

            Some(line) = outbound.recv() => {
                if let Err(e) = framed.send(line).await {
                    break Err(e.into());
                }
            }

            _ = reconnect.notified() => break Ok(SessionEnd::Reconnect),

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Ok(SessionEnd::Shutdown);
                }
            }
        }
    };

    link.detach();
    result
}

/// 5s initial, 5min max, factor 1.1, with jitter, unlimited retries.
fn game_backoff() -> impl Iterator<Item = Duration> {
    backon::ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(5))
        .with_max_delay(Duration::from_secs(5 * 60))
        .with_factor(1.1)
        .with_jitter()
        .without_max_times()
        .build()
}

/// Connect, run sessions and reconnect with backoff until shutdown.
pub async fn run_connection_loop(
    config: &MinecraftInstanceConfig,
    link: &OutboundLink,
    observer: &dyn SessionObserver,
    reconnect: &Notify,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = game_backoff();

    loop {
        if *shutdown.borrow() {
            break;
        }

        observer.on_status(InstanceStatus::Connecting, "connecting");
        info!(instance = %config.name, "Connecting to {}:{}", config.host, config.port);

        let mut delay_needed = true;
        match TcpStream::connect((config.host.as_str(), config.port)).await {
            Ok(stream) => {
                backoff = game_backoff();
                match run_session(stream, link, observer, reconnect, &mut shutdown).await {
                    Ok(SessionEnd::Shutdown) => {
                        observer.on_status(InstanceStatus::Ended, "shutting down");
                        break;
                    }
                    Ok(SessionEnd::Reconnect) => {
                        info!(instance = %config.name, "Reconnect requested");
                        observer.on_status(InstanceStatus::Disconnected, "reconnect requested");
                        delay_needed = false;
                    }
                    Ok(SessionEnd::Kicked(reason)) => {
                        warn!(instance = %config.name, "Kicked: {}", reason);
                        observer.on_status(InstanceStatus::Disconnected, &reason);
                    }
                    Ok(SessionEnd::Closed) => {
                        info!(instance = %config.name, "Game session closed");
                        observer.on_status(InstanceStatus::Disconnected, "connection closed");
                    }
                    Err(e) => {
                        error!(instance = %config.name, "Game session error: {}", e);
                        observer.on_status(InstanceStatus::Failed, &e.to_string());
                    }
                }
            }
            Err(e) => {
                error!(instance = %config.name, "Failed to connect: {}", e);
                observer.on_status(InstanceStatus::Failed, &e.to_string());
            }
        }

        if !delay_needed {
            continue;
        }

        let delay = backoff.next().unwrap_or(Duration::from_secs(5 * 60));
        info!(instance = %config.name, "Reconnecting in {:.1} seconds...", delay.as_secs_f64());

        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = reconnect.notified() => {},
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(instance = %config.name, "Shutdown signal received during backoff");
                    observer.on_status(InstanceStatus::Ended, "shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl SessionObserver for Recorder {
        fn on_status(&self, status: InstanceStatus, _message: &str) {
            self.log.lock().unwrap().push(format!("status:{status}"));
        }
        fn on_line(&self, line: &str) {
            self.log.lock().unwrap().push(format!("line:{line}"));
        }
        fn on_spawn(&self) {
            self.log.lock().unwrap().push("spawn".to_string());
        }
    }

    #[test]
    fn test_classify_inbound() {
        assert_eq!(classify_inbound("Guild > A: hi"), InboundLine::Chat("Guild > A: hi"));
        assert_eq!(classify_inbound("#!spawn"), InboundLine::Spawn);
        assert_eq!(
            classify_inbound("#!kicked You logged in from another location"),
            InboundLine::Kicked("You logged in from another location")
        );
        assert_eq!(classify_inbound("#!ping 5"), InboundLine::Control("ping 5"));
    }

    #[test]
    fn test_link_without_session_fails() {
        let link = OutboundLink::default();
        assert!(!link.is_connected());
        assert!(link.send("/gc hi").is_err());
    }

    #[tokio::test]
    async fn test_session_relays_both_directions() {
        let (client, server) = tokio::io::duplex(4096);
        let link = Arc::new(OutboundLink::default());
        let observer = Arc::new(Recorder::default());
        let reconnect = Arc::new(Notify::new());
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let session = {
            let link = Arc::clone(&link);
            let observer = Arc::clone(&observer);
            let reconnect = Arc::clone(&reconnect);
            tokio::spawn(async move {
                run_session(client, &link, observer.as_ref(), &reconnect, &mut shutdown_rx).await
            })
        };

        let (read_half, mut write_half) = tokio::io::split(server);
        write_half
            .write_all(b"Guild > Steve: hi\n#!spawn\n")
            .await
            .unwrap();

        while !link.is_connected() {
            tokio::task::yield_now().await;
        }
        link.send("/gc hello").unwrap();
        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("/gc hello"));

        write_half.write_all(b"#!kicked bye\n").await.unwrap();
        let end = session.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Kicked("bye".to_string()));
        assert!(!link.is_connected());

        assert_eq!(
            *observer.log.lock().unwrap(),
            vec!["status:connected", "line:Guild > Steve: hi", "spawn"]
        );
    }

    #[tokio::test]
    async fn test_session_ends_on_reconnect_request() {
        let (client, _server) = tokio::io::duplex(1024);
        let link = OutboundLink::default();
        let observer = Recorder::default();
        let reconnect = Notify::new();
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let session = run_session(client, &link, &observer, &reconnect, &mut shutdown_rx);
        let trigger = async {
            while !link.is_connected() {
                tokio::task::yield_now().await;
            }
            reconnect.notify_one();
        };
        let (end, ()) = tokio::join!(session, trigger);
        assert_eq!(end.unwrap(), SessionEnd::Reconnect);
    }

    #[tokio::test]
    async fn test_reconnect_requested_before_session_is_kept() {
        let (client, mut server) = tokio::io::duplex(1024);
        let link = OutboundLink::default();
        let observer = Recorder::default();
        let reconnect = Notify::new();
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        // Requested while connecting, before anything waits on it.
        reconnect.notify_one();
        server.write_all(b"Guild > Steve: hi\n").await.unwrap();

        let end = run_session(client, &link, &observer, &reconnect, &mut shutdown_rx).await;
        assert_eq!(end.unwrap(), SessionEnd::Reconnect);
        assert!(!link.is_connected());
    }
}
