//! One game connection and everything bound to it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, error, info};

use crate::bridge::BridgeResolver;
use crate::bus::{EventBus, InstanceIdentity};
use crate::common::error::{LimboError, SendQueueError};
use crate::common::events::{InstanceStatus, InstanceStatusEvent, MinecraftChatEvent};
use crate::common::{BusEvent, CommandPriority, EventPayload, InstanceType};
use crate::config::{AntispamConfig, LimboConfig, MinecraftInstanceConfig};
use crate::game::antispam::Antispam;
use crate::game::chat_parser::ChatParser;
use crate::game::connection::{run_connection_loop, OutboundLink, SessionObserver};
use crate::game::limbo::{IdleAction, LimboHandler};
use crate::game::send_queue::SendQueue;

pub type DispatchReceiver = oneshot::Receiver<Result<(), SendQueueError>>;

pub struct MinecraftInstance {
    config: MinecraftInstanceConfig,
    identity: InstanceIdentity,
    bus: Arc<EventBus>,
    resolver: Arc<BridgeResolver>,
    link: Arc<OutboundLink>,
    queue: Arc<SendQueue>,
    antispam: Antispam,
    limbo: LimboHandler,
    parser: ChatParser,
    reconnect: Notify,
}

impl MinecraftInstance {
    /// Build the instance and register it on the bus.
    pub fn new(
        config: MinecraftInstanceConfig,
        bus: Arc<EventBus>,
        resolver: Arc<BridgeResolver>,
        limbo: &LimboConfig,
        antispam: AntispamConfig,
    ) -> Result<Arc<Self>> {
        let identity = InstanceIdentity::new(config.name.clone(), InstanceType::Minecraft);
        bus.registry().register(identity.clone())?;

        let link = Arc::new(OutboundLink::default());
        let queue = SendQueue::new(config.name.clone(), link.clone());

        let idle_action: IdleAction = {
            let queue = Arc::clone(&queue);
            let command = limbo.idle_command.clone();
            Arc::new(move || {
                let queue = Arc::clone(&queue);
                let command = command.clone();
                async move {
                    if let Err(e) = queue.send(command, CommandPriority::High, None).await {
                        debug!("Idle command not sent: {}", e);
                    }
                }
                .boxed()
            })
        };
        let limbo = LimboHandler::new(
            config.name.clone(),
            Duration::from_secs(limbo.acquire_timeout_secs),
            Duration::from_secs(limbo.hold_timeout_secs),
            idle_action,
        );

        let parser = ChatParser::new(config.username.clone())?;

        Ok(Arc::new(Self {
            identity,
            bus,
            resolver,
            link,
            queue,
            antispam: Antispam::new(antispam),
            limbo,
            parser,
            reconnect: Notify::new(),
            config,
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn bridge_id(&self) -> Option<String> {
        self.resolver.get_bridge_id_for_instance(&self.config.name)
    }

    pub fn limbo(&self) -> &LimboHandler {
        &self.limbo
    }

    pub fn queue(&self) -> &Arc<SendQueue> {
        &self.queue
    }

    /// Queue a raw command.
    pub fn enqueue(
        &self,
        command: impl Into<String>,
        priority: CommandPriority,
        correlation_id: Option<String>,
    ) -> DispatchReceiver {
        self.queue.enqueue(command, priority, correlation_id)
    }

    /// Queue a chat message on `channel_command` (`/gc`, `/oc`), made
    /// distinct from recent messages on that channel first.
    pub fn enqueue_chat(&self, channel_command: &str, message: &str) -> DispatchReceiver {
        let message = self.antispam.process(channel_command, message);
        self.queue.enqueue(
            format!("{channel_command} {message}"),
            CommandPriority::Default,
            None,
        )
    }

    /// Hold the limbo gate while sending `commands` one after another.
    pub async fn run_exclusive(
        &self,
        commands: &[String],
        correlation_id: Option<String>,
    ) -> Result<(), LimboError> {
        let lock = self.limbo.acquire().await?;
        for command in commands {
            if let Err(e) = self
                .queue
                .send(command.clone(), CommandPriority::High, correlation_id.clone())
                .await
            {
                error!(instance = %self.config.name, "Exclusive step '{}' failed: {}", command, e);
                break;
            }
        }
        lock.release();
        Ok(())
    }

    /// Drop the current session; the connection loop reconnects.
    ///
    /// A request made while no session is waiting is kept for the next one.
    pub fn request_reconnect(&self) {
        self.reconnect.notify_one();
    }

    /// Run the connection loop until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        run_connection_loop(
            &self.config,
            &self.link,
            &*self,
            &self.reconnect,
            shutdown,
        )
        .await;
        self.limbo.close();
        info!(instance = %self.config.name, "Game instance stopped");
    }

    fn publish(&self, payload: EventPayload) {
        let context = self.identity.context().with_bridge(self.bridge_id());
        if let Err(e) = self.bus.publish(BusEvent::new(context, payload)) {
            error!(instance = %self.config.name, "Failed to publish: {}", e);
        }
    }
}

impl SessionObserver for MinecraftInstance {
    fn on_status(&self, status: InstanceStatus, message: &str) {
        self.publish(EventPayload::InstanceStatus(InstanceStatusEvent {
            status,
            message: message.to_string(),
        }));
    }

    fn on_line(&self, line: &str) {
        self.publish(EventPayload::MinecraftChat(MinecraftChatEvent {
            message: line.to_string(),
        }));
        if let Some(parsed) = self.parser.parse(line) {
            self.publish(parsed);
        }
    }

    fn on_spawn(&self) {
        self.limbo.on_world_join();
    }
}
