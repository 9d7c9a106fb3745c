//! MQTT link manager.
//!
//! One task drives the rumqttc event loop. Outbound publications arrive
//! over a channel and go out through the async client, which queues them
//! while the broker is away; inbound publishes on the command topics go
//! straight to the dispatcher. Every successful (re)connect re-subscribes
//! and replays the retained discovery configs, so a broker that lost its
//! retained store heals on its own.

use std::time::Duration;

use emu2mqtt_core::{BackoffPolicy, LinkError, LinkState, MqttSettings, Reconnector};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::Publication;
use crate::dispatcher::CommandDispatcher;

const CLIENT_ID: &str = "emu2mqtt";
const REQUEST_QUEUE: usize = 64;

fn options(settings: &MqttSettings) -> MqttOptions {
    let mut options = MqttOptions::new(CLIENT_ID, &settings.hostname, settings.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
        options.set_credentials(user, pass);
    }
    options
}

/// Owns the broker connection and its reconnect state machine.
pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
    dispatcher: CommandDispatcher,
    reconnect: Reconnector,
    publications: mpsc::Receiver<Publication>,
    /// Current discovery set, maintained by the event consumer.
    discovery: watch::Receiver<Vec<Publication>>,
    state: watch::Sender<LinkState>,
    shutdown: watch::Receiver<bool>,
}

impl MqttLink {
    pub fn new(
        settings: &MqttSettings,
        dispatcher: CommandDispatcher,
        backoff: BackoffPolicy,
        publications: mpsc::Receiver<Publication>,
        discovery: watch::Receiver<Vec<Publication>>,
        state: watch::Sender<LinkState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let reconnect = Reconnector::new(backoff);
        let (client, mut eventloop) = AsyncClient::new(options(settings), REQUEST_QUEUE);
        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(reconnect.connect_timeout().as_secs());
        eventloop.set_network_options(network_options);
        Self {
            client,
            eventloop,
            dispatcher,
            reconnect,
            publications,
            discovery,
            state,
            shutdown,
        }
    }

    /// What a fresh broker session must (re)establish: the command
    /// subscriptions and the retained discovery replay.
    fn session_refresh(&self) -> (Vec<String>, Vec<Publication>) {
        (
            self.dispatcher.subscriptions(),
            self.discovery.borrow().clone(),
        )
    }

    pub async fn run(mut self) {
        let _ = self.state.send(LinkState::Connecting);
        loop {
            if *self.shutdown.borrow() {
                let _ = self.client.disconnect().await;
                break;
            }
            tokio::select! {
                _ = self.shutdown.changed() => {}
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to broker");
                        let _ = self.state.send(self.reconnect.connected());
                        self.on_connect().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.dispatcher.handle(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let err = LinkError::Mqtt(e.to_string());
                        warn!(error = %err, "broker connection lost");
                        let backoff = self.reconnect.failed(Instant::now());
                        if let LinkState::Backoff { until, .. } = backoff {
                            let _ = self.state.send(backoff.clone());
                            tokio::select! {
                                _ = tokio::time::sleep_until(until) => {
                                    let _ = self.state.send(LinkState::Connecting);
                                }
                                _ = self.shutdown.changed() => {}
                            }
                        }
                    }
                },
                publication = self.publications.recv() => match publication {
                    Some(p) => self.publish(p).await,
                    // Consumer gone; nothing left to deliver.
                    None => break,
                },
            }
        }
        let _ = self.state.send(LinkState::Disconnected);
    }

    /// Re-arm subscriptions and replay retained discovery after a
    /// (re)connect.
    async fn on_connect(&mut self) {
        let (subscriptions, replay) = self.session_refresh();
        for topic in subscriptions {
            if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
                warn!(topic, error = %e, "subscribe failed");
            }
        }
        for config in replay {
            self.publish(config).await;
        }
    }

    async fn publish(&mut self, p: Publication) {
        debug!(topic = %p.topic, retain = p.retain, "publishing");
        if let Err(e) = self
            .client
            .publish(&p.topic, QoS::AtLeastOnce, p.retain, p.payload.into_bytes())
            .await
        {
            warn!(topic = %p.topic, error = %e, "publish failed");
        }
    }
}
