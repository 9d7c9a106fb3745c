//! Bridge assembly: task wiring, the event consumer, and the poll
//! scheduler.
//!
//! The consumer task is the single owner of the [`StateCache`]; the two
//! link managers never touch it. Everything meets over channels, so a
//! stalled broker cannot block a serial read and vice versa.

use std::time::Duration;

use emu2mqtt_core::{BackoffPolicy, BridgeConfig, DeviceEvent, EmuDeviceInfo, LinkState};
use emu2mqtt_protocol::DeviceCommand;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{Publication, StateCache};
use crate::dispatcher::CommandDispatcher;
use crate::mqtt::MqttLink;
use crate::serial::SerialLink;
use crate::BridgeEvent;

/// Delay between scheduled polls at startup, so the device is not hit
/// with the whole poll set inside one write gap.
const POLL_STAGGER: Duration = Duration::from_secs(5);

/// One periodically polled reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    DeviceInfo,
    ConnectionStatus,
    Time,
    Price,
    Summation,
    CurrentPeriod,
    LastPeriod,
}

impl PollKind {
    const ALL: [PollKind; 7] = [
        PollKind::DeviceInfo,
        PollKind::ConnectionStatus,
        PollKind::Time,
        PollKind::Price,
        PollKind::Summation,
        PollKind::CurrentPeriod,
        PollKind::LastPeriod,
    ];

    fn interval(self) -> Duration {
        match self {
            PollKind::DeviceInfo => Duration::from_secs(300),
            PollKind::ConnectionStatus => Duration::from_secs(60),
            PollKind::Time => Duration::from_secs(3600),
            PollKind::Price => Duration::from_secs(1800),
            PollKind::Summation => Duration::from_secs(60),
            PollKind::CurrentPeriod => Duration::from_secs(60),
            PollKind::LastPeriod => Duration::from_secs(10_800),
        }
    }

    /// The command this poll issues. Meter-scoped reads stay silent
    /// until the meter MAC is known.
    pub fn command(self, meter_mac: Option<&str>) -> Option<DeviceCommand> {
        let meter = |mac: Option<&str>| mac.map(str::to_string);
        match self {
            PollKind::DeviceInfo => Some(DeviceCommand::GetDeviceInfo),
            PollKind::Time => Some(DeviceCommand::GetTime),
            PollKind::ConnectionStatus => meter(meter_mac)
                .map(|meter_mac_id| DeviceCommand::GetConnectionStatus { meter_mac_id }),
            PollKind::Price => meter(meter_mac)
                .map(|meter_mac_id| DeviceCommand::GetCurrentPrice { meter_mac_id }),
            PollKind::Summation => meter(meter_mac).map(|meter_mac_id| {
                DeviceCommand::GetCurrentSummationDelivered { meter_mac_id }
            }),
            PollKind::CurrentPeriod => meter(meter_mac)
                .map(|meter_mac_id| DeviceCommand::GetCurrentPeriodUsage { meter_mac_id }),
            PollKind::LastPeriod => meter(meter_mac)
                .map(|meter_mac_id| DeviceCommand::GetLastPeriodUsage { meter_mac_id }),
        }
    }
}

/// Due-time bookkeeping for the periodic polls. Pure state so the
/// schedule can be tested without a clock.
pub struct PollSchedule {
    entries: Vec<(PollKind, Instant)>,
}

impl PollSchedule {
    /// Schedule every poll starting from `now`, staggered.
    pub fn new(now: Instant) -> Self {
        let entries = PollKind::ALL
            .iter()
            .enumerate()
            .map(|(i, &kind)| (kind, now + POLL_STAGGER * i as u32))
            .collect();
        Self { entries }
    }

    /// When the earliest poll is due.
    pub fn next_due(&self) -> Instant {
        self.entries
            .iter()
            .map(|(_, due)| *due)
            .min()
            .unwrap_or_else(Instant::now)
    }

    /// Polls due at `now`, each rescheduled one interval out.
    pub fn due(&mut self, now: Instant) -> Vec<PollKind> {
        let mut fired = Vec::new();
        for (kind, due) in &mut self.entries {
            if *due <= now {
                fired.push(*kind);
                *due = now + kind.interval();
            }
        }
        fired
    }

    /// Restart the staggered schedule from `now` (serial reconnect or
    /// reinitialize: poll everything soon).
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }
}

/// The assembled bridge.
pub struct Bridge {
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Wire the tasks together and run until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (event_tx, event_rx) = mpsc::channel::<BridgeEvent>(64);
        let (publication_tx, publication_rx) = mpsc::channel::<Publication>(64);
        let (command_tx, command_rx) = mpsc::channel::<DeviceCommand>(16);
        let (reinit_tx, reinit_rx) = mpsc::channel::<()>(4);
        let (serial_state_tx, serial_state_rx) = watch::channel(LinkState::Disconnected);
        let (mqtt_state_tx, _mqtt_state_rx) = watch::channel(LinkState::Disconnected);
        let (info_tx, info_rx) = watch::channel::<Option<EmuDeviceInfo>>(None);
        let (discovery_tx, discovery_rx) = watch::channel::<Vec<Publication>>(Vec::new());

        let dispatcher = CommandDispatcher::new(
            self.config.mqtt.prefix.clone(),
            self.config.mqtt.ha_status_topic.clone(),
            command_tx.clone(),
            reinit_tx,
            info_rx,
            serial_state_rx.clone(),
        );

        let serial = SerialLink::new(
            self.config.serial.clone(),
            BackoffPolicy::default(),
            event_tx,
            command_rx,
            serial_state_tx,
            shutdown.clone(),
        );
        let mqtt = MqttLink::new(
            &self.config.mqtt,
            dispatcher,
            BackoffPolicy::default(),
            publication_rx,
            discovery_rx,
            mqtt_state_tx,
            shutdown.clone(),
        );

        let tz_offset_secs = chrono::Local::now().offset().local_minus_utc() as i64;
        let consumer = Consumer {
            cache: StateCache::new(self.config.mqtt.prefix.clone(), tz_offset_secs),
            schedule: PollSchedule::new(Instant::now()),
            events: event_rx,
            reinit: reinit_rx,
            publications: publication_tx,
            commands: command_tx,
            serial_state: serial_state_rx,
            info_tx,
            discovery_tx,
            shutdown,
        };

        info!(
            broker = %self.config.mqtt.hostname,
            device = %self.config.serial.device,
            "bridge starting"
        );
        let serial_task = tokio::spawn(serial.run());
        let mqtt_task = tokio::spawn(mqtt.run());
        consumer.run().await;
        let _ = serial_task.await;
        let _ = mqtt_task.await;
        info!("bridge stopped");
        Ok(())
    }
}

/// Single owner of the state cache; reacts to events, schedules polls.
struct Consumer {
    cache: StateCache,
    schedule: PollSchedule,
    events: mpsc::Receiver<BridgeEvent>,
    reinit: mpsc::Receiver<()>,
    publications: mpsc::Sender<Publication>,
    commands: mpsc::Sender<DeviceCommand>,
    serial_state: watch::Receiver<LinkState>,
    info_tx: watch::Sender<Option<EmuDeviceInfo>>,
    discovery_tx: watch::Sender<Vec<Publication>>,
    shutdown: watch::Receiver<bool>,
}

impl Consumer {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                reinit = self.reinit.recv() => {
                    if reinit.is_some() {
                        self.reinitialize().await;
                    }
                }
                _ = tokio::time::sleep_until(self.schedule.next_due()) => {
                    self.poll().await;
                }
            }
        }
    }

    async fn on_event(&mut self, event: BridgeEvent) {
        let now_unix = chrono::Utc::now().timestamp();
        let publications = match event {
            BridgeEvent::Device(device_event) => {
                let out = self.cache.update(&device_event, now_unix);
                self.share_identity(&device_event);
                out
            }
            BridgeEvent::SerialStatus { connected } => {
                if connected {
                    // Fresh link: learn identity and readings right away.
                    self.schedule.reset(Instant::now());
                }
                self.cache.bridge_status(connected, now_unix)
            }
        };
        self.send_all(publications).await;
    }

    /// Keep the dispatcher's view of the device identity and the MQTT
    /// link's discovery replay set current.
    fn share_identity(&mut self, event: &DeviceEvent) {
        if !matches!(
            event,
            DeviceEvent::DeviceInfo(_) | DeviceEvent::ConnectionStatus { .. }
        ) {
            return;
        }
        if self.info_tx.borrow().as_ref() != self.cache.info() {
            let _ = self.info_tx.send(self.cache.info().cloned());
        }
        let discovery = self.cache.discovery();
        if self.discovery_tx.borrow().as_slice() != discovery {
            let _ = self.discovery_tx.send(discovery.to_vec());
        }
    }

    /// HA birth or explicit request: re-announce discovery and re-poll.
    async fn reinitialize(&mut self) {
        info!("reinitializing");
        let discovery = self.cache.discovery().to_vec();
        self.send_all(discovery).await;
        self.schedule.reset(Instant::now());
    }

    async fn poll(&mut self) {
        let now = Instant::now();
        let due = self.schedule.due(now);
        if !self.serial_state.borrow().is_connected() {
            // The schedule has advanced; the reconnect handler re-arms
            // an immediate round anyway.
            return;
        }
        let meter_mac = self
            .cache
            .info()
            .and_then(|i| i.meter_mac_id.clone());
        for kind in due {
            let Some(command) = kind.command(meter_mac.as_deref()) else {
                debug!(?kind, "poll skipped, meter not yet known");
                continue;
            };
            if self.commands.send(command).await.is_err() {
                warn!("serial command channel closed");
                return;
            }
        }
    }

    async fn send_all(&self, publications: Vec<Publication>) {
        for p in publications {
            if self.publications.send(p).await.is_err() {
                return;
            }
        }
    }
}
