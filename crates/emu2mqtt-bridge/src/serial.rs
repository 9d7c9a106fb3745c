//! Serial link manager.
//!
//! One task owns the serial port for its whole life: open, read, write,
//! reconnect. Reads feed the frame decoder and every decoded frame is
//! mapped and forwarded as a [`BridgeEvent`]; writes arrive over a
//! channel from the dispatcher and poll scheduler. Nobody else touches
//! the port or its `LinkState`.

use std::time::Duration;

use emu2mqtt_core::{
    BackoffPolicy, LinkError, LinkState, MappingError, Reconnector, SerialSettings,
};
use emu2mqtt_protocol::{map_frame, DeviceCommand, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::BridgeEvent;

/// The EMU-2 drops commands that arrive too close together; space writes
/// out by at least this much.
pub const MIN_WRITE_GAP: Duration = Duration::from_secs(3);

/// Earliest instant the next command may be written. A command that
/// arrives inside the gap is parked until then; reads continue meanwhile.
fn write_gate(last_write: Option<Instant>, now: Instant) -> Instant {
    match last_write {
        Some(last) => (last + MIN_WRITE_GAP).max(now),
        None => now,
    }
}

/// Owns the serial port and its reconnect state machine.
pub struct SerialLink {
    settings: SerialSettings,
    reconnect: Reconnector,
    events: mpsc::Sender<BridgeEvent>,
    commands: mpsc::Receiver<DeviceCommand>,
    state: watch::Sender<LinkState>,
    shutdown: watch::Receiver<bool>,
}

impl SerialLink {
    pub fn new(
        settings: SerialSettings,
        backoff: BackoffPolicy,
        events: mpsc::Sender<BridgeEvent>,
        commands: mpsc::Receiver<DeviceCommand>,
        state: watch::Sender<LinkState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            settings,
            reconnect: Reconnector::new(backoff),
            events,
            commands,
            state,
            shutdown,
        }
    }

    /// Connect-read-reconnect loop; returns when shutdown is signalled
    /// or the event consumer goes away.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let _ = self.state.send(LinkState::Connecting);
            let port = tokio_serial::new(&self.settings.device, self.settings.baudrate)
                .open_native_async();
            match port {
                Ok(port) => {
                    info!(device = %self.settings.device, "serial port open");
                    let _ = self.state.send(self.reconnect.connected());
                    if self
                        .events
                        .send(BridgeEvent::SerialStatus { connected: true })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    let outcome = self.serve(port).await;
                    let _ = self.state.send(LinkState::Disconnected);
                    let consumer_gone = self
                        .events
                        .send(BridgeEvent::SerialStatus { connected: false })
                        .await
                        .is_err();
                    match outcome {
                        Ok(()) => break,
                        Err(e) => {
                            warn!(error = %e, "serial link lost");
                            if consumer_gone {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    let err = LinkError::Serial(e.to_string());
                    warn!(device = %self.settings.device, error = %err, "serial open failed");
                }
            }
            let backoff = self.reconnect.failed(Instant::now());
            if let LinkState::Backoff { until, .. } = backoff {
                let _ = self.state.send(backoff.clone());
                tokio::select! {
                    _ = tokio::time::sleep_until(until) => {}
                    _ = self.shutdown.changed() => {}
                }
            }
        }
        let _ = self.state.send(LinkState::Disconnected);
    }

    /// Read/write loop on an open port. `Err` is a lost link that should
    /// reconnect; `Ok` means shut down for good.
    async fn serve(&mut self, mut port: SerialStream) -> Result<(), LinkError> {
        // Frame accumulation never survives a reconnect; the device may
        // have restarted mid-fragment.
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];
        let mut last_write: Option<Instant> = None;
        let mut parked: Option<DeviceCommand> = None;

        loop {
            let gate = write_gate(last_write, Instant::now());
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
                read = port.read(&mut buf) => match read {
                    Ok(0) => {
                        return Err(LinkError::Serial("device returned EOF".to_string()));
                    }
                    Ok(n) => {
                        decoder.extend(&buf[..n]);
                        if self.drain_frames(&mut decoder).await {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        return Err(LinkError::Serial(format!("read failed: {e}")));
                    }
                },
                cmd = self.commands.recv(), if parked.is_none() => match cmd {
                    Some(cmd) => parked = Some(cmd),
                    // All command producers gone; the bridge is tearing down.
                    None => return Ok(()),
                },
                _ = tokio::time::sleep_until(gate), if parked.is_some() => {
                    if let Some(cmd) = parked.take() {
                        debug!(command = cmd.name(), "writing command");
                        let xml = cmd.to_xml();
                        if let Err(e) = port.write_all(xml.as_bytes()).await {
                            return Err(LinkError::Serial(format!("write failed: {e}")));
                        }
                        last_write = Some(Instant::now());
                    }
                }
            }
        }
    }

    /// Pull every complete frame out of the decoder and forward the
    /// mapped events. Returns `true` if the consumer is gone.
    async fn drain_frames(&mut self, decoder: &mut FrameDecoder) -> bool {
        while let Some(frame) = decoder.next_frame() {
            match frame {
                Ok(frame) => match map_frame(&frame) {
                    Ok(event) => {
                        if self.events.send(BridgeEvent::Device(event)).await.is_err() {
                            return true;
                        }
                    }
                    // The EMU-2 emits fragment types we do not track;
                    // that is noise, not an error.
                    Err(MappingError::Unrecognized(tag)) => {
                        debug!(tag, "skipping unrecognized fragment");
                    }
                    Err(e) => {
                        warn!(error = %e, frame = frame.as_str(), "unmappable fragment");
                    }
                },
                Err(e) => {
                    warn!(error = %e, "frame discarded");
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu2mqtt_core::DeviceEvent;

    #[test]
    fn gate_enforced_only_within_window() {
        let now = Instant::now();
        assert_eq!(write_gate(None, now), now);
        assert_eq!(
            write_gate(Some(now - Duration::from_secs(1)), now),
            now + Duration::from_secs(2)
        );
        assert_eq!(write_gate(Some(now - Duration::from_secs(5)), now), now);
    }

    fn test_link(
        commands: mpsc::Receiver<DeviceCommand>,
        events: mpsc::Sender<BridgeEvent>,
    ) -> (SerialLink, watch::Receiver<LinkState>, watch::Sender<bool>) {
        let (state_tx, state_rx) = watch::channel(LinkState::Connected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = SerialLink::new(
            SerialSettings {
                device: "pty".to_string(),
                baudrate: 115_200,
            },
            BackoffPolicy::default(),
            events,
            commands,
            state_tx,
            shutdown_rx,
        );
        (link, state_rx, shutdown_tx)
    }

    #[tokio::test]
    async fn reads_flow_while_a_command_waits_out_the_gap() {
        let (mut host, device) = SerialStream::pair().expect("pty pair");
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (mut link, _state_rx, _shutdown_tx) = test_link(command_rx, event_tx);
        let task = tokio::spawn(async move { link.serve(device).await });

        // First command goes out immediately; the second is parked for
        // the full write gap.
        command_tx.send(DeviceCommand::GetDeviceInfo).await.unwrap();
        command_tx.send(DeviceCommand::GetTime).await.unwrap();

        host.write_all(
            b"<TimeCluster>\
              <UTCTime>0x2db8b962</UTCTime>\
              <LocalTime>0x2db8a062</LocalTime>\
              </TimeCluster>",
        )
        .await
        .unwrap();

        // Well under the 3 s gap: the frame must not wait behind the
        // parked command.
        let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .expect("frame delivered while a command was parked")
            .expect("link alive");
        assert!(matches!(
            event,
            BridgeEvent::Device(DeviceEvent::TimeCluster { .. })
        ));

        task.abort();
    }
}
