//! End-to-end pipeline checks: raw serial bytes through the frame
//! decoder and mapper into the cache, asserting on the publications that
//! come out the other side.

use emu2mqtt_bridge::StateCache;
use emu2mqtt_core::DeviceEvent;
use emu2mqtt_protocol::{map_frame, FrameDecoder};

const DEVICE_INFO: &str = "<DeviceInfo>\
    <DeviceMacId>0xd8d5b900000113ae</DeviceMacId>\
    <FWVersion>2.0.0 (7400)</FWVersion>\
    <HWVersion>2.7.3</HWVersion>\
    <Manufacturer>Rainforest Automation, Inc.</Manufacturer>\
    <ModelId>Z105-2-EMU2-LEDD_JM</ModelId>\
    </DeviceInfo>";

const DEMAND: &str = "<InstantaneousDemand>\
    <DeviceMacId>0xd8d5b900000113ae</DeviceMacId>\
    <TimeStamp>0x2db8b962</TimeStamp>\
    <Demand>0x0004ad</Demand>\
    <Multiplier>0x00000001</Multiplier>\
    <Divisor>0x000003e8</Divisor>\
    <DigitsRight>0x03</DigitsRight>\
    </InstantaneousDemand>";

const CONNECTION: &str = "<ConnectionStatus>\
    <MeterMacId>0x00078100007a175d</MeterMacId>\
    <Status>Connected</Status>\
    <LinkStrength>0x64</LinkStrength>\
    </ConnectionStatus>";

const NOW: i64 = 1_700_000_000;

/// Feed a byte stream through the decoder in fixed-size chunks and map
/// every completed frame.
fn decode_all(stream: &[u8], chunk: usize) -> Vec<DeviceEvent> {
    let mut decoder = FrameDecoder::new();
    let mut events = Vec::new();
    for piece in stream.chunks(chunk) {
        decoder.extend(piece);
        while let Some(frame) = decoder.next_frame() {
            if let Ok(event) = map_frame(&frame.expect("well-formed stream")) {
                events.push(event);
            }
        }
    }
    events
}

#[test]
fn serial_bytes_become_stable_topics_after_identity() {
    let stream = format!("garbage{DEVICE_INFO}\r\n{CONNECTION}{DEMAND}");
    let events = decode_all(stream.as_bytes(), 7);
    assert_eq!(events.len(), 3);

    let mut cache = StateCache::new("emu2", 0);
    let mut publications = Vec::new();
    for event in &events {
        publications.extend(cache.update(event, NOW));
    }

    // Identity first, so every state topic carries the real MAC.
    assert!(publications
        .iter()
        .all(|p| !p.topic.contains("/emu2/emu2/")));
    let demand = publications
        .iter()
        .find(|p| p.topic == "emu2/0xd8d5b900000113ae/instantaneous_demand")
        .expect("demand publication");
    let payload: serde_json::Value = serde_json::from_str(&demand.payload).unwrap();
    assert_eq!(payload["demand"], 1.197);

    // Device info triggers the full discovery announcement, retained.
    let discovery: Vec<_> = publications
        .iter()
        .filter(|p| p.topic.starts_with("homeassistant/"))
        .collect();
    assert_eq!(discovery.len(), 12);
    assert!(discovery.iter().all(|p| p.retain));
}

#[test]
fn chunk_size_never_changes_the_event_stream() {
    let stream = format!("{DEVICE_INFO}{DEMAND}\r\nnoise\r\n{CONNECTION}");
    let whole = decode_all(stream.as_bytes(), stream.len());
    assert_eq!(whole.len(), 3);
    for chunk in [1, 2, 3, 16, 64] {
        assert_eq!(decode_all(stream.as_bytes(), chunk), whole, "chunk={chunk}");
    }
}

#[test]
fn repeated_readings_reach_the_broker_once() {
    let events = decode_all(DEMAND.repeat(5).as_bytes(), 32);
    assert_eq!(events.len(), 5);

    let mut cache = StateCache::new("emu2", 0);
    let published: usize = events
        .iter()
        .map(|e| cache.update(e, NOW).len())
        .sum();
    assert_eq!(published, 1);
}

#[test]
fn serial_flap_republishes_status_but_not_readings() {
    let mut cache = StateCache::new("emu2", 0);
    let events = decode_all(DEMAND.as_bytes(), 8);
    assert_eq!(cache.update(&events[0], NOW).len(), 1);

    assert_eq!(cache.bridge_status(true, NOW).len(), 1);
    assert_eq!(cache.bridge_status(true, NOW + 5).len(), 0);
    let down = cache.bridge_status(false, NOW + 10);
    assert_eq!(down.len(), 1);
    assert!(down[0].retain);

    // The reading itself is still deduplicated across the flap.
    assert_eq!(cache.update(&events[0], NOW + 20).len(), 0);
}

#[test]
fn meter_mac_from_connection_status_scopes_later_commands() {
    let stream = format!("{DEVICE_INFO}{CONNECTION}");
    let events = decode_all(stream.as_bytes(), 11);

    let mut cache = StateCache::new("emu2", 0);
    for event in &events {
        cache.update(event, NOW);
    }
    let info = cache.info().expect("identity known");
    assert_eq!(info.meter_mac_id.as_deref(), Some("0x00078100007a175d"));
}
