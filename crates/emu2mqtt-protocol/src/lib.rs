//! EMU-2 wire protocol: framing, response mapping, command encoding.
//!
//! The device streams XML fragments over serial, one root element per
//! response, with no prolog and arbitrary fragmentation at the byte level.
//! [`FrameDecoder`] reassembles complete fragments from raw chunks,
//! [`map_frame`] turns one fragment into a typed [`DeviceEvent`], and
//! [`DeviceCommand`] renders the XML the device accepts on its write path.
//!
//! [`DeviceEvent`]: emu2mqtt_core::DeviceEvent

pub mod command;
pub mod frame;
pub mod mapper;

pub use command::{format_price, DeviceCommand};
pub use frame::{FrameDecoder, RawFrame, MAX_FRAME_LEN};
pub use mapper::map_frame;
