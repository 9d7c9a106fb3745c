//! Tag-delimited frame extraction from the raw serial stream.
//!
//! Serial reads may split a response at any byte, coalesce several
//! responses, or carry line noise between them. The decoder is a small
//! state machine over an accumulation buffer: `Seeking` scans for a start
//! delimiter (discarding noise in front of it), `Accumulating` waits for
//! the matching close delimiter of the same root tag. Work is linear in
//! total bytes processed; nothing is rescanned from the start on each
//! chunk.

use emu2mqtt_core::FrameError;
use tracing::trace;

/// Hard cap on a single frame. A span that grows past this without a
/// closing tag is reported as oversized and discarded.
pub const MAX_FRAME_LEN: usize = 8 * 1024;

/// Longest root tag name the device emits, with headroom.
const MAX_TAG_LEN: usize = 64;

/// One complete, delimited response fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Vec<u8>,
}

impl RawFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Frame content as text. The device emits ASCII; anything else is a
    /// mapper-level error.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

#[derive(Debug)]
enum DecoderState {
    /// Looking for a start delimiter; bytes in front of it are noise.
    Seeking,
    /// Start delimiter seen; waiting for `</tag>`.
    Accumulating { tag: Vec<u8> },
}

/// Restartable frame decoder over an unbounded chunk sequence.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    state: DecoderState,
    max_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            state: DecoderState::Seeking,
            max_len,
        }
    }

    /// Append a chunk of raw bytes. Call [`next_frame`] until it returns
    /// `None` before appending more; every complete frame in the buffer is
    /// emitted before new input is required.
    ///
    /// [`next_frame`]: FrameDecoder::next_frame
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Drop all buffered bytes and return to `Seeking`. Used when the
    /// serial link reopens; a frame in flight at disconnect time is lost,
    /// not retried.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = DecoderState::Seeking;
    }

    /// Extract the next complete frame, or an error for a span that can
    /// no longer become one. `None` means more input is needed.
    pub fn next_frame(&mut self) -> Option<Result<RawFrame, FrameError>> {
        loop {
            match &self.state {
                DecoderState::Seeking => {
                    if !self.seek_start() {
                        return None;
                    }
                }
                DecoderState::Accumulating { tag } => {
                    let close = close_delimiter(tag);
                    // Search only within the size cap so the outcome does
                    // not depend on how the input was chunked: a close tag
                    // beyond the cap must not complete an oversized span.
                    let window = &self.buf[..self.buf.len().min(self.max_len)];
                    if let Some(pos) = find(window, &close) {
                        let end = pos + close.len();
                        let bytes: Vec<u8> = self.buf.drain(..end).collect();
                        self.state = DecoderState::Seeking;
                        trace!(len = bytes.len(), "framed device response");
                        return Some(Ok(RawFrame { bytes }));
                    }
                    if self.buf.len() > self.max_len {
                        let limit = self.max_len;
                        self.discard_span();
                        return Some(Err(FrameError::Oversized { limit }));
                    }
                    return None;
                }
            }
        }
    }

    /// Advance past noise to a start delimiter and latch its tag name.
    /// Returns false when more input is needed.
    fn seek_start(&mut self) -> bool {
        loop {
            let Some(lt) = self.buf.iter().position(|&b| b == b'<') else {
                self.buf.clear();
                return false;
            };
            if lt > 0 {
                self.buf.drain(..lt);
            }
            // Need at least `<` + one name byte to judge the candidate.
            let Some(&first) = self.buf.get(1) else {
                return false;
            };
            if !first.is_ascii_alphabetic() {
                self.buf.drain(..1);
                continue;
            }
            match self.buf[1..]
                .iter()
                .take(MAX_TAG_LEN + 1)
                .position(|&b| !is_tag_byte(b))
            {
                Some(name_len) if self.buf[1 + name_len] == b'>' => {
                    let tag = self.buf[1..1 + name_len].to_vec();
                    self.state = DecoderState::Accumulating { tag };
                    return true;
                }
                Some(_) => {
                    // Not a plain `<Tag>` opener; treat as noise.
                    self.buf.drain(..1);
                }
                None if self.buf.len() > MAX_TAG_LEN + 1 => {
                    self.buf.drain(..1);
                }
                None => return false,
            }
        }
    }

    /// Drop the failed span up to the next `<`, keeping any bytes that may
    /// open the next frame.
    fn discard_span(&mut self) {
        match self.buf[1..].iter().position(|&b| b == b'<') {
            Some(pos) => {
                self.buf.drain(..=pos);
            }
            None => self.buf.clear(),
        }
        self.state = DecoderState::Seeking;
    }
}

fn is_tag_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn close_delimiter(tag: &[u8]) -> Vec<u8> {
    let mut close = Vec::with_capacity(tag.len() + 3);
    close.extend_from_slice(b"</");
    close.extend_from_slice(tag);
    close.push(b'>');
    close
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMAND: &str = "<InstantaneousDemand>\
        <Demand>0x0004ad</Demand>\
        <Multiplier>0x00000001</Multiplier>\
        <Divisor>0x000003e8</Divisor>\
        </InstantaneousDemand>";

    fn collect_frames(decoder: &mut FrameDecoder) -> Vec<Result<RawFrame, FrameError>> {
        let mut out = Vec::new();
        while let Some(item) = decoder.next_frame() {
            out.push(item);
        }
        out
    }

    #[test]
    fn whole_frame_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(DEMAND.as_bytes());
        let frames = collect_frames(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().as_str(), Some(DEMAND));
    }

    #[test]
    fn byte_by_byte_matches_single_delivery() {
        let stream = format!("{DEMAND}\r\n{DEMAND}");

        let mut whole = FrameDecoder::new();
        whole.extend(stream.as_bytes());
        let expected = collect_frames(&mut whole);

        let mut trickle = FrameDecoder::new();
        let mut got = Vec::new();
        for byte in stream.as_bytes() {
            trickle.extend(std::slice::from_ref(byte));
            got.extend(collect_frames(&mut trickle));
        }
        assert_eq!(got, expected);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn every_split_point_yields_same_frames() {
        let stream = format!("noise{DEMAND}<TimeCluster><UTCTime>0x2dba38b2</UTCTime></TimeCluster>");
        let bytes = stream.as_bytes();

        let mut reference = FrameDecoder::new();
        reference.extend(bytes);
        let expected = collect_frames(&mut reference);
        assert_eq!(expected.len(), 2);

        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut got = Vec::new();
            decoder.extend(&bytes[..split]);
            got.extend(collect_frames(&mut decoder));
            decoder.extend(&bytes[split..]);
            got.extend(collect_frames(&mut decoder));
            assert_eq!(got, expected, "split at {split} diverged");
        }
    }

    #[test]
    fn multiple_frames_in_one_chunk_all_emitted() {
        let mut decoder = FrameDecoder::new();
        let stream = format!("{DEMAND}{DEMAND}{DEMAND}");
        decoder.extend(stream.as_bytes());
        assert_eq!(collect_frames(&mut decoder).len(), 3);
    }

    #[test]
    fn noise_before_start_is_discarded() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"\x00\xfful}garbage>>\r\n");
        decoder.extend(DEMAND.as_bytes());
        let frames = collect_frames(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[test]
    fn oversized_span_errors_and_resynchronizes() {
        let mut decoder = FrameDecoder::with_max_len(128);
        decoder.extend(b"<InstantaneousDemand>");
        decoder.extend(&vec![b'x'; 200]);
        decoder.extend(DEMAND.as_bytes());

        let frames = collect_frames(&mut decoder);
        assert_eq!(frames[0], Err(FrameError::Oversized { limit: 128 }));
        let recovered = frames
            .iter()
            .filter_map(|f| f.as_ref().ok())
            .collect::<Vec<_>>();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].as_str(), Some(DEMAND));
    }

    #[test]
    fn partial_frame_survives_until_completed() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"<PriceCluster><Price>0x0000013b</Price>");
        assert!(decoder.next_frame().is_none());
        decoder.extend(b"</PriceCluster>");
        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.as_str().unwrap().starts_with("<PriceCluster>"));
    }

    #[test]
    fn reset_drops_in_flight_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"<DeviceInfo><DeviceMacId>0xd8");
        decoder.reset();
        decoder.extend(DEMAND.as_bytes());
        let frames = collect_frames(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[test]
    fn close_tag_of_child_does_not_terminate_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"<DeviceInfo><ModelId>Z105-2</ModelId></DeviceInfo>");
        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.as_str().unwrap().ends_with("</DeviceInfo>"));
        assert!(decoder.next_frame().is_none());
    }
}
