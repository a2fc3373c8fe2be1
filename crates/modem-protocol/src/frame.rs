//! CMUX (3GPP TS 27.010) basic-mode framing
//!
//! Frames are delimited by the flag byte 0xF9 and carry an address byte
//! (DLCI + C/R + EA), a control byte (frame type + poll/final), a one or
//! two byte length field, the payload, and a single FCS byte.
//!
//! # Frame Format
//! ```text
//! F9 [addr] [ctrl] [len...] [payload...] [fcs] F9
//! ```
//!
//! Basic mode has no byte transparency: 0xF9 may legally appear inside a
//! payload, so frame closure is decided by a completeness predicate
//! (declared length reached and FCS valid), not by the flag alone. The
//! streaming codec accepts input in arbitrary chunk sizes and silently
//! resynchronizes after malformed data.

use std::collections::VecDeque;

use crate::error::ParseError;
use crate::fcs;

/// Frame delimiter byte
pub const FLAG: u8 = 0xF9;

/// Poll/final bit in the control byte
const PF_BIT: u8 = 0x10;

/// EA bit, set on the last byte of an extensible field
const EA_BIT: u8 = 0x01;

/// C/R bit in the address byte
const CR_BIT: u8 = 0x02;

/// Largest frame the codec will accumulate before declaring the stream
/// lost and resynchronizing (header + length-extended payload + FCS).
const MAX_FRAME_LEN: usize = 8192;

/// CMUX frame types (control byte with the P/F bit masked out)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameType {
    /// Set asynchronous balanced mode (channel open request)
    Sabm,
    /// Unnumbered acknowledgement (open/close accepted)
    Ua,
    /// Disconnected mode (open rejected)
    Dm,
    /// Disconnect (channel close request)
    Disc,
    /// Unnumbered information with header check only
    Uih,
    /// Unnumbered information
    Ui,
    /// Information (error-recovery mode)
    I,
}

impl FrameType {
    fn control_bits(self) -> u8 {
        match self {
            FrameType::Sabm => 0x2F,
            FrameType::Ua => 0x63,
            FrameType::Dm => 0x0F,
            FrameType::Disc => 0x43,
            FrameType::Uih => 0xEF,
            FrameType::Ui => 0x03,
            FrameType::I => 0x00,
        }
    }

    fn from_control(control: u8) -> Result<Self, ParseError> {
        match control & !PF_BIT {
            0x2F => Ok(FrameType::Sabm),
            0x63 => Ok(FrameType::Ua),
            0x0F => Ok(FrameType::Dm),
            0x43 => Ok(FrameType::Disc),
            0xEF => Ok(FrameType::Uih),
            0x03 => Ok(FrameType::Ui),
            0x00 => Ok(FrameType::I),
            other => Err(ParseError::InvalidControl(other)),
        }
    }

    /// UIH frames check only the header; all other types include the
    /// payload in the FCS.
    fn fcs_covers_payload(self) -> bool {
        !matches!(self, FrameType::Uih)
    }
}

/// A decoded CMUX frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Data link connection identifier (0 = control channel)
    pub dlci: u8,
    /// Frame type
    pub frame_type: FrameType,
    /// Poll/final bit
    pub poll_final: bool,
    /// Payload bytes (may be empty)
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with an empty payload (handshake/control frames)
    pub fn control(dlci: u8, frame_type: FrameType, poll_final: bool) -> Self {
        Self {
            dlci,
            frame_type,
            poll_final,
            payload: Vec::new(),
        }
    }

    /// Create a UIH data frame for a channel
    pub fn uih(dlci: u8, payload: Vec<u8>) -> Self {
        Self {
            dlci,
            frame_type: FrameType::Uih,
            poll_final: false,
            payload,
        }
    }

    /// Serialize to basic-mode wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 7);
        out.push(FLAG);

        let addr = (self.dlci << 2) | CR_BIT | EA_BIT;
        out.push(addr);

        let mut control = self.frame_type.control_bits();
        if self.poll_final {
            control |= PF_BIT;
        }
        out.push(control);

        let len = self.payload.len();
        if len < 128 {
            out.push(((len as u8) << 1) | EA_BIT);
        } else {
            out.push(((len & 0x7F) as u8) << 1);
            out.push((len >> 7) as u8);
        }

        out.extend_from_slice(&self.payload);

        let checked = if self.frame_type.fcs_covers_payload() {
            &out[1..]
        } else {
            &out[1..out.len() - self.payload.len()]
        };
        out.push(fcs::compute(checked));
        out.push(FLAG);
        out
    }
}

/// Outcome of the completeness predicate on an accumulated body
enum Completeness {
    /// Not enough bytes yet; the closing flag was payload
    Incomplete,
    /// Body parses and the FCS verifies
    Complete(Frame),
    /// Body is the declared length but fails validation, or overran it
    Malformed(ParseError),
}

/// Streaming frame reassembler
///
/// Push received chunks with [`push_bytes`](FrameCodec::push_bytes) and
/// drain decoded frames with [`next_frame`](FrameCodec::next_frame).
/// Malformed input is dropped, never returned; the stream resynchronizes
/// on the next flag byte.
pub struct FrameCodec {
    buffer: Vec<u8>,
    in_frame: bool,
    ready: VecDeque<Frame>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            in_frame: false,
            ready: VecDeque::new(),
        }
    }

    /// Push raw bytes into the reassembly buffer
    pub fn push_bytes(&mut self, data: &[u8]) {
        for &byte in data {
            self.push_byte(byte);
        }
    }

    /// Pop the next fully decoded frame, if any
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.ready.pop_front()
    }

    /// Discard all buffered state
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
        self.ready.clear();
    }

    fn push_byte(&mut self, byte: u8) {
        if !self.in_frame {
            if byte == FLAG {
                self.in_frame = true;
                self.buffer.clear();
            }
            // Bytes between frames are line noise; drop them.
            return;
        }

        if byte == FLAG {
            if self.buffer.is_empty() {
                // Back-to-back flags: the previous flag closed a frame
                // (or opened an empty one); this one opens the next.
                return;
            }
            match Self::try_complete(&self.buffer) {
                Completeness::Complete(frame) => {
                    self.ready.push_back(frame);
                    self.buffer.clear();
                    // The closing flag doubles as the next frame's
                    // opening flag.
                }
                Completeness::Incomplete => {
                    // The flag byte is payload data.
                    self.buffer.push(byte);
                }
                Completeness::Malformed(err) => {
                    tracing::warn!(
                        "dropping malformed frame ({} bytes): {}",
                        self.buffer.len(),
                        err
                    );
                    self.buffer.clear();
                }
            }
            return;
        }

        self.buffer.push(byte);
        if self.buffer.len() > MAX_FRAME_LEN {
            tracing::warn!("frame reassembly overflow, resynchronizing");
            self.buffer.clear();
            self.in_frame = false;
        }
    }

    /// Decide whether `body` (bytes between flags) is a complete frame
    ///
    /// Header fields are validated as soon as they are present so that
    /// short garbage between flags fails fast instead of absorbing the
    /// next frame's bytes as payload.
    fn try_complete(body: &[u8]) -> Completeness {
        let Some(&addr) = body.first() else {
            return Completeness::Incomplete;
        };
        if addr & EA_BIT == 0 {
            return Completeness::Malformed(ParseError::InvalidFrame(
                "extended address bytes are not used".into(),
            ));
        }
        let dlci = addr >> 2;

        let Some(&control) = body.get(1) else {
            return Completeness::Incomplete;
        };
        let frame_type = match FrameType::from_control(control) {
            Ok(t) => t,
            Err(e) => return Completeness::Malformed(e),
        };
        let poll_final = control & PF_BIT != 0;

        // addr + ctrl + len + fcs
        if body.len() < 4 {
            return Completeness::Incomplete;
        }

        let (payload_len, header_len) = if body[2] & EA_BIT != 0 {
            ((body[2] >> 1) as usize, 3)
        } else {
            if body.len() < 5 {
                return Completeness::Incomplete;
            }
            (((body[2] >> 1) as usize) | ((body[3] as usize) << 7), 4)
        };

        let expected = header_len + payload_len + 1;
        if body.len() < expected {
            return Completeness::Incomplete;
        }
        if body.len() > expected {
            return Completeness::Malformed(ParseError::InvalidFrame(format!(
                "length field declares {} payload bytes but body holds {}",
                payload_len,
                body.len() - header_len - 1
            )));
        }

        let fcs_byte = body[expected - 1];
        let checked = if frame_type.fcs_covers_payload() {
            &body[..expected - 1]
        } else {
            &body[..header_len]
        };
        if !fcs::verify(checked, fcs_byte) {
            return Completeness::Malformed(ParseError::FcsMismatch { dlci });
        }

        Completeness::Complete(Frame {
            dlci,
            frame_type,
            poll_final,
            payload: body[header_len..expected - 1].to_vec(),
        })
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexer control-channel messages (carried in UIH payloads on DLCI 0)
pub mod mux_ctrl {
    /// Close-down message type octet (CLD command, EA|C/R set)
    pub const CLD: u8 = 0xC3;
    /// Modem status command type octet (MSC command, EA|C/R set)
    pub const MSC: u8 = 0xE3;
    /// Flow control bit in the V.24 signal octet
    pub const FC_BIT: u8 = 0x02;

    /// V.24 signals asserted by default: EA | RTC | RTR | DV
    const V24_DEFAULT: u8 = 0x8D;

    /// The close-down message that exits multiplexed mode
    pub fn cld_message() -> Vec<u8> {
        vec![CLD, 0x01]
    }

    /// Build an MSC message for a DLCI, optionally asserting flow-off
    pub fn msc_message(dlci: u8, flow_off: bool) -> Vec<u8> {
        let signals = if flow_off {
            V24_DEFAULT | FC_BIT
        } else {
            V24_DEFAULT
        };
        vec![MSC, 0x05, (dlci << 2) | 0x03, signals]
    }

    /// Echo an MSC command back in its response form (C/R cleared)
    pub fn msc_response(payload: &[u8]) -> Vec<u8> {
        let mut out = payload.to_vec();
        if let Some(t) = out.first_mut() {
            *t &= !0x02;
        }
        out
    }

    /// Parse an MSC message (command or response form), returning
    /// (dlci, flow_off)
    pub fn parse_msc(payload: &[u8]) -> Option<(u8, bool)> {
        if payload.len() < 4 || payload[0] | 0x02 != MSC {
            return None;
        }
        let dlci = payload[2] >> 2;
        let flow_off = payload[3] & FC_BIT != 0;
        Some((dlci, flow_off))
    }

    /// True if the payload is a close-down message
    pub fn is_cld(payload: &[u8]) -> bool {
        payload.first() == Some(&CLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Option<Frame> {
        let mut codec = FrameCodec::new();
        codec.push_bytes(bytes);
        codec.next_frame()
    }

    #[test]
    fn sabm_dlci0_known_bytes() {
        let frame = Frame::control(0, FrameType::Sabm, true);
        assert_eq!(frame.encode(), vec![0xF9, 0x03, 0x3F, 0x01, 0x1C, 0xF9]);
    }

    #[test]
    fn ua_dlci0_known_bytes() {
        let frame = Frame::control(0, FrameType::Ua, true);
        assert_eq!(frame.encode(), vec![0xF9, 0x03, 0x73, 0x01, 0xD7, 0xF9]);
    }

    #[test]
    fn round_trip_uih() {
        let frame = Frame::uih(2, b"AT+CSQ\r".to_vec());
        assert_eq!(decode_one(&frame.encode()), Some(frame));
    }

    #[test]
    fn round_trip_empty_payload() {
        let frame = Frame::control(1, FrameType::Disc, true);
        assert_eq!(decode_one(&frame.encode()), Some(frame));
    }

    #[test]
    fn round_trip_long_payload_two_byte_length() {
        let frame = Frame::uih(3, vec![0xAB; 300]);
        let encoded = frame.encode();
        // Two-byte length field: EA clear on the first byte
        assert_eq!(encoded[3] & 0x01, 0);
        assert_eq!(decode_one(&encoded), Some(frame));
    }

    #[test]
    fn payload_containing_flag_byte() {
        let frame = Frame::uih(2, vec![0xF9, 0x00, 0xF9, 0xF9]);
        assert_eq!(decode_one(&frame.encode()), Some(frame));
    }

    #[test]
    fn single_byte_chunks() {
        let frame = Frame::uih(2, b"AT\r".to_vec());
        let encoded = frame.encode();
        let mut codec = FrameCodec::new();
        for &b in &encoded {
            codec.push_bytes(&[b]);
        }
        assert_eq!(codec.next_frame(), Some(frame));
        assert_eq!(codec.next_frame(), None);
    }

    #[test]
    fn shared_flag_between_frames() {
        let first = Frame::uih(1, b"a".to_vec());
        let second = Frame::uih(2, b"b".to_vec());
        let mut stream = first.encode();
        // Drop the second frame's opening flag so the frames share one.
        stream.extend_from_slice(&second.encode()[1..]);

        let mut codec = FrameCodec::new();
        codec.push_bytes(&stream);
        assert_eq!(codec.next_frame(), Some(first));
        assert_eq!(codec.next_frame(), Some(second));
    }

    #[test]
    fn corrupted_fcs_dropped_next_frame_survives() {
        let bad = {
            let mut bytes = Frame::uih(1, b"garbled".to_vec()).encode();
            let fcs_pos = bytes.len() - 2;
            bytes[fcs_pos] ^= 0xFF;
            bytes
        };
        let good = Frame::uih(2, b"AT\r".to_vec());

        let mut codec = FrameCodec::new();
        codec.push_bytes(&bad);
        codec.push_bytes(&good.encode());
        assert_eq!(codec.next_frame(), Some(good));
        assert_eq!(codec.next_frame(), None);
    }

    #[test]
    fn noise_between_frames_ignored() {
        let frame = Frame::uih(2, b"OK".to_vec());
        let mut codec = FrameCodec::new();
        codec.push_bytes(&[0x00, 0x55, 0xAA]);
        codec.push_bytes(&frame.encode());
        codec.push_bytes(&[0x13, 0x37]);
        assert_eq!(codec.next_frame(), Some(frame));
    }

    #[test]
    fn msc_message_round_trip() {
        let msg = mux_ctrl::msc_message(2, true);
        assert_eq!(mux_ctrl::parse_msc(&msg), Some((2, true)));
        let msg = mux_ctrl::msc_message(3, false);
        assert_eq!(mux_ctrl::parse_msc(&msg), Some((3, false)));
    }

    #[test]
    fn cld_detected() {
        assert!(mux_ctrl::is_cld(&mux_ctrl::cld_message()));
        assert!(!mux_ctrl::is_cld(&mux_ctrl::msc_message(1, false)));
    }
}
