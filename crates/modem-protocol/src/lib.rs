//! Cellular modem wire protocols
//!
//! This crate provides the pure protocol layer for driving a cellular
//! modem over a serial link:
//!
//! - **CMUX framing** (3GPP TS 27.010 basic mode): flag-delimited frames
//!   with DLCI addressing, a frame check sequence, and a streaming
//!   reassembler that tolerates arbitrary chunk boundaries
//! - **AT line protocol**: command formatting, response line splitting,
//!   and terminal-token classification (`OK` / `ERROR` / `+CME ERROR` /
//!   `+CMS ERROR`)
//! - **Result code tables**: total mappings from CME/CMS numeric codes
//!   to named error enums
//! - **URC classification**: fixed-prefix recognition of unsolicited
//!   result codes and boot-completion tracking
//!
//! No I/O happens here; everything operates on byte slices and strings,
//! which keeps the layer testable without hardware.
//!
//! # Example
//!
//! ```rust
//! use modem_protocol::frame::{Frame, FrameCodec};
//!
//! let frame = Frame::uih(2, b"AT+CSQ\r".to_vec());
//! let wire = frame.encode();
//!
//! let mut codec = FrameCodec::new();
//! codec.push_bytes(&wire[..3]);
//! codec.push_bytes(&wire[3..]);
//! assert_eq!(codec.next_frame(), Some(frame));
//! ```

pub mod at;
pub mod error;
pub mod errors;
pub mod fcs;
pub mod frame;
pub mod urc;

pub use at::{classify_terminal, complete_lines, format_command, TerminalToken};
pub use error::ParseError;
pub use errors::{CmeError, CmsError};
pub use frame::{mux_ctrl, Frame, FrameCodec, FrameType};
pub use urc::{ReadySet, UrcKind};
