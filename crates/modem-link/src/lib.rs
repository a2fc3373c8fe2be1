//! CMUX link engine for cellular modems
//!
//! Turns a single byte-oriented serial transport into multiple
//! independent logical channels, with an AT command engine and a
//! bring-up orchestrator on top:
//!
//! - [`transport`]: the [`ByteChannel`] trait the engine is written
//!   against, plus a stream adapter for serial ports and simulations
//! - [`port`]: the worker task owning the transport, and the
//!   cloneable [`LinkHandle`]
//! - [`router`]: per-DLCI dispatch, handshake resolution and flow
//!   control in multiplexed mode
//! - [`at`]: the one-command-at-a-time AT engine with CME/CMS mapping
//!   and URC interception
//! - [`bringup`]: baud detection, modem configuration, CMUX
//!   negotiation and audio tuning
//!
//! # Example
//!
//! ```rust,ignore
//! use modem_link::{bringup, spawn_link, BringupConfig, StreamChannel};
//! use tokio::sync::mpsc;
//!
//! let port = tokio_serial::new("/dev/ttyUSB0", 115_200).open_native_async()?;
//! let (event_tx, mut event_rx) = mpsc::channel(256);
//! let (handle, at) = spawn_link(StreamChannel::new(port), event_tx.clone());
//!
//! let channels = bringup::run(&handle, &at, &BringupConfig::default(), &event_tx).await?;
//! ```

pub mod at;
pub mod bringup;
pub mod channel;
pub mod error;
pub mod events;
pub mod port;
pub mod router;
pub mod transport;

pub use at::{AtChannel, AtError, CmdCode, CmdResult};
pub use bringup::{BringupConfig, BringupState, CmuxParams, EchoStrength, LinkChannels};
pub use channel::ChannelKind;
pub use error::LinkError;
pub use events::LinkEvent;
pub use port::{spawn_link, LinkHandle, LinkMode};
pub use transport::{
    AntennaBand, ByteChannel, ReadChunk, ReadStatus, StreamChannel, DEFAULT_BAUD, MAX_CHUNK_SIZE,
};
