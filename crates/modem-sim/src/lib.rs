//! Simulated cellular modem
//!
//! This crate provides a software modem for testing the link engine
//! without hardware. The simulation speaks the plain AT dialog (echo,
//! terminal tokens, CME errors), switches into CMUX basic mode on
//! `AT+CMUX`, answers SABM/DISC handshakes, runs the AT dialog behind
//! DLCI 2, loops bulk data back on DLCI 3, and can start "stuck" in
//! multiplexed mode or at a mismatched baud rate to exercise the
//! recovery paths.
//!
//! # Example
//!
//! ```rust,ignore
//! use modem_sim::{SimConfig, SimModem};
//! use std::sync::{atomic::AtomicU32, Arc};
//!
//! let (host, modem) = tokio::io::duplex(4096);
//! let speed = Arc::new(AtomicU32::new(115_200));
//! let sim = SimModem::spawn(modem, SimConfig::default(), Arc::clone(&speed));
//!
//! // `host` is the port the link engine opens; `sim` injects URCs
//! sim.inject_urc("+QIND: SMS DONE");
//! ```

pub mod modem;

pub use modem::{SimCommand, SimConfig, SimHandle, SimModem};
