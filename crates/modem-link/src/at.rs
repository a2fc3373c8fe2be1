//! AT command engine
//!
//! A single spawned task owns the receive buffer for the AT dialog and
//! processes one command at a time: requests queue on a channel, so two
//! callers can never interleave their command/response cycles on the
//! one physical link. Bytes that arrive while no command is in flight,
//! and any lines left over after a terminal token, are handed to the
//! URC scanner.
//!
//! The engine reads the same byte stream in both link modes: in plain
//! mode the worker forwards raw chunks, in multiplexed mode the
//! commands channel sink feeds it DLCI payloads. Only the write side
//! differs, which [`AtWriter`] hides.

use std::time::Duration;

use modem_protocol::{
    at, classify_terminal, format_command, CmeError, CmsError, Frame, ReadySet, TerminalToken,
    UrcKind,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::channel::ChannelKind;
use crate::error::LinkError;
use crate::events::LinkEvent;
use crate::port::{LinkHandle, LinkMode};

/// How a command exchange concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdCode {
    /// Terminal `OK`
    Ok,
    /// `ERROR`, `+CME ERROR` or `+CMS ERROR`
    Error,
    /// The deadline passed with no terminal token. A valid outcome the
    /// caller must handle, not a fault.
    Timeout,
    /// The requested number of response lines arrived before any
    /// terminal token
    Tokens,
}

/// Modem-reported failure accompanying an `ERROR` outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AtError {
    /// `+CME ERROR`: a fault in the mobile equipment
    #[error("equipment error: {0}")]
    Equipment(CmeError),
    /// `+CMS ERROR`: a fault on the network/SMS side
    #[error("network error: {0}")]
    Network(CmsError),
}

/// Outcome of one command exchange
#[derive(Debug, Clone)]
pub struct CmdResult {
    pub code: CmdCode,
    /// Response lines, echo and terminal token excluded
    pub lines: Vec<String>,
    /// Mapped CME/CMS code when the modem reported one
    pub error: Option<AtError>,
}

impl CmdResult {
    pub fn is_ok(&self) -> bool {
        self.code == CmdCode::Ok
    }

    /// First response line, for single-line query replies
    pub fn first_line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }
}

/// A queued command exchange
#[derive(Debug)]
pub struct CmdRequest {
    pub command: String,
    pub timeout: Duration,
    /// If non-zero, terminate with [`CmdCode::Tokens`] once this many
    /// response lines have arrived
    pub min_response_lines: usize,
    pub done: oneshot::Sender<Result<CmdResult, LinkError>>,
}

/// Cloneable handle for issuing AT commands
#[derive(Clone)]
pub struct AtChannel {
    req_tx: mpsc::Sender<CmdRequest>,
}

impl AtChannel {
    pub fn new(req_tx: mpsc::Sender<CmdRequest>) -> Self {
        Self { req_tx }
    }

    /// Run one command to a terminal token or the timeout
    pub async fn cmd(&self, command: &str, timeout: Duration) -> Result<CmdResult, LinkError> {
        self.request(command, timeout, 0).await
    }

    /// Run a command whose completion is a fixed reply count rather
    /// than a terminal token
    pub async fn cmd_expecting(
        &self,
        command: &str,
        timeout: Duration,
        min_response_lines: usize,
    ) -> Result<CmdResult, LinkError> {
        self.request(command, timeout, min_response_lines).await
    }

    async fn request(
        &self,
        command: &str,
        timeout: Duration,
        min_response_lines: usize,
    ) -> Result<CmdResult, LinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.req_tx
            .send(CmdRequest {
                command: command.to_string(),
                timeout,
                min_response_lines,
                done: done_tx,
            })
            .await
            .map_err(|_| LinkError::PortClosed)?;
        done_rx.await.map_err(|_| LinkError::PortClosed)?
    }
}

/// Write side of the AT dialog: raw bytes in plain mode, UIH-framed on
/// the commands DLCI in multiplexed mode
pub struct AtWriter {
    handle: LinkHandle,
    mode_rx: watch::Receiver<LinkMode>,
}

impl AtWriter {
    pub fn new(handle: LinkHandle, mode_rx: watch::Receiver<LinkMode>) -> Self {
        Self { handle, mode_rx }
    }

    pub async fn write(&self, text: &str) -> Result<(), LinkError> {
        let mode = *self.mode_rx.borrow();
        let line = format_command(text);
        let bytes = match mode {
            LinkMode::Plain => line.into_bytes(),
            LinkMode::Multiplexed => {
                Frame::uih(ChannelKind::Commands.dlci(), line.into_bytes()).encode()
            }
        };
        self.handle.write(bytes).await?;
        Ok(())
    }
}

/// Take every complete line out of the buffer, leaving the fragment
fn drain_lines(buffer: &mut String) -> Vec<String> {
    let (lines, rest) = at::complete_lines(buffer);
    let owned: Vec<String> = lines.into_iter().map(str::to_string).collect();
    let rest = rest.to_string();
    *buffer = rest;
    owned
}

/// The command echo the modem sends back before `ATE0` takes effect
fn is_echo(line: &str, command: &str) -> bool {
    line.trim() == command.trim_end_matches(['\r', '\n'])
}

enum Step {
    Req(Option<CmdRequest>),
    Data(Option<Vec<u8>>),
}

/// Run the AT engine until both input channels close
pub async fn run_at_engine(
    mut req_rx: mpsc::Receiver<CmdRequest>,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    writer: AtWriter,
    urc_tx: mpsc::Sender<String>,
) {
    let mut buffer = String::new();
    info!("AT engine started");

    loop {
        let step = tokio::select! {
            req = req_rx.recv() => Step::Req(req),
            data = data_rx.recv() => Step::Data(data),
        };

        match step {
            Step::Req(None) => break,
            Step::Req(Some(req)) => {
                let result = execute(&mut buffer, &mut data_rx, &writer, &urc_tx, &req).await;
                let _ = req.done.send(result);
            }
            Step::Data(None) => break,
            Step::Data(Some(data)) => {
                buffer.push_str(&String::from_utf8_lossy(&data));
                for line in drain_lines(&mut buffer) {
                    let _ = urc_tx.send(line).await;
                }
            }
        }
    }

    info!("AT engine stopped");
}

/// Run one command exchange to completion
async fn execute(
    buffer: &mut String,
    data_rx: &mut mpsc::Receiver<Vec<u8>>,
    writer: &AtWriter,
    urc_tx: &mpsc::Sender<String>,
    req: &CmdRequest,
) -> Result<CmdResult, LinkError> {
    // Whatever is buffered predates this command; it belongs to the
    // idle stream
    for line in drain_lines(buffer) {
        let _ = urc_tx.send(line).await;
    }
    buffer.clear();

    debug!(command = %req.command, "-> modem");
    writer.write(&req.command).await?;

    let deadline = Instant::now() + req.timeout;
    let mut lines: Vec<String> = Vec::new();
    let mut echo_dropped = false;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!(command = %req.command, "command timed out");
            return Ok(CmdResult {
                code: CmdCode::Timeout,
                lines,
                error: None,
            });
        }

        let data = match tokio::time::timeout(remaining, data_rx.recv()).await {
            Ok(Some(data)) => data,
            Ok(None) => return Err(LinkError::PortClosed),
            Err(_) => {
                debug!(command = %req.command, "command timed out");
                return Ok(CmdResult {
                    code: CmdCode::Timeout,
                    lines,
                    error: None,
                });
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&data));
        let batch = drain_lines(buffer);

        for (i, line) in batch.iter().enumerate() {
            // Terminal tokens take precedence over anything else in
            // the batch; what follows one goes back to the idle scanner
            if let Some(token) = classify_terminal(line) {
                for leftover in &batch[i + 1..] {
                    let _ = urc_tx.send(leftover.clone()).await;
                }
                let (code, error) = match token {
                    TerminalToken::Ok => (CmdCode::Ok, None),
                    TerminalToken::Error => (CmdCode::Error, None),
                    TerminalToken::Cme(e) => (CmdCode::Error, Some(AtError::Equipment(e))),
                    TerminalToken::Cms(e) => (CmdCode::Error, Some(AtError::Network(e))),
                };
                debug!(command = %req.command, ?code, "<- modem");
                return Ok(CmdResult { code, lines, error });
            }

            if !echo_dropped && is_echo(line, &req.command) {
                echo_dropped = true;
                continue;
            }

            // An unsolicited line interleaved with the response is
            // diverted, never collected as response payload
            if UrcKind::classify(line) != UrcKind::NotHandled {
                let _ = urc_tx.send(line.clone()).await;
                continue;
            }

            lines.push(line.clone());
            if req.min_response_lines > 0 && lines.len() >= req.min_response_lines {
                for leftover in &batch[i + 1..] {
                    let _ = urc_tx.send(leftover.clone()).await;
                }
                return Ok(CmdResult {
                    code: CmdCode::Tokens,
                    lines,
                    error: None,
                });
            }
        }
    }
}

/// Classify URC lines and track boot progress
///
/// Receives complete lines from the AT engine (idle bytes, leftovers)
/// and from the notifications channel, emits URC events, and fires
/// [`LinkEvent::ModemReady`] once the boot set completes.
pub async fn run_urc_scanner(
    mut urc_rx: mpsc::Receiver<String>,
    event_tx: mpsc::Sender<LinkEvent>,
) {
    let mut ready = ReadySet::new();

    while let Some(line) = urc_rx.recv().await {
        let kind = UrcKind::classify(&line);
        if kind == UrcKind::NotHandled {
            debug!("unhandled line: {}", line);
            continue;
        }
        if kind == UrcKind::Fota {
            let _ = event_tx
                .send(LinkEvent::FotaProgress(line.clone()))
                .await;
        }
        let _ = event_tx.send(LinkEvent::Urc { kind, line }).await;
        if ready.observe(kind) {
            info!("boot URC set complete, modem is operational");
            let _ = event_tx.send(LinkEvent::ModemReady).await;
        }
    }
}

/// Feed a byte-chunk channel (a notification DLCI sink) into the URC
/// scanner as complete lines
pub async fn run_line_splitter(
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    urc_tx: mpsc::Sender<String>,
) {
    let mut buffer = String::new();
    while let Some(data) = data_rx.recv().await {
        buffer.push_str(&String::from_utf8_lossy(&data));
        for line in drain_lines(&mut buffer) {
            if urc_tx.send(line).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_lines_keeps_fragment() {
        let mut buffer = "\r\nRDY\r\n+CFUN: 1\r\n+CPI".to_string();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["RDY", "+CFUN: 1"]);
        assert_eq!(buffer, "+CPI");
    }

    #[test]
    fn echo_matches_with_and_without_terminator() {
        assert!(is_echo("AT+CSQ", "AT+CSQ"));
        assert!(is_echo("AT+CSQ", "AT+CSQ\r"));
        assert!(!is_echo("+CSQ: 23,0", "AT+CSQ"));
    }

    #[tokio::test]
    async fn urc_scanner_fires_modem_ready_once() {
        let (urc_tx, urc_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(32);
        tokio::spawn(run_urc_scanner(urc_rx, event_tx));

        for line in [
            "RDY",
            "+CFUN: 1",
            "+CPIN: READY",
            "+QIND: SMS DONE",
            "+QIND: PB DONE",
            "+QIND: PB DONE",
        ] {
            urc_tx.send(line.to_string()).await.unwrap();
        }
        drop(urc_tx);

        let mut ready_count = 0;
        let mut urc_count = 0;
        while let Some(event) = event_rx.recv().await {
            match event {
                LinkEvent::ModemReady => ready_count += 1,
                LinkEvent::Urc { .. } => urc_count += 1,
                _ => {}
            }
        }
        assert_eq!(ready_count, 1, "ready fires exactly once");
        assert_eq!(urc_count, 6);
    }

    #[tokio::test]
    async fn fota_lines_forwarded_verbatim() {
        let (urc_tx, urc_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        tokio::spawn(run_urc_scanner(urc_rx, event_tx));

        urc_tx
            .send("+QIND: \"FOTA\",\"HTTPEND\",0".to_string())
            .await
            .unwrap();
        drop(urc_tx);

        let event = event_rx.recv().await.unwrap();
        match event {
            LinkEvent::FotaProgress(line) => {
                assert_eq!(line, "+QIND: \"FOTA\",\"HTTPEND\",0");
            }
            other => panic!("expected FotaProgress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn line_splitter_reassembles_across_chunks() {
        let (data_tx, data_rx) = mpsc::channel(16);
        let (urc_tx, mut urc_rx) = mpsc::channel(16);
        tokio::spawn(run_line_splitter(data_rx, urc_tx));

        data_tx.send(b"\r\n+QIND: SMS".to_vec()).await.unwrap();
        data_tx.send(b" DONE\r\n".to_vec()).await.unwrap();
        drop(data_tx);

        assert_eq!(urc_rx.recv().await.unwrap(), "+QIND: SMS DONE");
    }
}
