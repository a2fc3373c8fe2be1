//! Simulated modem actor
//!
//! Runs on the far end of any async byte stream (usually one half of a
//! `tokio::io::duplex()` pair) and behaves like a cellular module:
//! plain AT dialog with echo, boot URCs, a CMUX state switch, and
//! per-DLCI handling in multiplexed mode.
//!
//! The simulation models the one physical property the bring-up code
//! exists to handle: a baud mismatch. The modem listens at a fixed
//! rate; while the host's configured rate (observed through a shared
//! atomic) differs, everything the host sends is ignored and nothing
//! is transmitted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modem_protocol::{mux_ctrl, Frame, FrameCodec, FrameType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Commands for a running simulated modem
#[derive(Debug)]
pub enum SimCommand {
    /// Deliver an unsolicited line to the host (raw in plain mode, on
    /// the notifications DLCI in multiplexed mode)
    InjectUrc(String),
    /// Assert or release flow control with an MSC frame (multiplexed
    /// mode only)
    SetFlow { off: bool },
    /// Stop the simulation task
    Shutdown,
}

/// Handle to a running simulated modem
#[derive(Clone)]
pub struct SimHandle {
    cmd_tx: mpsc::Sender<SimCommand>,
}

impl SimHandle {
    pub async fn inject_urc(&self, line: impl Into<String>) {
        let _ = self.cmd_tx.send(SimCommand::InjectUrc(line.into())).await;
    }

    pub async fn set_flow(&self, off: bool) {
        let _ = self.cmd_tx.send(SimCommand::SetFlow { off }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SimCommand::Shutdown).await;
    }
}

/// Configuration for a simulated modem
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SimConfig {
    /// Line speed the modem listens at
    pub baud: u32,
    /// Start with the multiplexer already enabled, as if a previous
    /// host session never closed it down
    pub start_in_cmux: bool,
    /// Emit the boot URC sequence shortly after starting
    pub boot_urcs: bool,
    /// Answer nothing at all (dead modem)
    pub mute: bool,
    /// Report no SIM: `AT+CPIN?` answers `+CME ERROR: 10`
    pub sim_absent: bool,
    /// Reject `AT+QSCLK=1` this many times before accepting, modeling
    /// a modem not ready for sleep configuration right after reset
    pub sleep_rejections: u32,
    /// RSSI reported by `AT+CSQ`
    pub rssi: u8,
    /// Digital audio interface profile reported by `AT+QDAI?`;
    /// `AT+QDAI=` writes replace it
    pub qdai: String,
    /// Delay before each reply
    pub reply_delay: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            start_in_cmux: false,
            boot_urcs: false,
            mute: false,
            sim_absent: false,
            sleep_rejections: 0,
            rssi: 23,
            qdai: "1,0,0,4,0,0,1,1".to_string(),
            reply_delay: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimMode {
    Plain,
    Cmux,
}

/// The simulated modem actor
pub struct SimModem<S> {
    io: S,
    config: SimConfig,
    host_speed: Arc<AtomicU32>,
    mode: SimMode,
    echo: bool,
    codec: FrameCodec,
    /// Accumulating plain-mode (or per-frame DLCI 2) command line
    line: String,
    sleep_rejections_left: u32,
}

enum Step {
    Cmd(Option<SimCommand>),
    Read(std::io::Result<usize>, Vec<u8>),
}

impl<S> SimModem<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn a simulated modem on the far end of `io`. `host_speed` is
    /// the shared atomic published by the host's transport; replies
    /// flow only while it matches the modem's configured rate.
    pub fn spawn(io: S, config: SimConfig, host_speed: Arc<AtomicU32>) -> SimHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let mode = if config.start_in_cmux {
            SimMode::Cmux
        } else {
            SimMode::Plain
        };
        let modem = SimModem {
            io,
            sleep_rejections_left: config.sleep_rejections,
            config,
            host_speed,
            mode,
            echo: true,
            codec: FrameCodec::new(),
            line: String::new(),
        };
        tokio::spawn(modem.run(cmd_rx));
        SimHandle { cmd_tx }
    }

    fn speed_matches(&self) -> bool {
        self.host_speed.load(Ordering::SeqCst) == self.config.baud
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SimCommand>) {
        if self.config.boot_urcs {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for urc in [
                "RDY",
                "+CFUN: 1",
                "+CPIN: READY",
                "+QIND: SMS DONE",
                "+QIND: PB DONE",
            ] {
                self.send_urc(urc).await;
            }
        }

        loop {
            let mut buf = vec![0u8; 256];
            let step = tokio::select! {
                cmd = cmd_rx.recv() => Step::Cmd(cmd),
                res = self.io.read(&mut buf) => {
                    let res = res;
                    Step::Read(res, buf)
                }
            };

            match step {
                Step::Cmd(None) | Step::Cmd(Some(SimCommand::Shutdown)) => break,
                Step::Cmd(Some(SimCommand::InjectUrc(line))) => {
                    self.send_urc(&line).await;
                }
                Step::Cmd(Some(SimCommand::SetFlow { off })) => {
                    if self.mode == SimMode::Cmux {
                        let msc = Frame::uih(0, mux_ctrl::msc_message(2, off));
                        self.transmit(&msc.encode()).await;
                    }
                }
                Step::Read(Ok(0), _) | Step::Read(Err(_), _) => break,
                Step::Read(Ok(n), buf) => {
                    if !self.speed_matches() || self.config.mute {
                        // Wrong rate: the host's bytes are noise to us
                        continue;
                    }
                    self.handle_bytes(&buf[..n]).await;
                }
            }
        }
        debug!("simulated modem stopped");
    }

    async fn handle_bytes(&mut self, data: &[u8]) {
        match self.mode {
            SimMode::Plain => self.handle_plain(data).await,
            SimMode::Cmux => self.handle_framed(data).await,
        }
    }

    async fn handle_plain(&mut self, data: &[u8]) {
        self.line.push_str(&String::from_utf8_lossy(data));
        while let Some(pos) = self.line.find('\r') {
            let command: String = self.line[..pos].trim().to_string();
            self.line.drain(..=pos);
            if command.is_empty() {
                continue;
            }
            if self.echo {
                let echoed = format!("{}\r\n", command);
                self.transmit(echoed.as_bytes()).await;
            }
            let replies = self.respond(&command);
            let switch_to_cmux = command.to_ascii_uppercase().starts_with("AT+CMUX=");
            tokio::time::sleep(self.config.reply_delay).await;
            for reply in replies {
                let framed = format!("\r\n{}\r\n", reply);
                self.transmit(framed.as_bytes()).await;
            }
            if switch_to_cmux {
                debug!("simulated modem entering CMUX mode");
                self.mode = SimMode::Cmux;
                self.codec.clear();
            }
        }
    }

    async fn handle_framed(&mut self, data: &[u8]) {
        self.codec.push_bytes(data);
        while let Some(frame) = self.codec.next_frame() {
            match frame.frame_type {
                FrameType::Sabm => {
                    let ua = Frame::control(frame.dlci, FrameType::Ua, true);
                    self.transmit(&ua.encode()).await;
                }
                FrameType::Disc => {
                    let ua = Frame::control(frame.dlci, FrameType::Ua, true);
                    self.transmit(&ua.encode()).await;
                }
                FrameType::Uih | FrameType::Ui | FrameType::I => {
                    self.handle_payload(frame.dlci, &frame.payload).await;
                }
                FrameType::Ua | FrameType::Dm => {
                    debug!(dlci = frame.dlci, "ignoring response frame from host");
                }
            }
        }
    }

    async fn handle_payload(&mut self, dlci: u8, payload: &[u8]) {
        match dlci {
            0 => {
                if mux_ctrl::is_cld(payload) {
                    debug!("close-down received, leaving CMUX mode");
                    // CLD response: same message with C/R cleared
                    let reply = Frame::uih(0, vec![mux_ctrl::CLD & !0x02, 0x01]);
                    self.transmit(&reply.encode()).await;
                    self.mode = SimMode::Plain;
                    self.line.clear();
                } else if let Some((msc_dlci, _)) = mux_ctrl::parse_msc(payload) {
                    // Only the command form gets a response; the host's
                    // response to our own MSC ends the exchange
                    if payload.first() == Some(&mux_ctrl::MSC) {
                        debug!(dlci = msc_dlci, "MSC from host, echoing response");
                        let reply = Frame::uih(0, mux_ctrl::msc_response(payload));
                        self.transmit(&reply.encode()).await;
                    }
                } else {
                    warn!("unrecognized control payload: {:02X?}", payload);
                }
            }
            2 => {
                // AT dialog behind the commands DLCI; no echo here,
                // CMUX is only ever entered after ATE0
                let text = String::from_utf8_lossy(payload).to_string();
                self.line.push_str(&text);
                while let Some(pos) = self.line.find('\r') {
                    let command: String = self.line[..pos].trim().to_string();
                    self.line.drain(..=pos);
                    if command.is_empty() {
                        continue;
                    }
                    let replies = self.respond(&command);
                    tokio::time::sleep(self.config.reply_delay).await;
                    for reply in replies {
                        let framed = format!("\r\n{}\r\n", reply);
                        let frame = Frame::uih(2, framed.into_bytes());
                        self.transmit(&frame.encode()).await;
                    }
                }
            }
            3 => {
                // Bulk data channel loops back
                let frame = Frame::uih(3, payload.to_vec());
                self.transmit(&frame.encode()).await;
            }
            other => {
                debug!(dlci = other, "ignoring payload");
            }
        }
    }

    /// The modem's AT command table
    fn respond(&mut self, command: &str) -> Vec<String> {
        let upper = command.to_ascii_uppercase();
        match upper.as_str() {
            "AT" => vec!["OK".to_string()],
            "ATE0" => {
                self.echo = false;
                vec!["OK".to_string()]
            }
            "AT&F" => {
                // Factory defaults re-enable echo
                self.echo = true;
                vec!["OK".to_string()]
            }
            "AT+QGMR" => vec!["EC25EFAR06A03M4G".to_string(), "OK".to_string()],
            "AT+CSQ" => vec![format!("+CSQ: {},99", self.config.rssi), "OK".to_string()],
            "AT+CPIN?" => {
                if self.config.sim_absent {
                    vec!["+CME ERROR: 10".to_string()]
                } else {
                    vec!["+CPIN: READY".to_string(), "OK".to_string()]
                }
            }
            "AT+QSCLK=1" => {
                if self.sleep_rejections_left > 0 {
                    self.sleep_rejections_left -= 1;
                    vec!["ERROR".to_string()]
                } else {
                    vec!["OK".to_string()]
                }
            }
            "AT+QDAI?" => vec![format!("+QDAI: {}", self.config.qdai), "OK".to_string()],
            _ if upper.starts_with("AT+QDAI=") => {
                // Profile writes persist like the real module's NV storage
                self.config.qdai = command["AT+QDAI=".len()..].trim().to_string();
                vec!["OK".to_string()]
            }
            _ if upper.starts_with("AT+CMUX=") => vec!["OK".to_string()],
            _ if upper.starts_with("AT+IFC=")
                || upper.starts_with("AT+CMEE=")
                || upper.starts_with("AT+QURCCFG=")
                || upper.starts_with("AT+QINDCFG=")
                || upper.starts_with("AT+CFUN=")
                || upper.starts_with("AT+CLVL=")
                || upper.starts_with("AT+QMIC=")
                || upper.starts_with("AT+QRXGAIN=")
                || upper.starts_with("AT+QEEC=") =>
            {
                vec!["OK".to_string()]
            }
            _ => vec!["ERROR".to_string()],
        }
    }

    async fn send_urc(&mut self, line: &str) {
        match self.mode {
            SimMode::Plain => {
                let framed = format!("\r\n{}\r\n", line);
                self.transmit(framed.as_bytes()).await;
            }
            SimMode::Cmux => {
                let framed = format!("\r\n{}\r\n", line);
                let frame = Frame::uih(1, framed.into_bytes());
                self.transmit(&frame.encode()).await;
            }
        }
    }

    /// Write to the host, but only if it would hear us at the current
    /// rate
    async fn transmit(&mut self, data: &[u8]) {
        if !self.speed_matches() || self.config.mute {
            return;
        }
        if let Err(e) = self.io.write_all(data).await {
            debug!("host side gone: {}", e);
        }
        let _ = self.io.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(config: SimConfig) -> (tokio::io::DuplexStream, SimHandle, Arc<AtomicU32>) {
        let (host, modem) = tokio::io::duplex(4096);
        let speed = Arc::new(AtomicU32::new(115_200));
        let handle = SimModem::spawn(modem, config, Arc::clone(&speed));
        (host, handle, speed)
    }

    async fn exchange(host: &mut tokio::io::DuplexStream, command: &str) -> String {
        host.write_all(command.as_bytes()).await.unwrap();
        let mut buf = [0u8; 512];
        let mut out = String::new();
        // Collect replies until the stream goes quiet
        loop {
            match tokio::time::timeout(Duration::from_millis(100), host.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => out.push_str(&String::from_utf8_lossy(&buf[..n])),
                _ => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn plain_at_echoes_and_replies_ok() {
        let (mut host, _handle, _speed) = start(SimConfig::default()).await;
        let reply = exchange(&mut host, "AT\r").await;
        assert!(reply.contains("AT\r\n"), "echo expected: {:?}", reply);
        assert!(reply.contains("\r\nOK\r\n"));
    }

    #[tokio::test]
    async fn ate0_disables_echo() {
        let (mut host, _handle, _speed) = start(SimConfig::default()).await;
        exchange(&mut host, "ATE0\r").await;
        let reply = exchange(&mut host, "AT\r").await;
        assert!(!reply.contains("AT\r\n"), "no echo after ATE0: {:?}", reply);
        assert!(reply.contains("OK"));
    }

    #[tokio::test]
    async fn silent_while_baud_mismatched() {
        let config = SimConfig {
            baud: 460_800,
            ..SimConfig::default()
        };
        let (mut host, _handle, speed) = start(config).await;

        let reply = exchange(&mut host, "AT\r").await;
        assert!(reply.is_empty(), "modem must not hear us at 115200");

        speed.store(460_800, Ordering::SeqCst);
        let reply = exchange(&mut host, "AT\r").await;
        assert!(reply.contains("OK"));
    }

    #[tokio::test]
    async fn cmux_enable_switches_to_frame_mode() {
        let (mut host, _handle, _speed) = start(SimConfig::default()).await;
        exchange(&mut host, "ATE0\r").await;
        let reply = exchange(&mut host, "AT+CMUX=0,0,5,127,10,3,30,10,2\r").await;
        assert!(reply.contains("OK"));

        // SABM on DLCI 0 now gets a UA frame back
        let sabm = Frame::control(0, FrameType::Sabm, true);
        host.write_all(&sabm.encode()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_millis(200), host.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let mut codec = FrameCodec::new();
        codec.push_bytes(&buf[..n]);
        let frame = codec.next_frame().expect("a complete UA frame");
        assert_eq!(frame.frame_type, FrameType::Ua);
        assert_eq!(frame.dlci, 0);
    }

    #[tokio::test]
    async fn stuck_in_cmux_recovers_on_close_down() {
        let config = SimConfig {
            start_in_cmux: true,
            ..SimConfig::default()
        };
        let (mut host, _handle, _speed) = start(config).await;

        // Plain probes go unanswered with something useful
        let reply = exchange(&mut host, "AT\r").await;
        assert!(!reply.contains("OK"), "framed mode must not answer plain AT");

        // Close-down drops it back to plain AT
        let cld = Frame::uih(0, mux_ctrl::cld_message());
        host.write_all(&cld.encode()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Drain the CLD response frame
        let mut buf = [0u8; 64];
        let _ = tokio::time::timeout(Duration::from_millis(100), host.read(&mut buf)).await;

        let reply = exchange(&mut host, "AT\r").await;
        assert!(reply.contains("OK"), "plain AT after close-down: {:?}", reply);
    }

    #[tokio::test]
    async fn sleep_enable_rejected_then_accepted() {
        let config = SimConfig {
            sleep_rejections: 2,
            ..SimConfig::default()
        };
        let (mut host, _handle, _speed) = start(config).await;
        exchange(&mut host, "ATE0\r").await;

        assert!(exchange(&mut host, "AT+QSCLK=1\r").await.contains("ERROR"));
        assert!(exchange(&mut host, "AT+QSCLK=1\r").await.contains("ERROR"));
        assert!(exchange(&mut host, "AT+QSCLK=1\r").await.contains("OK"));
    }
}
