//! Multi-phase modem bring-up
//!
//! Takes a freshly powered (or wedged) modem from an unknown state to a
//! fully configured multiplexed link:
//!
//! 1. Baud detection: probe candidate line speeds with a bare `AT`,
//!    transmitting a CMUX close-down first where a previous run may
//!    have left the multiplexer enabled.
//! 2. Modem configuration: flow control off, factory defaults, echo
//!    off, firmware query, the init batch, then sleep-mode enable with
//!    a bounded retry.
//! 3. CMUX negotiation: `AT+CMUX`, mode switch, SABM handshakes for
//!    all four channels, the URC redirect onto the notifications
//!    channel, and a verification probe over the commands DLCI.
//! 4. Audio path and echo-canceller tuning.
//!
//! An audio provisioning write signals that the modem needs a restart;
//! the orchestrator restarts it once and redoes the whole sequence.
//! Every other phase failure is surfaced to the caller directly.

use std::time::Duration;

use modem_protocol::{mux_ctrl, Frame};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::at::{run_line_splitter, AtChannel, CmdResult};
use crate::channel::ChannelKind;
use crate::error::LinkError;
use crate::events::LinkEvent;
use crate::port::{LinkHandle, LinkMode};
use crate::transport::DEFAULT_BAUD;

/// Phase of the bring-up state machine, reported through
/// [`LinkEvent::BringupState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BringupState {
    DetectingBaud,
    ConfiguringModem,
    ConfiguringCmux,
    EnablingMux,
    TuningAudio,
    Ready,
    Failed,
}

/// Multiplexer negotiation parameters (the `AT+CMUX` arguments).
/// Timers are in the protocol's 10ms units.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CmuxParams {
    /// N1, maximum frame payload size
    pub max_frame_size: u16,
    /// T1, acknowledgement timer
    pub ack_timer_10ms: u8,
    /// N2, maximum retransmission count
    pub max_retransmissions: u8,
    /// T2, response timer for mux control
    pub response_timer_10ms: u8,
    /// T3, wake-up response timer in seconds
    pub wake_timer_s: u8,
    /// k, window size
    pub window_size: u8,
}

impl Default for CmuxParams {
    fn default() -> Self {
        Self {
            max_frame_size: 127,
            ack_timer_10ms: 10,
            max_retransmissions: 3,
            response_timer_10ms: 30,
            wake_timer_s: 10,
            window_size: 2,
        }
    }
}

impl CmuxParams {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timer_10ms as u64 * 10)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timer_10ms as u64 * 10)
    }

    /// The `AT+CMUX` command enabling basic mode at the given speed
    pub fn enable_command(&self, baud: u32) -> String {
        format!(
            "AT+CMUX=0,0,{},{},{},{},{},{},{}",
            speed_code(baud),
            self.max_frame_size,
            self.ack_timer_10ms,
            self.max_retransmissions,
            self.response_timer_10ms,
            self.wake_timer_s,
            self.window_size,
        )
    }
}

/// Port speed code for `AT+CMUX`
fn speed_code(baud: u32) -> u8 {
    match baud {
        9_600 => 1,
        19_200 => 2,
        38_400 => 3,
        57_600 => 4,
        115_200 => 5,
        230_400 => 6,
        460_800 => 7,
        _ => 5,
    }
}

/// Echo-canceller tuning presets for the voice path
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EchoStrength {
    LeastAggressive,
    Medium,
    Aggressive,
    /// Hand-tuned values for the reference hardware
    Tuned,
}

impl EchoStrength {
    /// The parameter writes applied for this preset
    fn commands(&self) -> Vec<String> {
        match self {
            EchoStrength::LeastAggressive => vec![
                "AT+QEEC=0,1".to_string(),
                "AT+QEEC=5,20000".to_string(),
                "AT+QEEC=10,160".to_string(),
            ],
            EchoStrength::Medium => vec![
                "AT+QEEC=0,1".to_string(),
                "AT+QEEC=5,40000".to_string(),
                "AT+QEEC=10,200".to_string(),
                "AT+QEEC=21,20000".to_string(),
            ],
            EchoStrength::Aggressive => vec![
                "AT+QEEC=0,1".to_string(),
                "AT+QEEC=5,65535".to_string(),
                "AT+QEEC=10,255".to_string(),
                "AT+QEEC=21,40000".to_string(),
                "AT+QEEC=22,300".to_string(),
            ],
            EchoStrength::Tuned => vec![
                "AT+QEEC=0,1".to_string(),
                "AT+QEEC=5,57000".to_string(),
                "AT+QEEC=10,213".to_string(),
                "AT+QEEC=21,26000".to_string(),
                "AT+QEEC=22,260".to_string(),
                "AT+QEEC=24,2".to_string(),
            ],
        }
    }
}

/// Configuration for the bring-up procedure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BringupConfig {
    /// Per-candidate timeout for the bare `AT` probe
    pub probe_timeout: Duration,
    /// Wall-clock budget for the whole baud detection phase
    pub detect_deadline: Duration,
    /// Timeout for ordinary configuration commands
    pub command_timeout: Duration,
    /// Retry interval for the sleep-mode enable command
    pub sleep_retry_interval: Duration,
    /// Wall-clock budget for the sleep-mode enable retries
    pub sleep_retry_budget: Duration,
    pub cmux: CmuxParams,
    pub echo: EchoStrength,
    /// Init batch applied after factory reset and echo-off
    pub init_commands: Vec<String>,
    /// Points unsolicited output at the port the notifications channel
    /// rides on. Issued over the commands channel once the
    /// notifications channel is open; skipped when `None`.
    pub urc_redirect: Option<String>,
    /// Digital audio interface profile command. Skipped when `None`;
    /// otherwise the current profile is queried and this command is
    /// written only on mismatch (one-time provisioning, needs a modem
    /// restart to take effect).
    pub audio_interface: Option<String>,
    /// Gain/volume/microphone commands applied once the audio
    /// interface profile matches
    pub audio_commands: Vec<String>,
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(500),
            detect_deadline: Duration::from_secs(10),
            command_timeout: Duration::from_secs(2),
            sleep_retry_interval: Duration::from_secs(1),
            sleep_retry_budget: Duration::from_secs(10),
            cmux: CmuxParams::default(),
            echo: EchoStrength::Medium,
            init_commands: vec![
                "AT+CMEE=1".to_string(),
                "AT+QINDCFG=\"all\",1".to_string(),
                "AT+CFUN=1".to_string(),
            ],
            urc_redirect: Some("AT+QURCCFG=\"urcport\",\"uart1\"".to_string()),
            audio_interface: Some("AT+QDAI=1,0,0,4,0,0,1,1".to_string()),
            audio_commands: vec![
                "AT+CLVL=3".to_string(),
                "AT+QMIC=2,10".to_string(),
                "AT+QRXGAIN=20000".to_string(),
            ],
        }
    }
}

/// What a successful bring-up hands back to the application
#[derive(Debug)]
pub struct LinkChannels {
    /// Line speed communication was established at
    pub baud: u32,
    /// Consumer side of the bulk data channel
    pub data_rx: mpsc::Receiver<Vec<u8>>,
}

/// Candidate line speeds in probe order. The `true` entries retransmit
/// a close-down frame first, for a modem left multiplexed by a
/// previous run that would otherwise never answer a plain probe.
const BAUD_CANDIDATES: [(u32, bool); 4] = [
    (460_800, false),
    (460_800, true),
    (115_200, false),
    (115_200, true),
];

/// Run the full bring-up. When a phase reports that the modem needs a
/// restart (one-time provisioning), the modem is restarted once and
/// the whole sequence redone; every other failure is returned as is.
pub async fn run(
    handle: &LinkHandle,
    at: &AtChannel,
    config: &BringupConfig,
    event_tx: &mpsc::Sender<LinkEvent>,
) -> Result<LinkChannels, LinkError> {
    handle.power_up().await?;

    let mut attempted_reset = false;
    loop {
        match attempt(handle, at, config, event_tx).await {
            Ok(channels) => {
                set_state(event_tx, BringupState::Ready).await;
                return Ok(channels);
            }
            Err(e) if !attempted_reset && needs_reset(&e) => {
                warn!("bring-up failed ({}), restarting modem for one redo", e);
                attempted_reset = true;
                handle.set_mode(LinkMode::Plain).await?;
                handle.restart().await?;
            }
            Err(e) => {
                set_state(event_tx, BringupState::Failed).await;
                return Err(e);
            }
        }
    }
}

fn needs_reset(err: &LinkError) -> bool {
    matches!(err, LinkError::ModemNeedsReset)
}

async fn attempt(
    handle: &LinkHandle,
    at: &AtChannel,
    config: &BringupConfig,
    event_tx: &mpsc::Sender<LinkEvent>,
) -> Result<LinkChannels, LinkError> {
    set_state(event_tx, BringupState::DetectingBaud).await;
    let baud = baud_detect_procedure(handle, at, config).await?;
    info!(baud, "modem answering");

    set_state(event_tx, BringupState::ConfiguringModem).await;
    conf_procedure(at, config).await?;

    set_state(event_tx, BringupState::ConfiguringCmux).await;
    require_ok(at, &config.cmux.enable_command(baud), config.command_timeout).await?;

    set_state(event_tx, BringupState::EnablingMux).await;
    let channels = start_multiplexer(handle, at, config, baud).await?;

    set_state(event_tx, BringupState::TuningAudio).await;
    audio_conf_procedure(at, config).await?;

    let rssi = signal_quality(at, config).await?;
    let _ = event_tx.send(LinkEvent::SignalQuality { rssi }).await;

    Ok(channels)
}

/// One pass over the candidate speeds. `Ok(None)` means nothing
/// answered this pass.
async fn baud_detect_once(
    handle: &LinkHandle,
    at: &AtChannel,
    config: &BringupConfig,
) -> Result<Option<u32>, LinkError> {
    for (baud, exit_cmux) in BAUD_CANDIDATES {
        debug!(baud, exit_cmux, "probing");
        handle.set_speed(baud).await?;
        if exit_cmux {
            let cld = Frame::uih(0, mux_ctrl::cld_message()).encode();
            handle.write(cld).await?;
            // give the modem a moment to drop out of mux mode
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let probe = at.cmd("AT", config.probe_timeout).await?;
        if probe.is_ok() {
            return Ok(Some(baud));
        }
    }
    Ok(None)
}

/// Retry [`baud_detect_once`] until the wall-clock deadline. On
/// exhaustion the transport is left at the default speed.
async fn baud_detect_procedure(
    handle: &LinkHandle,
    at: &AtChannel,
    config: &BringupConfig,
) -> Result<u32, LinkError> {
    let deadline = Instant::now() + config.detect_deadline;
    loop {
        if let Some(baud) = baud_detect_once(handle, at, config).await? {
            return Ok(baud);
        }
        if Instant::now() >= deadline {
            handle.set_speed(DEFAULT_BAUD).await?;
            return Err(LinkError::ModemNotResponding);
        }
    }
}

/// Sequential modem configuration. Any failed command aborts, so a
/// half-applied configuration is never left behind silently.
async fn conf_procedure(at: &AtChannel, config: &BringupConfig) -> Result<(), LinkError> {
    require_ok(at, "AT+IFC=0,0", config.command_timeout).await?;
    require_ok(at, "AT&F", config.command_timeout).await?;
    require_ok(at, "ATE0", config.command_timeout).await?;

    let fw = at.cmd("AT+QGMR", config.command_timeout).await?;
    if !fw.is_ok() {
        return Err(config_failure("modem-config", "AT+QGMR", &fw));
    }
    if let Some(version) = fw.first_line() {
        info!("modem firmware: {}", version);
    }

    for cmd in &config.init_commands {
        require_ok(at, cmd, config.command_timeout).await?;
    }

    // The modem may refuse sleep configuration right after a reset;
    // retry on a fixed interval within the budget
    let deadline = Instant::now() + config.sleep_retry_budget;
    loop {
        let result = at.cmd("AT+QSCLK=1", config.command_timeout).await?;
        if result.is_ok() {
            return Ok(());
        }
        if Instant::now() + config.sleep_retry_interval > deadline {
            return Err(config_failure("sleep-enable", "AT+QSCLK=1", &result));
        }
        debug!("sleep enable refused, retrying");
        tokio::time::sleep(config.sleep_retry_interval).await;
    }
}

/// Switch to multiplexed mode and establish all four channels
async fn start_multiplexer(
    handle: &LinkHandle,
    at: &AtChannel,
    config: &BringupConfig,
    baud: u32,
) -> Result<LinkChannels, LinkError> {
    handle.set_mode(LinkMode::Multiplexed).await?;

    // Control channel first; its traffic never reaches a consumer, the
    // router handles it internally
    let (ctrl_tx, mut ctrl_rx) = mpsc::channel(4);
    handle
        .open_channel(ChannelKind::Control, ctrl_tx, &config.cmux)
        .await?;
    tokio::spawn(async move { while ctrl_rx.recv().await.is_some() {} });

    handle
        .open_channel(ChannelKind::Commands, handle.at_sink(), &config.cmux)
        .await?;

    let (notif_tx, notif_rx) = mpsc::channel(64);
    handle
        .open_channel(ChannelKind::Notifications, notif_tx, &config.cmux)
        .await?;
    tokio::spawn(run_line_splitter(notif_rx, handle.urc_sink()));

    // With the notifications channel established, point unsolicited
    // output at it
    if let Some(redirect) = &config.urc_redirect {
        require_ok(at, redirect, config.command_timeout).await?;
    }

    let (data_tx, data_rx) = mpsc::channel(64);
    handle
        .open_channel(ChannelKind::Data, data_tx, &config.cmux)
        .await?;

    // Verify the AT dialog survived the mode switch
    let probe = at.cmd("AT", config.command_timeout).await?;
    if !probe.is_ok() {
        return Err(config_failure("mux-verify", "AT", &probe));
    }

    info!("multiplexer up, all channels open");
    Ok(LinkChannels { baud, data_rx })
}

/// Audio path and echo-canceller configuration
///
/// The digital audio interface profile survives resets, so it is
/// queried first. On mismatch the profile is written and the attempt
/// reports [`LinkError::ModemNeedsReset`]: the write is one-time
/// factory provisioning that only takes effect after a modem restart,
/// which the redo in [`run`] performs.
async fn audio_conf_procedure(at: &AtChannel, config: &BringupConfig) -> Result<(), LinkError> {
    if let Some(dai) = &config.audio_interface {
        let expected = dai.strip_prefix("AT+QDAI=").unwrap_or(dai.as_str());
        let reply = at.cmd("AT+QDAI?", config.command_timeout).await?;
        let current = reply
            .lines
            .iter()
            .find_map(|line| line.trim().strip_prefix("+QDAI:"))
            .map(str::trim);
        if !reply.is_ok() || current != Some(expected) {
            info!(
                current = current.unwrap_or("<none>"),
                expected, "provisioning digital audio interface"
            );
            require_ok(at, dai, config.command_timeout).await?;
            return Err(LinkError::ModemNeedsReset);
        }
    }
    for cmd in &config.audio_commands {
        require_ok(at, cmd, config.command_timeout).await?;
    }
    for cmd in config.echo.commands() {
        require_ok(at, &cmd, config.command_timeout).await?;
    }
    Ok(())
}

/// End-to-end probe: query signal strength over the established link.
/// An unparsable reply reports the "unknown" RSSI value rather than
/// failing bring-up.
async fn signal_quality(at: &AtChannel, config: &BringupConfig) -> Result<u8, LinkError> {
    let result = at.cmd("AT+CSQ", config.command_timeout).await?;
    let rssi = result
        .lines
        .iter()
        .find_map(|line| parse_csq(line))
        .unwrap_or(99);
    Ok(rssi)
}

fn parse_csq(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix("+CSQ:")?;
    rest.split(',').next()?.trim().parse().ok()
}

async fn require_ok(
    at: &AtChannel,
    command: &str,
    timeout: Duration,
) -> Result<(), LinkError> {
    let result = at.cmd(command, timeout).await?;
    if result.is_ok() {
        Ok(())
    } else {
        Err(config_failure("modem-config", command, &result))
    }
}

fn config_failure(phase: &'static str, command: &str, result: &CmdResult) -> LinkError {
    let detail = match &result.error {
        Some(e) => format!("{} -> {}", command, e),
        None => format!("{} -> {:?}", command, result.code),
    };
    LinkError::ConfigurationFailure { phase, detail }
}

async fn set_state(event_tx: &mpsc::Sender<LinkEvent>, state: BringupState) {
    debug!(?state, "bring-up phase");
    let _ = event_tx.send(LinkEvent::BringupState(state)).await;
}
