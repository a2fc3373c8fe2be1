//! Link worker and handle
//!
//! A single spawned task owns the physical transport. It alternates
//! between draining the command queue and polling the transport for
//! bytes, so frame reconstruction never races with itself and every
//! write goes out in command order.
//!
//! In plain mode incoming bytes are forwarded to the AT engine. In
//! multiplexed mode they run through the frame codec and the channel
//! router. Mode changes, speed changes, channel handshakes and the
//! modem power controls all arrive as [`PortCommand`]s through the
//! cloneable [`LinkHandle`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use modem_protocol::{Frame, FrameCodec, FrameType};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::at::{run_at_engine, run_urc_scanner, AtChannel, AtWriter, CmdRequest};
use crate::bringup::CmuxParams;
use crate::channel::ChannelKind;
use crate::error::LinkError;
use crate::events::LinkEvent;
use crate::router::{ChannelRouter, HandshakeReply};
use crate::transport::{AntennaBand, ByteChannel, ReadChunk, ReadStatus, MAX_CHUNK_SIZE};

/// How the worker interprets incoming bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Raw AT dialog on the bare transport
    Plain,
    /// CMUX framing with per-DLCI routing
    Multiplexed,
}

/// Idle-poll timeout for the worker's top-level read. This is the one
/// intentionally long wait in the engine.
const READ_POLL: Duration = Duration::from_secs(10);

/// How long a writer blocks on flow-off before transmitting anyway
const FLOW_BLOCK: Duration = Duration::from_secs(2);

/// Commands processed by the link worker
#[derive(Debug)]
pub enum PortCommand {
    /// Transmit raw bytes
    Write {
        data: Vec<u8>,
        done: oneshot::Sender<io::Result<usize>>,
    },
    /// Change the transport line speed
    SetSpeed {
        bps: u32,
        done: oneshot::Sender<io::Result<()>>,
    },
    /// Switch between plain and multiplexed interpretation
    SetMode { mode: LinkMode },
    /// Send SABM for a channel and register `sink` once UA arrives
    OpenChannel {
        kind: ChannelKind,
        sink: mpsc::Sender<Vec<u8>>,
        done: oneshot::Sender<Result<HandshakeReply, LinkError>>,
    },
    /// Unregister a channel and send DISC; `done` resolves on UA
    CloseChannel {
        kind: ChannelKind,
        done: oneshot::Sender<()>,
    },
    PowerUp {
        done: oneshot::Sender<io::Result<()>>,
    },
    PowerDown {
        done: oneshot::Sender<io::Result<()>>,
    },
    Restart {
        done: oneshot::Sender<io::Result<()>>,
    },
    EnterSleep {
        done: oneshot::Sender<io::Result<()>>,
    },
    ExitSleep {
        done: oneshot::Sender<io::Result<()>>,
    },
    SelectAntenna {
        band: AntennaBand,
        done: oneshot::Sender<io::Result<()>>,
    },
    /// Stop the worker
    Shutdown,
}

struct PortWorker<C> {
    channel: C,
    codec: FrameCodec,
    router: ChannelRouter,
    mode: LinkMode,
    at_data_tx: mpsc::Sender<Vec<u8>>,
    event_tx: mpsc::Sender<LinkEvent>,
}

enum Step {
    Cmd(Option<PortCommand>),
    Read(io::Result<ReadChunk>),
}

impl<C: ByteChannel> PortWorker<C> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PortCommand>) {
        info!("link worker started");

        loop {
            let step = tokio::select! {
                cmd = cmd_rx.recv() => Step::Cmd(cmd),
                res = self.channel.read(MAX_CHUNK_SIZE, READ_POLL) => Step::Read(res),
            };

            match step {
                Step::Cmd(None) | Step::Cmd(Some(PortCommand::Shutdown)) => break,
                Step::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                Step::Read(Ok(chunk)) => self.handle_chunk(chunk).await,
                Step::Read(Err(e)) => {
                    warn!("transport read failed: {}", e);
                    let _ = self
                        .event_tx
                        .send(LinkEvent::Error {
                            source: "worker".to_string(),
                            message: format!("read failed: {}", e),
                        })
                        .await;
                    break;
                }
            }
        }

        info!("link worker stopped");
    }

    async fn handle_command(&mut self, cmd: PortCommand) {
        match cmd {
            PortCommand::Write { data, done } => {
                let _ = done.send(self.channel.write(&data).await);
            }
            PortCommand::SetSpeed { bps, done } => {
                let _ = done.send(self.channel.set_speed(bps).await);
            }
            PortCommand::SetMode { mode } => {
                if self.mode != mode {
                    debug!(?mode, "link mode changed");
                    self.codec.clear();
                    if mode == LinkMode::Plain {
                        self.router.reset();
                    }
                    self.mode = mode;
                }
            }
            PortCommand::OpenChannel { kind, sink, done } => {
                if self.mode != LinkMode::Multiplexed {
                    let _ = done.send(Err(LinkError::NotMultiplexed));
                    return;
                }
                if self.router.is_registered(kind) {
                    let _ = done.send(Err(LinkError::ChannelExists { kind }));
                    return;
                }
                let sabm = Frame::control(kind.dlci(), FrameType::Sabm, true);
                if let Err(e) = self.channel.write(&sabm.encode()).await {
                    let _ = done.send(Err(LinkError::Io(e)));
                    return;
                }
                self.router.expect_open(kind, sink, done);
            }
            PortCommand::CloseChannel { kind, done } => {
                // Unregister first: teardown must not depend on the
                // modem answering
                self.router.unregister(kind);
                let disc = Frame::control(kind.dlci(), FrameType::Disc, true);
                if let Err(e) = self.channel.write(&disc.encode()).await {
                    warn!("DISC write failed: {}", e);
                }
                let _ = self
                    .event_tx
                    .send(LinkEvent::ChannelClosed { kind })
                    .await;
                self.router.expect_close(kind, done);
            }
            PortCommand::PowerUp { done } => {
                let _ = done.send(self.channel.power_up().await);
            }
            PortCommand::PowerDown { done } => {
                let _ = done.send(self.channel.power_down().await);
            }
            PortCommand::Restart { done } => {
                let _ = done.send(self.channel.restart().await);
            }
            PortCommand::EnterSleep { done } => {
                let _ = done.send(self.channel.enter_sleep().await);
            }
            PortCommand::ExitSleep { done } => {
                let _ = done.send(self.channel.exit_sleep().await);
            }
            PortCommand::SelectAntenna { band, done } => {
                let _ = done.send(self.channel.select_antenna(band).await);
            }
            PortCommand::Shutdown => {}
        }
    }

    async fn handle_chunk(&mut self, chunk: ReadChunk) {
        match chunk.status {
            s if s.bears_data() => {
                if chunk.data.is_empty() {
                    return;
                }
                debug!(
                    len = chunk.data.len(),
                    status = ?chunk.status,
                    "rx {:02X?}",
                    &chunk.data[..chunk.data.len().min(64)]
                );
                match self.mode {
                    LinkMode::Plain => {
                        if self.at_data_tx.send(chunk.data).await.is_err() {
                            debug!("AT engine gone, dropping bytes");
                        }
                    }
                    LinkMode::Multiplexed => {
                        self.codec.push_bytes(&chunk.data);
                        while let Some(frame) = self.codec.next_frame() {
                            if let Some(reply) = self.router.route(frame).await {
                                if let Err(e) = self.channel.write(&reply.encode()).await {
                                    warn!("reply write failed: {}", e);
                                }
                            }
                        }
                    }
                }
            }
            ReadStatus::ReceivedNoData => {}
            ReadStatus::CmuxFrameError => {
                // The codec resynchronizes on the next flag byte
                debug!("receiver flagged a frame error");
            }
            other => {
                warn!(?other, "transport not ready");
            }
        }
    }
}

/// Cloneable handle to the link worker
#[derive(Clone)]
pub struct LinkHandle {
    cmd_tx: mpsc::Sender<PortCommand>,
    flow_rx: watch::Receiver<bool>,
    mode_tx: Arc<watch::Sender<LinkMode>>,
    at_data_tx: mpsc::Sender<Vec<u8>>,
    urc_tx: mpsc::Sender<String>,
}

impl LinkHandle {
    /// Transmit raw bytes, honoring the flow control flag. If the modem
    /// holds flow off longer than a bounded wait the write proceeds
    /// anyway, since the flag is an emulation and a stuck modem must
    /// not wedge the link.
    pub async fn write(&self, data: Vec<u8>) -> Result<usize, LinkError> {
        let mut flow = self.flow_rx.clone();
        if !*flow.borrow() {
            let waited =
                tokio::time::timeout(FLOW_BLOCK, flow.wait_for(|allowed| *allowed)).await;
            if waited.is_err() {
                warn!("flow control held off too long, transmitting anyway");
            }
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(PortCommand::Write {
                data,
                done: done_tx,
            })
            .await
            .map_err(|_| LinkError::PortClosed)?;
        done_rx
            .await
            .map_err(|_| LinkError::PortClosed)?
            .map_err(LinkError::Io)
    }

    pub async fn set_speed(&self, bps: u32) -> Result<(), LinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(PortCommand::SetSpeed { bps, done: done_tx })
            .await
            .map_err(|_| LinkError::PortClosed)?;
        done_rx
            .await
            .map_err(|_| LinkError::PortClosed)?
            .map_err(LinkError::Io)
    }

    /// Switch the worker between plain and multiplexed interpretation
    pub async fn set_mode(&self, mode: LinkMode) -> Result<(), LinkError> {
        self.mode_tx.send_replace(mode);
        self.cmd_tx
            .send(PortCommand::SetMode { mode })
            .await
            .map_err(|_| LinkError::PortClosed)
    }

    /// Watch the current link mode (used by the AT writer to decide
    /// whether to frame its output)
    pub fn mode_watch(&self) -> watch::Receiver<LinkMode> {
        self.mode_tx.subscribe()
    }

    /// Sink that feeds the AT engine; pass it when opening the
    /// commands channel so responses keep flowing to `cmd()` callers
    pub fn at_sink(&self) -> mpsc::Sender<Vec<u8>> {
        self.at_data_tx.clone()
    }

    /// Sink for complete lines that should be URC-scanned (used by the
    /// notifications channel consumer)
    pub fn urc_sink(&self) -> mpsc::Sender<String> {
        self.urc_tx.clone()
    }

    /// Open a logical channel: send SABM and wait for UA, retrying up
    /// to the configured retransmission count with the response timer
    /// as the per-attempt deadline.
    pub async fn open_channel(
        &self,
        kind: ChannelKind,
        sink: mpsc::Sender<Vec<u8>>,
        params: &CmuxParams,
    ) -> Result<(), LinkError> {
        let attempts = params.max_retransmissions.max(1) as u32;
        for attempt in 1..=attempts {
            let (done_tx, done_rx) = oneshot::channel();
            self.cmd_tx
                .send(PortCommand::OpenChannel {
                    kind,
                    sink: sink.clone(),
                    done: done_tx,
                })
                .await
                .map_err(|_| LinkError::PortClosed)?;

            match tokio::time::timeout(params.response_timeout(), done_rx).await {
                Ok(Ok(Ok(HandshakeReply::Accepted))) => return Ok(()),
                Ok(Ok(Ok(HandshakeReply::Rejected))) => {
                    return Err(LinkError::ChannelRejected { kind })
                }
                // A UA for an earlier attempt can land between
                // retries; the channel is open and the sink already
                // registered
                Ok(Ok(Err(LinkError::ChannelExists { .. }))) if attempt > 1 => {
                    debug!(?kind, "late UA registered the channel, open succeeded");
                    return Ok(());
                }
                Ok(Ok(Err(e))) => return Err(e),
                Ok(Err(_)) => return Err(LinkError::PortClosed),
                Err(_) => {
                    debug!(?kind, attempt, "no UA within response timer, retrying SABM");
                }
            }
        }
        Err(LinkError::HandshakeTimeout { kind, attempts })
    }

    /// Close a logical channel. The channel stops receiving
    /// immediately; we wait one response timer for the UA and proceed
    /// regardless of whether it arrives.
    pub async fn close_channel(
        &self,
        kind: ChannelKind,
        params: &CmuxParams,
    ) -> Result<(), LinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(PortCommand::CloseChannel {
                kind,
                done: done_tx,
            })
            .await
            .map_err(|_| LinkError::PortClosed)?;
        if tokio::time::timeout(params.response_timeout(), done_rx)
            .await
            .is_err()
        {
            debug!(?kind, "no UA for DISC, proceeding with teardown");
        }
        Ok(())
    }

    pub async fn power_up(&self) -> Result<(), LinkError> {
        self.control(|done| PortCommand::PowerUp { done }).await
    }

    pub async fn power_down(&self) -> Result<(), LinkError> {
        self.control(|done| PortCommand::PowerDown { done }).await
    }

    pub async fn restart(&self) -> Result<(), LinkError> {
        self.control(|done| PortCommand::Restart { done }).await
    }

    pub async fn enter_sleep(&self) -> Result<(), LinkError> {
        self.control(|done| PortCommand::EnterSleep { done }).await
    }

    pub async fn exit_sleep(&self) -> Result<(), LinkError> {
        self.control(|done| PortCommand::ExitSleep { done }).await
    }

    pub async fn select_antenna(&self, band: AntennaBand) -> Result<(), LinkError> {
        self.control(|done| PortCommand::SelectAntenna { band, done })
            .await
    }

    /// Stop the worker task
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(PortCommand::Shutdown).await;
    }

    async fn control(
        &self,
        make: impl FnOnce(oneshot::Sender<io::Result<()>>) -> PortCommand,
    ) -> Result<(), LinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(done_tx))
            .await
            .map_err(|_| LinkError::PortClosed)?;
        done_rx
            .await
            .map_err(|_| LinkError::PortClosed)?
            .map_err(LinkError::Io)
    }
}

/// Spawn the link engine over a transport
///
/// Starts the worker task, the AT engine and the URC scanner, and
/// returns the link handle plus the AT command channel. All observable
/// activity is reported through `event_tx`.
pub fn spawn_link<C: ByteChannel>(
    channel: C,
    event_tx: mpsc::Sender<LinkEvent>,
) -> (LinkHandle, AtChannel) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (flow_tx, flow_rx) = watch::channel(true);
    let (mode_tx, _) = watch::channel(LinkMode::Plain);
    let mode_tx = Arc::new(mode_tx);
    let (at_data_tx, at_data_rx) = mpsc::channel(64);
    let (req_tx, req_rx) = mpsc::channel::<CmdRequest>(16);
    let (urc_tx, urc_rx) = mpsc::channel(64);

    let worker = PortWorker {
        channel,
        codec: FrameCodec::new(),
        router: ChannelRouter::new(flow_tx, event_tx.clone()),
        mode: LinkMode::Plain,
        at_data_tx: at_data_tx.clone(),
        event_tx: event_tx.clone(),
    };
    tokio::spawn(worker.run(cmd_rx));

    let handle = LinkHandle {
        cmd_tx,
        flow_rx,
        mode_tx,
        at_data_tx,
        urc_tx: urc_tx.clone(),
    };

    let writer = AtWriter::new(handle.clone(), handle.mode_watch());
    tokio::spawn(run_at_engine(req_rx, at_data_rx, writer, urc_tx));
    tokio::spawn(run_urc_scanner(urc_rx, event_tx));

    (handle, AtChannel::new(req_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamChannel;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn quick_params() -> CmuxParams {
        CmuxParams {
            response_timer_10ms: 5, // 50ms per attempt
            max_retransmissions: 3,
            ..CmuxParams::default()
        }
    }

    #[tokio::test]
    async fn open_channel_requires_multiplexed_mode() {
        let (a, _b) = tokio::io::duplex(1024);
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (handle, _at) = spawn_link(StreamChannel::new(a), event_tx);

        let (sink, _rx) = mpsc::channel(16);
        let err = handle
            .open_channel(ChannelKind::Commands, sink, &quick_params())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotMultiplexed));
    }

    #[tokio::test]
    async fn open_channel_succeeds_on_ua() {
        let (a, mut b) = tokio::io::duplex(1024);
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (handle, _at) = spawn_link(StreamChannel::new(a), event_tx);
        handle.set_mode(LinkMode::Multiplexed).await.unwrap();

        // Far end: answer the first SABM with UA on the same DLCI
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = b.read(&mut buf).await.unwrap();
            assert!(n >= 6);
            let ua = Frame::control(ChannelKind::Commands.dlci(), FrameType::Ua, true);
            b.write_all(&ua.encode()).await.unwrap();
            // Keep the stream open so the worker does not see EOF
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let (sink, _rx) = mpsc::channel(16);
        handle
            .open_channel(ChannelKind::Commands, sink, &quick_params())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn open_channel_rejected_on_dm() {
        let (a, mut b) = tokio::io::duplex(1024);
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (handle, _at) = spawn_link(StreamChannel::new(a), event_tx);
        handle.set_mode(LinkMode::Multiplexed).await.unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = b.read(&mut buf).await.unwrap();
            let dm = Frame::control(ChannelKind::Data.dlci(), FrameType::Dm, true);
            b.write_all(&dm.encode()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let (sink, _rx) = mpsc::channel(16);
        let err = handle
            .open_channel(ChannelKind::Data, sink, &quick_params())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::ChannelRejected {
                kind: ChannelKind::Data
            }
        ));
    }

    #[tokio::test]
    async fn ua_arriving_after_the_response_timer_still_opens() {
        let (a, mut b) = tokio::io::duplex(1024);
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (handle, _at) = spawn_link(StreamChannel::new(a), event_tx);
        handle.set_mode(LinkMode::Multiplexed).await.unwrap();

        // Answer the first SABM only, past the 50ms response timer
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = b.read(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
            let ua = Frame::control(ChannelKind::Data.dlci(), FrameType::Ua, true);
            b.write_all(&ua.encode()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (sink, _rx) = mpsc::channel(16);
        handle
            .open_channel(ChannelKind::Data, sink, &quick_params())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn open_channel_retries_then_times_out() {
        let (a, mut b) = tokio::io::duplex(1024);
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (handle, _at) = spawn_link(StreamChannel::new(a), event_tx);
        handle.set_mode(LinkMode::Multiplexed).await.unwrap();

        // Count SABMs but never answer
        let sabm_count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&sabm_count);
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok(n) = b.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let (sink, _rx) = mpsc::channel(16);
        let err = handle
            .open_channel(ChannelKind::Notifications, sink, &quick_params())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::HandshakeTimeout { attempts: 3, .. }
        ));
        assert_eq!(
            sabm_count.load(std::sync::atomic::Ordering::SeqCst),
            3,
            "one SABM per attempt"
        );
    }
}
