//! Frame dispatch for multiplexed mode
//!
//! The router sits between the frame codec and the per-channel
//! consumers. Decoded frames are dispatched by DLCI: data frames go to
//! the registered sink for that channel, handshake replies (UA/DM)
//! resolve the pending open/close waiter, and control-channel messages
//! (MSC, CLD) are handled internally. Frames for a DLCI nobody has
//! registered are discarded.
//!
//! Flow control is a single link-wide flag. An MSC frame asserting
//! flow-off flips it; writers observe it through a watch channel before
//! each transmit.

use std::collections::HashMap;

use modem_protocol::{mux_ctrl, Frame, FrameType};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::channel::ChannelKind;
use crate::error::LinkError;
use crate::events::LinkEvent;

/// Resolution of a SABM/DISC handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeReply {
    /// Modem answered UA
    Accepted,
    /// Modem answered DM
    Rejected,
}

/// A handshake awaiting its UA/DM reply. An open carries the sink to
/// register once the modem accepts.
enum Pending {
    Open {
        sink: mpsc::Sender<Vec<u8>>,
        done: oneshot::Sender<Result<HandshakeReply, LinkError>>,
    },
    Close(oneshot::Sender<()>),
}

/// Dispatches decoded frames to channel sinks and handshake waiters
pub struct ChannelRouter {
    sinks: HashMap<u8, mpsc::Sender<Vec<u8>>>,
    pending: HashMap<u8, Pending>,
    flow_tx: watch::Sender<bool>,
    event_tx: mpsc::Sender<LinkEvent>,
}

impl ChannelRouter {
    pub fn new(flow_tx: watch::Sender<bool>, event_tx: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            sinks: HashMap::new(),
            pending: HashMap::new(),
            flow_tx,
            event_tx,
        }
    }

    /// Register a consumer sink for a channel. Fails if one is already
    /// registered.
    pub fn register(&mut self, kind: ChannelKind, sink: mpsc::Sender<Vec<u8>>) -> bool {
        use std::collections::hash_map::Entry;
        match self.sinks.entry(kind.dlci()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(sink);
                true
            }
        }
    }

    /// Drop the sink for a channel so no further frames reach it
    pub fn unregister(&mut self, kind: ChannelKind) {
        self.sinks.remove(&kind.dlci());
    }

    pub fn is_registered(&self, kind: ChannelKind) -> bool {
        self.sinks.contains_key(&kind.dlci())
    }

    /// Record a waiter for the UA/DM reply to a SABM we just sent. The
    /// sink is registered only once the modem accepts. Replaces any
    /// previous waiter for the same channel (caller-driven retry).
    pub fn expect_open(
        &mut self,
        kind: ChannelKind,
        sink: mpsc::Sender<Vec<u8>>,
        done: oneshot::Sender<Result<HandshakeReply, LinkError>>,
    ) {
        self.pending
            .insert(kind.dlci(), Pending::Open { sink, done });
    }

    /// Record a waiter for the UA reply to a DISC we just sent
    pub fn expect_close(&mut self, kind: ChannelKind, done: oneshot::Sender<()>) {
        self.pending.insert(kind.dlci(), Pending::Close(done));
    }

    /// Drop every registered sink and waiter (mode exit, reset)
    pub fn reset(&mut self) {
        self.sinks.clear();
        self.pending.clear();
    }

    /// Dispatch one decoded frame. Returns a reply frame to transmit,
    /// if the protocol calls for one.
    pub async fn route(&mut self, frame: Frame) -> Option<Frame> {
        match frame.frame_type {
            FrameType::Ua => {
                self.resolve(frame.dlci, HandshakeReply::Accepted).await;
                None
            }
            FrameType::Dm => {
                self.resolve(frame.dlci, HandshakeReply::Rejected).await;
                None
            }
            FrameType::Sabm => {
                // We are the initiating side; a modem-originated SABM
                // is not part of the dialogs we run
                debug!(dlci = frame.dlci, "unexpected SABM from modem, answering DM");
                Some(Frame::control(frame.dlci, FrameType::Dm, true))
            }
            FrameType::Disc => {
                self.sinks.remove(&frame.dlci);
                if let Some(kind) = ChannelKind::from_dlci(frame.dlci) {
                    let _ = self.event_tx.send(LinkEvent::ChannelClosed { kind }).await;
                }
                Some(Frame::control(frame.dlci, FrameType::Ua, true))
            }
            FrameType::Uih | FrameType::Ui | FrameType::I => {
                if frame.dlci == 0 {
                    self.handle_control(&frame.payload).await
                } else {
                    self.dispatch_data(frame).await;
                    None
                }
            }
        }
    }

    async fn resolve(&mut self, dlci: u8, reply: HandshakeReply) {
        match self.pending.remove(&dlci) {
            Some(Pending::Open { sink, done }) => {
                if reply == HandshakeReply::Accepted {
                    self.sinks.insert(dlci, sink);
                    if let Some(kind) = ChannelKind::from_dlci(dlci) {
                        let _ = self.event_tx.send(LinkEvent::ChannelOpened { kind }).await;
                    }
                }
                let _ = done.send(Ok(reply));
            }
            Some(Pending::Close(done)) => {
                let _ = done.send(());
            }
            None => {
                debug!(dlci, ?reply, "handshake reply with no waiter");
            }
        }
    }

    /// MSC toggles the link-wide flow control flag; CLD from the modem
    /// side is not something we act on
    async fn handle_control(&mut self, payload: &[u8]) -> Option<Frame> {
        if let Some((dlci, flow_off)) = mux_ctrl::parse_msc(payload) {
            let allowed = !flow_off;
            debug!(dlci, allowed, "MSC flow control update");
            self.flow_tx.send_replace(allowed);
            let _ = self
                .event_tx
                .send(LinkEvent::FlowControl { allowed })
                .await;
            // Commands are echoed back as responses; a response to our
            // own MSC needs no further reply
            if payload.first() == Some(&mux_ctrl::MSC) {
                return Some(Frame::uih(0, mux_ctrl::msc_response(payload)));
            }
            return None;
        }
        if mux_ctrl::is_cld(payload) {
            debug!("CLD on control channel, ignoring");
            return None;
        }
        warn!("unrecognized control message: {:02X?}", payload);
        None
    }

    async fn dispatch_data(&mut self, frame: Frame) {
        let Some(sink) = self.sinks.get(&frame.dlci) else {
            warn!(
                dlci = frame.dlci,
                len = frame.payload.len(),
                "data frame for unregistered channel, discarding"
            );
            return;
        };
        if sink.send(frame.payload).await.is_err() {
            debug!(dlci = frame.dlci, "channel consumer gone, unregistering");
            self.sinks.remove(&frame.dlci);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_router() -> (
        ChannelRouter,
        watch::Receiver<bool>,
        mpsc::Receiver<LinkEvent>,
    ) {
        let (flow_tx, flow_rx) = watch::channel(true);
        let (event_tx, event_rx) = mpsc::channel(16);
        (ChannelRouter::new(flow_tx, event_tx), flow_rx, event_rx)
    }

    #[tokio::test]
    async fn data_frames_reach_registered_sink_in_order() {
        let (mut router, _flow, _events) = make_router();
        let (tx, mut rx) = mpsc::channel(16);
        assert!(router.register(ChannelKind::Commands, tx));

        router.route(Frame::uih(2, b"first".to_vec())).await;
        router.route(Frame::uih(2, b"second".to_vec())).await;

        assert_eq!(rx.recv().await.unwrap(), b"first");
        assert_eq!(rx.recv().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn frames_for_other_dlcis_do_not_leak() {
        let (mut router, _flow, _events) = make_router();
        let (tx, mut rx) = mpsc::channel(16);
        router.register(ChannelKind::Commands, tx);

        // Notifications traffic and an unknown DLCI must not reach the
        // commands sink
        router.route(Frame::uih(1, b"+CPIN: READY".to_vec())).await;
        router.route(Frame::uih(5, b"noise".to_vec())).await;
        router.route(Frame::uih(2, b"OK".to_vec())).await;

        assert_eq!(rx.recv().await.unwrap(), b"OK");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_registration_is_refused() {
        let (mut router, _flow, _events) = make_router();
        let (tx1, _rx1) = mpsc::channel(16);
        let (tx2, _rx2) = mpsc::channel(16);
        assert!(router.register(ChannelKind::Data, tx1));
        assert!(!router.register(ChannelKind::Data, tx2));
    }

    #[tokio::test]
    async fn ua_resolves_open_waiter_and_registers_sink() {
        let (mut router, _flow, mut events) = make_router();
        let (sink, mut rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();
        router.expect_open(ChannelKind::Commands, sink, done_tx);
        assert!(!router.is_registered(ChannelKind::Commands));

        router.route(Frame::control(2, FrameType::Ua, true)).await;
        assert_eq!(done_rx.await.unwrap().unwrap(), HandshakeReply::Accepted);
        assert!(router.is_registered(ChannelKind::Commands));
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::ChannelOpened {
                kind: ChannelKind::Commands
            }
        ));

        // Data now flows to the registered sink
        router.route(Frame::uih(2, b"OK".to_vec())).await;
        assert_eq!(rx.recv().await.unwrap(), b"OK");
    }

    #[tokio::test]
    async fn dm_resolves_open_waiter_as_rejected() {
        let (mut router, _flow, _events) = make_router();
        let (sink, _rx) = mpsc::channel(16);
        let (done_tx, done_rx) = oneshot::channel();
        router.expect_open(ChannelKind::Data, sink, done_tx);

        router.route(Frame::control(3, FrameType::Dm, true)).await;
        assert_eq!(done_rx.await.unwrap().unwrap(), HandshakeReply::Rejected);
        assert!(!router.is_registered(ChannelKind::Data));
    }

    #[tokio::test]
    async fn msc_flow_off_clears_flag_and_echoes_response() {
        let (mut router, flow, _events) = make_router();
        assert!(*flow.borrow());

        let reply = router
            .route(Frame::uih(0, mux_ctrl::msc_message(2, true)))
            .await;
        assert!(!*flow.borrow());
        // The command is echoed as a response frame on the control
        // channel
        let reply = reply.expect("MSC command should be echoed");
        assert_eq!(reply.dlci, 0);
        assert_eq!(reply.payload[0], mux_ctrl::MSC & !0x02);

        router
            .route(Frame::uih(0, mux_ctrl::msc_message(2, false)))
            .await;
        assert!(*flow.borrow());
    }
}
