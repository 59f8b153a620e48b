//! Binds an [`IsoTpAddr`] to a [`CanEndpoint`] and drives the send/receive
//! context state machines from a single worker `poll()` call.
//!
//! Frame arrival and CAN TX completion happen on whatever context the
//! `CanEndpoint` calls back from (possibly an ISR); those callbacks only
//! push onto a bounded wake channel (`crossbeam_channel`). All pool
//! mutation, state-machine work, and upper-layer callback dispatch happens
//! inside `poll()`, on the worker.

use super::pci::{self, FlowStatus, Pdu};
use super::pool::{Slab, SlabIndex};
use super::recv_ctx::{self, RecvContext};
use super::send_ctx::{self, SendContext};
use super::{Error, IsoTpAddr, IsoTpOpts};
use crate::can::{CanEndpoint, CanFilter, CanFrame, CanId, FilterId, FrameFlags, NodeId, SendCompletion};
use crate::config::IsotpConfig;
use crate::retry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One wake reason posted by a (possibly-ISR) callback. The worker drains
/// these in `poll()`; nothing but flag/queue mutation happens off the
/// worker path.
enum WakeEvent {
    Frame(CanFrame),
    /// `result` is `Err` either because the driver's own completion reported
    /// a failure, or because `retry::send_with_retry` exhausted its bounded
    /// retries on a transient `SendOutcome::Again` (spec.md §7: surfaced as
    /// `DRIVER_ERR` only after retries are exhausted).
    TxComplete { peer: NodeId, result: SendCompletion },
}

/// Delivered to `recv_cb` on a fully reassembled message.
pub type RecvSink = Box<dyn FnMut(Vec<u8>, NodeId) + Send>;
/// Delivered to `recv_err_cb` on a failed receive session.
pub type RecvErrSink = Box<dyn FnMut(Error, NodeId) + Send>;
/// Delivered to `sent_cb` exactly once per `send()` call.
pub type SentSink = Box<dyn FnMut(Result<(), Error>, NodeId) + Send>;

/// A bound ISO-TP endpoint: one `CanEndpoint`, one address, many concurrent
/// peer sessions (subject to the configured pool sizes).
pub struct IsoTpEngine {
    addr: IsoTpAddr,
    opts: IsoTpOpts,
    cfg: IsotpConfig,
    send_ctxs: Slab<SendContext>,
    recv_ctxs: Slab<RecvContext>,
    send_by_peer: HashMap<NodeId, SlabIndex>,
    recv_by_peer: HashMap<NodeId, SlabIndex>,
    wake: crossbeam::channel::Receiver<WakeEvent>,
    wake_tx: crossbeam::channel::Sender<WakeEvent>,
    filter_id: Option<FilterId>,
    recv_cb: RecvSink,
    recv_err_cb: RecvErrSink,
    sent_cb: SentSink,
}

impl IsoTpEngine {
    pub fn bind(
        endpoint: &mut dyn CanEndpoint,
        addr: IsoTpAddr,
        opts: IsoTpOpts,
        cfg: IsotpConfig,
        recv_cb: RecvSink,
        recv_err_cb: RecvErrSink,
        sent_cb: SentSink,
    ) -> Result<Self, crate::can::CanError> {
        let mut cfg = cfg;
        cfg.rx_block_size = opts.bs;
        cfg.rx_stmin = opts.stmin;

        let (wake_tx, wake) = crossbeam::channel::unbounded();
        let tx_for_filter = wake_tx.clone();
        // Mask out the source byte: a bound engine accepts frames from any
        // peer addressed to its own target byte, then dispatches per-peer
        // by `frame.id.source()` (spec.md §3 invariant 1 allows concurrent
        // sessions with distinct peers under one bound endpoint).
        let filter_id = endpoint.add_rx_filter(
            CanFilter {
                id: addr.rx_id,
                mask: CanId::EFF_MASK & !0xFF,
                flags: FrameFlags::EXTENDED,
            },
            Box::new(move |frame| {
                let _ = tx_for_filter.send(WakeEvent::Frame(frame));
            }),
        )?;
        Ok(IsoTpEngine {
            addr,
            opts,
            cfg,
            send_ctxs: Slab::with_capacity(cfg.max_contexts),
            recv_ctxs: Slab::with_capacity(cfg.max_contexts),
            send_by_peer: HashMap::new(),
            recv_by_peer: HashMap::new(),
            wake,
            wake_tx,
            filter_id: Some(filter_id),
            recv_cb,
            recv_err_cb,
            sent_cb,
        })
    }

    /// Tears down every in-flight session, firing pending `sent_cb`s with an
    /// error. Idempotent: calling it again on an already-unbound engine is a
    /// no-op.
    pub fn unbind(&mut self, endpoint: &mut dyn CanEndpoint) {
        if let Some(id) = self.filter_id.take() {
            endpoint.remove_rx_filter(id);
        }
        for (_, mut ctx) in std::mem::replace(&mut self.send_ctxs, Slab::with_capacity(0)).into_iter_owned() {
            let peer = ctx.peer();
            ctx.take_result();
            (self.sent_cb)(Err(Error::DriverErr), peer);
        }
        self.send_by_peer.clear();
        self.recv_ctxs = Slab::with_capacity(0);
        self.recv_by_peer.clear();
    }

    /// Begins sending `payload` to `peer`. Short payloads are emitted as a
    /// synchronous Single Frame; longer ones allocate a `SendContext` and
    /// the FF is emitted on the next `poll()`.
    pub fn send(
        &mut self,
        endpoint: &mut dyn CanEndpoint,
        payload: Vec<u8>,
        peer: NodeId,
    ) -> Result<(), Error> {
        if self.send_by_peer.contains_key(&peer) {
            return Err(Error::NoCtxLeft); // reject-with-busy, spec.md §4.3
        }
        if payload.len() > pci::MAX_MESSAGE_LEN {
            return Err(Error::BufferOverflw);
        }
        let max_sf = if payload.len() < 16.min(self.cfg.can_max_dlen) {
            self.cfg.can_max_dlen - 1
        } else {
            self.cfg.can_max_dlen - 2
        };
        if payload.len() <= max_sf {
            let mut frame = Vec::new();
            pci::encode_sf(&payload, self.cfg.can_max_dlen, &mut frame);
            let result = self.emit(endpoint, peer, frame).map_err(Error::from);
            (self.sent_cb)(result, peer);
            return Ok(());
        }
        let ctx = SendContext::new(peer, payload);
        let idx = self
            .send_ctxs
            .insert(ctx)
            .ok_or(Error::NoCtxLeft)?;
        self.send_by_peer.insert(peer, idx);
        Ok(())
    }

    /// Hands one frame to the CAN endpoint, retrying a transient
    /// `SendOutcome::Again` up to `cfg.send_retries` times before giving up.
    /// Returns `Err` only once retries are exhausted or the driver returns a
    /// hard error; the completion (and any later async failure) still flows
    /// through the wake channel as `WakeEvent::TxComplete`.
    fn emit(
        &self,
        endpoint: &mut dyn CanEndpoint,
        peer: NodeId,
        data: Vec<u8>,
    ) -> Result<(), crate::can::CanError> {
        let id = self.tx_id_for(peer);
        let frame = CanFrame::new(id, FrameFlags::EXTENDED, &data).expect("frame within max_dlen");
        let tx = self.wake_tx.clone();
        retry::send_with_retry(
            endpoint,
            &frame,
            self.cfg.send_retries,
            Arc::new(move |result| {
                let _ = tx.send(WakeEvent::TxComplete { peer, result });
            }),
        )
    }

    fn tx_id_for(&self, peer: NodeId) -> CanId {
        CanId::fixed(self.addr.tx_id.priority(), self.addr.tx_id.msg_type(), peer, self.addr.tx_id.source())
    }

    /// Drains pending wake events and advances every live context. Call this
    /// from the single worker loop/task that owns this engine.
    pub fn poll(&mut self, endpoint: &mut dyn CanEndpoint, now: Instant) {
        while let Ok(event) = self.wake.try_recv() {
            match event {
                WakeEvent::Frame(frame) => self.dispatch_frame(endpoint, &frame, now),
                WakeEvent::TxComplete { peer, result } => {
                    self.dispatch_tx_complete(endpoint, peer, result, now)
                }
            }
        }
        self.drive_send_contexts(endpoint, now);
        self.drive_recv_contexts(endpoint, now);
    }

    fn dispatch_frame(&mut self, endpoint: &mut dyn CanEndpoint, frame: &CanFrame, now: Instant) {
        let peer = frame.id.source();
        let pdu = match pci::decode(frame.data(), frame.dlc(), self.cfg.can_max_dlen) {
            Ok(pdu) => pdu,
            Err(pci::DecodeError::InvalidFlowStatus) => {
                // spec.md §4.3: WAIT_FC + RX FC(invalid FS) -> fail with INVALID_FS.
                if let Some(&idx) = self.send_by_peer.get(&peer) {
                    if let Some(ctx) = self.send_ctxs.get_mut(idx) {
                        let actions = ctx.on_invalid_fs();
                        self.apply_send_actions(endpoint, idx, peer, actions);
                    }
                }
                return;
            }
            Err(_) => return, // silently ignored, per spec.md tie-break rules
        };
        match pdu {
            Pdu::FlowControl { status, bs, stmin } => {
                if let Some(&idx) = self.send_by_peer.get(&peer) {
                    if let Some(ctx) = self.send_ctxs.get_mut(idx) {
                        let actions = ctx.on_rx_fc(status, bs, stmin, now, &self.cfg);
                        self.apply_send_actions(endpoint, idx, peer, actions);
                    }
                }
                // no SendContext: dropped, per spec.md §4.3.
            }
            Pdu::SingleFrame { payload } => {
                // spec.md §4.3: WAIT_CF | RX non-CF -> fail with UNEXP_PDU.
                // A stray SF while a RecvContext for this peer is mid
                // reassembly fails that context instead of silently
                // delivering an extra, unrelated buffer alongside it.
                self.fail_live_recv_ctx_as_unexpected(endpoint, peer);
                let mut ctx = RecvContext::from_sf(peer, payload);
                let actions = ctx.finish_sf();
                self.apply_recv_actions(endpoint, None, peer, actions);
                let _ = ctx;
            }
            Pdu::FirstFrame { total_len, payload } => {
                // Same UNEXP_PDU rule: a second FF supersedes, rather than
                // being dropped alongside, the one already in flight.
                self.fail_live_recv_ctx_as_unexpected(endpoint, peer);
                let (ctx, actions) =
                    RecvContext::from_ff(peer, total_len, payload, now, &self.cfg);
                match self.recv_ctxs.insert(ctx) {
                    Some(idx) => {
                        self.recv_by_peer.insert(peer, idx);
                        self.apply_recv_actions(endpoint, Some(idx), peer, actions);
                    }
                    None => {
                        (self.recv_err_cb)(Error::NoNetBufLeft, peer);
                    }
                }
            }
            Pdu::ConsecutiveFrame { sn, payload } => {
                if let Some(&idx) = self.recv_by_peer.get(&peer) {
                    if let Some(ctx) = self.recv_ctxs.get_mut(idx) {
                        let actions = ctx.on_cf(sn, payload, now, &self.cfg);
                        self.apply_recv_actions(endpoint, Some(idx), peer, actions);
                    }
                } else {
                    // FF/SF not seen yet for this sender: spec.md treats a
                    // stray CF as an unexpected PDU on a session that isn't
                    // there to fail, so it is simply dropped.
                }
            }
        }
    }

    /// If a `RecvContext` is mid-reassembly for `peer`, fails it with
    /// `UNEXP_PDU` and removes it from the pool. No-op if none is live.
    fn fail_live_recv_ctx_as_unexpected(&mut self, endpoint: &mut dyn CanEndpoint, peer: NodeId) {
        if let Some(&idx) = self.recv_by_peer.get(&peer) {
            if let Some(ctx) = self.recv_ctxs.get_mut(idx) {
                let actions = ctx.on_unexpected_pdu();
                self.apply_recv_actions(endpoint, Some(idx), peer, actions);
            }
        }
    }

    fn dispatch_tx_complete(
        &mut self,
        endpoint: &mut dyn CanEndpoint,
        peer: NodeId,
        result: SendCompletion,
        now: Instant,
    ) {
        if let Some(&idx) = self.send_by_peer.get(&peer) {
            if result.is_err() {
                self.send_ctxs.remove(idx);
                self.send_by_peer.remove(&peer);
                (self.sent_cb)(Err(Error::DriverErr), peer);
                return;
            }
            if let Some(ctx) = self.send_ctxs.get_mut(idx) {
                let actions = ctx.on_tx_complete(now, &self.cfg);
                self.apply_send_actions(endpoint, idx, peer, actions);
            }
        }
    }

    fn drive_send_contexts(&mut self, endpoint: &mut dyn CanEndpoint, now: Instant) {
        let peers: Vec<(NodeId, SlabIndex)> =
            self.send_by_peer.iter().map(|(p, i)| (*p, *i)).collect();
        for (peer, idx) in peers {
            if let Some(ctx) = self.send_ctxs.get_mut(idx) {
                let actions = ctx.poll(now, &self.cfg);
                self.apply_send_actions(endpoint, idx, peer, actions);
            }
        }
    }

    fn drive_recv_contexts(&mut self, endpoint: &mut dyn CanEndpoint, now: Instant) {
        let peers: Vec<(NodeId, SlabIndex)> =
            self.recv_by_peer.iter().map(|(p, i)| (*p, *i)).collect();
        for (peer, idx) in peers {
            if let Some(ctx) = self.recv_ctxs.get_mut(idx) {
                let actions = ctx.poll(now);
                self.apply_recv_actions(endpoint, Some(idx), peer, actions);
            }
        }
    }

    fn apply_send_actions(
        &mut self,
        endpoint: &mut dyn CanEndpoint,
        idx: SlabIndex,
        peer: NodeId,
        actions: Vec<send_ctx::Action>,
    ) {
        let mut finished = None;
        for action in actions {
            if finished.is_some() {
                break;
            }
            match action {
                send_ctx::Action::Emit(frame) => {
                    if self.emit(endpoint, peer, frame.data).is_err() {
                        finished = Some(Err(Error::DriverErr));
                    }
                }
                send_ctx::Action::ArmTimer(_) | send_ctx::Action::DisarmTimer => {}
                send_ctx::Action::Finished(result) => finished = Some(result),
            }
        }
        if let Some(result) = finished {
            self.send_ctxs.remove(idx);
            self.send_by_peer.remove(&peer);
            (self.sent_cb)(result, peer);
        }
    }

    fn apply_recv_actions(
        &mut self,
        endpoint: &mut dyn CanEndpoint,
        idx: Option<SlabIndex>,
        peer: NodeId,
        actions: Vec<recv_ctx::Action>,
    ) {
        let mut outcome = None;
        for action in actions {
            if outcome.is_some() {
                break;
            }
            match action {
                recv_ctx::Action::Emit(frame) => {
                    if self.emit(endpoint, peer, frame.data).is_err() {
                        outcome = Some(Err(Error::DriverErr));
                    }
                }
                recv_ctx::Action::ArmTimer(_) | recv_ctx::Action::DisarmTimer => {}
                recv_ctx::Action::Delivered(buf) => outcome = Some(Ok(buf)),
                recv_ctx::Action::Failed(err) => outcome = Some(Err(err)),
            }
        }
        if let Some(result) = outcome {
            if let Some(idx) = idx {
                self.recv_ctxs.remove(idx);
                self.recv_by_peer.remove(&peer);
            }
            match result {
                Ok(buf) => (self.recv_cb)(buf, peer),
                Err(err) => (self.recv_err_cb)(err, peer),
            }
        }
    }
}

trait SlabIntoOwned<T> {
    fn into_iter_owned(self) -> Vec<(SlabIndex, T)>;
}

impl<T> SlabIntoOwned<T> for Slab<T> {
    fn into_iter_owned(self) -> Vec<(SlabIndex, T)> {
        let mut out = Vec::new();
        let mut slab = self;
        let keys: Vec<SlabIndex> = slab.iter().map(|(i, _)| i).collect();
        for k in keys {
            if let Some(v) = slab.remove(k) {
                out.push((k, v));
            }
        }
        out
    }
}
