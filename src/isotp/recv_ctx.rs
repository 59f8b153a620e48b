//! RecvContext: the receiver-side ISO-TP session state machine (spec.md §4.3).

use super::pci::{self, FlowStatus};
use super::Error;
use crate::can::NodeId;
use crate::config::IsotpConfig;
use crate::isotp::timer::Timer;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitFfSf,
    SendFc,
    WaitCf,
    Recycle,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emit {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Emit(Emit),
    ArmTimer(Duration),
    DisarmTimer,
    /// Message fully reassembled; hand `buffer` to the upper layer.
    Delivered(Vec<u8>),
    Failed(Error),
}

/// Receiver-side session reassembling one in-flight message from `sender`.
pub struct RecvContext {
    sender: NodeId,
    buffer: Vec<u8>,
    total_len: usize,
    sn_expected: u8,
    bs_remaining: u8,
    wft: u8,
    state: State,
    timer: Timer,
    outcome: Option<Result<Vec<u8>, Error>>,
}

impl RecvContext {
    /// Starts a session from a Single Frame: already complete.
    pub fn from_sf(sender: NodeId, payload: &[u8]) -> Self {
        RecvContext {
            sender,
            buffer: payload.to_vec(),
            total_len: payload.len(),
            sn_expected: 1,
            bs_remaining: 0,
            wft: 0,
            state: State::Recycle,
            timer: Timer::new(),
            outcome: None,
        }
    }

    /// Starts a session from a First Frame.
    pub fn from_ff(
        sender: NodeId,
        total_len: u16,
        initial_payload: &[u8],
        now: Instant,
        cfg: &IsotpConfig,
    ) -> (Self, Vec<Action>) {
        let mut ctx = RecvContext {
            sender,
            buffer: Vec::with_capacity(total_len as usize),
            total_len: total_len as usize,
            sn_expected: 1,
            bs_remaining: 0,
            wft: 0,
            state: State::WaitFfSf,
            timer: Timer::new(),
            outcome: None,
        };
        ctx.buffer.extend_from_slice(initial_payload);
        let mut actions = Vec::new();
        ctx.process_ff(now, cfg, &mut actions);
        (ctx, actions)
    }

    pub fn sender(&self) -> NodeId {
        self.sender
    }

    /// Completes a context built with [`RecvContext::from_sf`], delivering
    /// its payload to the upper layer. Kept separate from construction so
    /// the engine always observes delivery as an explicit `Action`.
    pub fn finish_sf(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.deliver(&mut actions);
        actions
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    pub fn take_outcome(&mut self) -> Option<Result<Vec<u8>, Error>> {
        self.outcome.take()
    }

    fn fail(&mut self, err: Error, actions: &mut Vec<Action>) {
        self.timer.disarm();
        actions.push(Action::DisarmTimer);
        self.outcome = Some(Err(err));
        self.state = State::Done;
        actions.push(Action::Failed(err));
    }

    fn deliver(&mut self, actions: &mut Vec<Action>) {
        self.timer.disarm();
        actions.push(Action::DisarmTimer);
        let buffer = std::mem::take(&mut self.buffer);
        self.outcome = Some(Ok(buffer.clone()));
        self.state = State::Done;
        actions.push(Action::Delivered(buffer));
    }

    fn process_ff(&mut self, now: Instant, cfg: &IsotpConfig, actions: &mut Vec<Action>) {
        if self.total_len > cfg.max_fragments_per_message * (cfg.can_max_dlen - 1) {
            let mut fc = Vec::new();
            pci::encode_fc(FlowStatus::Overflow, 0, 0, &mut fc);
            actions.push(Action::Emit(Emit { data: fc }));
            self.fail(Error::BufferOverflw, actions);
            return;
        }
        self.bs_remaining = cfg.rx_block_size;
        self.send_fc(now, cfg, actions);
    }

    fn send_fc(&mut self, now: Instant, cfg: &IsotpConfig, actions: &mut Vec<Action>) {
        let mut fc = Vec::new();
        pci::encode_fc(FlowStatus::ContinueToSend, cfg.rx_block_size, cfg.rx_stmin, &mut fc);
        actions.push(Action::Emit(Emit { data: fc }));
        self.bs_remaining = cfg.rx_block_size;
        self.state = State::WaitCf;
        self.timer.arm(now, cfg.n_cr);
        actions.push(Action::ArmTimer(cfg.n_cr));
    }

    /// `poll` only matters for timer-driven transitions; frame arrival is
    /// handled by [`RecvContext::on_rx`].
    pub fn poll(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == State::WaitCf && self.timer.poll(now) {
            self.fail(Error::TimeoutCr, &mut actions);
        }
        actions
    }

    /// A Consecutive Frame arrived for this session.
    pub fn on_cf(&mut self, sn: u8, payload: &[u8], now: Instant, cfg: &IsotpConfig) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != State::WaitCf {
            return actions;
        }
        if sn != self.sn_expected {
            self.fail(Error::WrongSn, &mut actions);
            return actions;
        }
        let remaining = self.total_len - self.buffer.len();
        let take = payload.len().min(remaining);
        self.buffer.extend_from_slice(&payload[..take]);
        self.sn_expected = (self.sn_expected + 1) & 0x0F;
        if cfg.rx_block_size > 0 {
            self.bs_remaining -= 1;
        }

        if self.buffer.len() >= self.total_len {
            self.deliver(&mut actions);
            return actions;
        }

        if cfg.rx_block_size > 0 && self.bs_remaining == 0 {
            // send_fc re-arms N_Cr itself.
            self.send_fc(now, cfg, &mut actions);
        } else {
            self.timer.arm(now, cfg.n_cr);
            actions.push(Action::ArmTimer(cfg.n_cr));
        }
        actions
    }

    /// A non-CF frame arrived while waiting for the next CF: protocol error.
    pub fn on_unexpected_pdu(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == State::WaitCf {
            self.fail(Error::UnexpPdu, &mut actions);
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> IsotpConfig {
        IsotpConfig::default()
    }

    #[test]
    fn ff_then_two_cfs_reassembles_in_order() {
        let now = Instant::now();
        let (mut ctx, actions) =
            RecvContext::from_ff(NodeId::new(0x02).unwrap(), 16, &[0, 1, 2, 3, 4, 5], now, &cfg());
        assert!(matches!(actions[0], Action::Emit(_)));

        let actions = ctx.on_cf(1, &[6, 7, 8, 9, 10, 11, 12], now, &cfg());
        assert!(actions.is_empty() || matches!(actions[0], Action::ArmTimer(_)));
        assert!(!ctx.is_finished());

        let actions = ctx.on_cf(2, &[13, 14, 15, 0xAA, 0xAA, 0xAA, 0xAA], now, &cfg());
        assert!(ctx.is_finished());
        match actions.last() {
            Some(Action::Delivered(buf)) => {
                assert_eq!(buf.len(), 16);
                assert_eq!(buf, &(0u8..16).collect::<Vec<u8>>());
            }
            other => panic!("expected Delivered, got {:?}", other),
        }
    }

    #[test]
    fn wrong_sequence_number_fails_with_wrong_sn() {
        let now = Instant::now();
        let (mut ctx, _) =
            RecvContext::from_ff(NodeId::new(0x02).unwrap(), 16, &[0, 1, 2, 3, 4, 5], now, &cfg());
        let actions = ctx.on_cf(2, &[6, 7, 8, 9, 10, 11, 12], now, &cfg());
        assert!(matches!(actions.last(), Some(Action::Failed(Error::WrongSn))));
        assert!(ctx.is_finished());
    }

    #[test]
    fn n_cr_timeout_fails_the_session() {
        let now = Instant::now();
        let (mut ctx, _) =
            RecvContext::from_ff(NodeId::new(0x02).unwrap(), 16, &[0, 1, 2, 3, 4, 5], now, &cfg());
        let actions = ctx.poll(now + Duration::from_millis(1100));
        assert!(matches!(actions.last(), Some(Action::Failed(Error::TimeoutCr))));
    }

    #[test]
    fn declared_length_over_capacity_is_buffer_overflow() {
        let mut small = cfg();
        small.max_fragments_per_message = 1;
        let (ctx, actions) =
            RecvContext::from_ff(NodeId::new(0x02).unwrap(), 4095, &[0; 6], Instant::now(), &small);
        assert!(ctx.is_finished());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Failed(Error::BufferOverflw))));
    }

    #[test]
    fn single_frame_is_immediately_complete() {
        let mut ctx = RecvContext::from_sf(NodeId::new(0x02).unwrap(), &[0x11, 0x22, 0x33]);
        let actions = ctx.finish_sf();
        assert!(ctx.is_finished());
        assert!(matches!(&actions[1], Action::Delivered(buf) if buf == &[0x11, 0x22, 0x33]));
    }
}
