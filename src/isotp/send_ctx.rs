//! SendContext: the sender-side ISO-TP session state machine (spec.md §4.2).

use super::pci::{self, FlowStatus};
use super::Error;
use crate::can::NodeId;
use crate::config::IsotpConfig;
use crate::isotp::timer::Timer;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendFf,
    WaitFc,
    SendCf,
    WaitSt,
    WaitBacklog,
    WaitFin,
    Done,
}

/// One frame the engine must hand to the CAN endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emit {
    pub data: Vec<u8>,
}

/// What the engine should do as a result of driving a [`SendContext`] one
/// step. Keeps the state machine itself free of any `CanEndpoint` knowledge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Emit(Emit),
    ArmTimer(Duration),
    DisarmTimer,
    Finished(Result<(), Error>),
}

/// Sender-side session for one in-flight message to `peer`.
pub struct SendContext {
    peer: NodeId,
    payload: Vec<u8>,
    sent: usize,
    sn: u8,
    bs_remaining: u8,
    peer_bs: u8,
    peer_stmin: Duration,
    wft: u8,
    backlog: u8,
    state: State,
    timer: Timer,
    result: Option<Result<(), Error>>,
}

impl SendContext {
    pub fn new(peer: NodeId, payload: Vec<u8>) -> Self {
        SendContext {
            peer,
            payload,
            sent: 0,
            sn: 1,
            bs_remaining: 0,
            peer_bs: 0,
            peer_stmin: Duration::from_millis(0),
            wft: 0,
            backlog: 0,
            state: State::SendFf,
            timer: Timer::new(),
            result: None,
        }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    pub fn take_result(&mut self) -> Option<Result<(), Error>> {
        self.result.take()
    }

    fn fail(&mut self, err: Error, actions: &mut Vec<Action>) {
        self.timer.disarm();
        actions.push(Action::DisarmTimer);
        self.result = Some(Err(err));
        self.state = State::Done;
        actions.push(Action::Finished(Err(err)));
    }

    fn finish_ok(&mut self, actions: &mut Vec<Action>) {
        self.result = Some(Ok(()));
        self.state = State::Done;
        actions.push(Action::Finished(Ok(())));
    }

    /// Advances the state machine. Called from the worker loop (`SendFf`,
    /// `SendCf`, `WaitSt` resumption, `WaitFin` completion) and from timer
    /// expiry. `max_dlen` is 8 for classical CAN, up to 64 for CAN-FD.
    pub fn poll(&mut self, now: Instant, cfg: &IsotpConfig) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            State::SendFf => {
                let mut frame = Vec::new();
                pci::encode_ff_header(self.payload.len() as u16, &mut frame);
                let room = cfg.can_max_dlen - frame.len();
                let take = room.min(self.payload.len());
                frame.extend_from_slice(&self.payload[..take]);
                self.sent = take;
                self.sn = 1;
                actions.push(Action::Emit(Emit { data: frame }));
                self.timer.arm(now, cfg.n_bs);
                actions.push(Action::ArmTimer(cfg.n_bs));
                self.state = State::WaitFc;
            }
            State::WaitFc => {
                if self.timer.poll(now) {
                    self.fail(Error::TimeoutBs, &mut actions);
                }
            }
            State::SendCf => {
                self.drain_cf(now, cfg, &mut actions);
            }
            State::WaitSt => {
                if self.timer.poll(now) {
                    self.timer.disarm();
                    actions.push(Action::DisarmTimer);
                    self.state = State::SendCf;
                    self.drain_cf(now, cfg, &mut actions);
                }
            }
            State::WaitBacklog | State::WaitFin | State::Done => {}
        }
        actions
    }

    fn drain_cf(&mut self, now: Instant, cfg: &IsotpConfig, actions: &mut Vec<Action>) {
        loop {
            let remaining = self.payload.len() - self.sent;
            if remaining == 0 {
                self.state = if self.backlog == 0 {
                    State::Done
                } else {
                    State::WaitFin
                };
                if self.state == State::Done {
                    self.finish_ok(actions);
                }
                return;
            }
            if self.backlog >= cfg.tx_ring_slack {
                self.state = State::WaitBacklog;
                return;
            }
            let mut frame = Vec::new();
            pci::encode_cf_header(self.sn, &mut frame);
            let room = cfg.can_max_dlen - frame.len();
            let take = room.min(remaining);
            frame.extend_from_slice(&self.payload[self.sent..self.sent + take]);
            self.sent += take;
            self.sn = (self.sn + 1) & 0x0F;
            self.backlog += 1;
            if self.peer_bs > 0 {
                self.bs_remaining -= 1;
            }
            actions.push(Action::Emit(Emit { data: frame }));

            if self.peer_bs > 0 && self.bs_remaining == 0 {
                self.state = State::WaitFc;
                self.timer.arm(now, cfg.n_bs);
                actions.push(Action::ArmTimer(cfg.n_bs));
                return;
            }
            if !self.peer_stmin.is_zero() {
                self.state = State::WaitSt;
                return;
            }
        }
    }

    /// A flow-control frame addressed to this session arrived but carried an
    /// unrecognized flow-status nibble (spec.md §4.3: `WAIT_FC` + RX
    /// FC(invalid FS) -> fail with `INVALID_FS`).
    pub fn on_invalid_fs(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == State::WaitFc {
            self.fail(Error::InvalidFs, &mut actions);
        }
        actions
    }

    /// A flow-control frame addressed to this session arrived.
    pub fn on_rx_fc(&mut self, status: FlowStatus, bs: u8, stmin: u8, now: Instant, cfg: &IsotpConfig) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != State::WaitFc {
            return actions;
        }
        match status {
            FlowStatus::ContinueToSend => {
                self.peer_bs = bs;
                self.bs_remaining = bs;
                self.peer_stmin = pci::stmin_to_duration(stmin);
                self.timer.disarm();
                actions.push(Action::DisarmTimer);
                self.state = State::SendCf;
                self.drain_cf(now, cfg, &mut actions);
            }
            FlowStatus::Wait => {
                self.wft += 1;
                if self.wft >= cfg.wftmax {
                    self.fail(Error::WftOvrn, &mut actions);
                } else {
                    self.timer.arm(now, cfg.n_bs);
                    actions.push(Action::ArmTimer(cfg.n_bs));
                }
            }
            FlowStatus::Overflow => {
                self.fail(Error::BufferOverflw, &mut actions);
            }
        }
        actions
    }

    /// The CAN endpoint confirmed transmission of one frame belonging to this
    /// session (drains the CF-ordering backlog).
    pub fn on_tx_complete(&mut self, now: Instant, cfg: &IsotpConfig) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.backlog > 0 {
            self.backlog -= 1;
        }
        match self.state {
            State::WaitBacklog => {
                if self.payload.len() - self.sent == 0 && self.backlog == 0 {
                    self.finish_ok(&mut actions);
                } else if self.backlog < cfg.tx_ring_slack {
                    self.state = State::SendCf;
                    self.drain_cf(now, cfg, &mut actions);
                }
            }
            State::WaitFin => {
                if self.backlog == 0 {
                    self.finish_ok(&mut actions);
                }
            }
            _ => {}
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isotp::pci::FlowStatus;

    fn cfg() -> IsotpConfig {
        IsotpConfig::default()
    }

    #[test]
    fn short_payload_single_ff_then_cts_drains_in_one_block() {
        let mut ctx = SendContext::new(NodeId::new(0x02).unwrap(), vec![0u8; 16]);
        let now = Instant::now();
        let actions = ctx.poll(now, &cfg());
        assert!(matches!(actions[0], Action::Emit(_)));
        assert!(matches!(actions[1], Action::ArmTimer(_)));

        let actions = ctx.on_rx_fc(FlowStatus::ContinueToSend, 8, 0, now, &cfg());
        // 16 - 6 (FF payload) = 10 bytes left -> two CFs of 7 bytes each.
        let emits: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::Emit(_)))
            .collect();
        assert_eq!(emits.len(), 2);
        assert!(matches!(actions.last(), Some(Action::Finished(Ok(())))));
        assert!(ctx.is_finished());
    }

    #[test]
    fn wft_overrun_fails_after_wftmax_waits() {
        let mut ctx = SendContext::new(NodeId::new(0x02).unwrap(), vec![0u8; 16]);
        let now = Instant::now();
        ctx.poll(now, &cfg());
        let mut config = cfg();
        config.wftmax = 2;
        for _ in 0..2 {
            let actions = ctx.on_rx_fc(FlowStatus::Wait, 8, 0, now, &config);
            assert!(actions.iter().any(|a| matches!(a, Action::ArmTimer(_))) || ctx.is_finished());
        }
        assert!(ctx.is_finished());
        assert_eq!(ctx.take_result(), Some(Err(Error::WftOvrn)));
    }

    #[test]
    fn overflow_flow_status_fails_the_session() {
        let mut ctx = SendContext::new(NodeId::new(0x02).unwrap(), vec![0u8; 16]);
        let now = Instant::now();
        ctx.poll(now, &cfg());
        let actions = ctx.on_rx_fc(FlowStatus::Overflow, 0, 0, now, &cfg());
        assert!(matches!(actions.last(), Some(Action::Finished(Err(Error::BufferOverflw)))));
    }

    #[test]
    fn invalid_flow_status_fails_the_session_only_while_waiting_for_fc() {
        let mut ctx = SendContext::new(NodeId::new(0x02).unwrap(), vec![0u8; 16]);
        let now = Instant::now();
        ctx.poll(now, &cfg());
        let actions = ctx.on_invalid_fs();
        assert!(matches!(actions.last(), Some(Action::Finished(Err(Error::InvalidFs)))));
        assert!(ctx.is_finished());
    }

    #[test]
    fn invalid_flow_status_outside_wait_fc_is_a_no_op() {
        let mut ctx = SendContext::new(NodeId::new(0x02).unwrap(), vec![0u8; 16]);
        let actions = ctx.on_invalid_fs();
        assert!(actions.is_empty());
        assert!(!ctx.is_finished());
    }

    #[test]
    fn n_bs_timeout_while_waiting_for_flow_control() {
        let mut ctx = SendContext::new(NodeId::new(0x02).unwrap(), vec![0u8; 16]);
        let now = Instant::now();
        ctx.poll(now, &cfg());
        let actions = ctx.poll(now + Duration::from_millis(1100), &cfg());
        assert!(matches!(actions.last(), Some(Action::Finished(Err(Error::TimeoutBs)))));
    }
}
