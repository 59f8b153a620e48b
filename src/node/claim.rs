//! Bus address-claim procedure (spec.md §4.4), grounded on
//! `thingset_can_init_inst` in original_source/src/can.c: discovery frame,
//! listen window, claim frame with EUI-64 tiebreak payload, and bus
//! tx-error-counter sampling for collision detection.

use crate::can::{BusState, CanFilter, CanFrame, CanId, FrameFlags, NodeId};
use crate::config::NodeConfig;
use crate::isotp::timer::Timer;
use crate::persist::NodeIdStore;
use rand::Rng;
use std::time::Instant;

/// Picks the candidate to start a claim from: the last id a [`NodeIdStore`]
/// persisted, or `fallback` (e.g. a factory default) if none was ever saved.
pub fn initial_candidate(store: &dyn NodeIdStore, fallback: NodeId) -> NodeId {
    store.load().unwrap_or(fallback)
}

/// Network-management message-type subfield (highest priority class), per
/// spec.md §6's CAN id layout.
const MSG_TYPE_NETWORK: u8 = super::MsgType::Network as u8;
/// Highest configured network-management priority (spec.md §4.4).
const CLAIM_PRIORITY: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendDiscovery,
    Listening,
    SendClaim,
    WaitTxConfirm,
    Done,
    Failed,
}

/// What the owning driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Emit(CanFrame),
    ArmTimer(std::time::Duration),
    DisarmTimer,
    /// Install a filter matching claim frames from `candidate`, so a
    /// concurrent claim by another node for the same id can be detected.
    ListenFor(NodeId),
    StopListening,
    Claimed(NodeId),
    Failed,
}

/// Drives one node through discovery, listen, claim, and collision-retry.
pub struct AddressClaim {
    candidate: NodeId,
    eui64: [u8; 8],
    state: State,
    timer: Timer,
    bus_before: BusState,
    attempts: u32,
}

/// Bounds the number of candidate re-randomizations before giving up; the
/// original procedure retries indefinitely, but an embedded node should not
/// spin forever on a persistently contested segment.
const MAX_ATTEMPTS: u32 = 64;

impl AddressClaim {
    pub fn start(initial: NodeId, eui64: [u8; 8]) -> (Self, Vec<Action>) {
        let mut claim = AddressClaim {
            candidate: initial,
            eui64,
            state: State::SendDiscovery,
            timer: Timer::new(),
            bus_before: BusState::default(),
            attempts: 0,
        };
        let mut actions = Vec::new();
        claim.send_discovery(Instant::now(), &mut actions);
        (claim, actions)
    }

    pub fn candidate(&self) -> NodeId {
        self.candidate
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    fn discovery_frame(&self) -> CanFrame {
        let id = CanId::fixed(CLAIM_PRIORITY, MSG_TYPE_NETWORK, self.candidate, NodeId::ANONYMOUS);
        CanFrame::new(id, FrameFlags::EXTENDED, &[]).expect("empty discovery payload fits")
    }

    fn claim_frame(&self) -> CanFrame {
        let id = CanId::fixed(CLAIM_PRIORITY, MSG_TYPE_NETWORK, NodeId::BROADCAST, self.candidate);
        CanFrame::new(id, FrameFlags::EXTENDED, &self.eui64).expect("EUI-64 fits a classical frame")
    }

    fn send_discovery(&mut self, now: Instant, actions: &mut Vec<Action>) {
        actions.push(Action::Emit(self.discovery_frame()));
        actions.push(Action::ListenFor(self.candidate));
        self.timer.arm(now, std::time::Duration::from_millis(500));
        actions.push(Action::ArmTimer(std::time::Duration::from_millis(500)));
        self.state = State::Listening;
    }

    fn pick_new_candidate(&mut self) {
        let mut rng = rand::thread_rng();
        self.candidate = NodeId::new_assignable(rng.gen_range(NodeId::MIN..=NodeId::MAX))
            .expect("gen_range stays within the assignable bound");
    }

    /// A claim frame was observed whose source equals our current candidate:
    /// someone else already holds it. Re-randomize and restart discovery.
    pub fn on_claim_seen(&mut self, source: NodeId, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != State::Listening || source != self.candidate {
            return actions;
        }
        self.timer.disarm();
        actions.push(Action::DisarmTimer);
        actions.push(Action::StopListening);
        self.retry(now, &mut actions);
        actions
    }

    fn retry(&mut self, now: Instant, actions: &mut Vec<Action>) {
        self.attempts += 1;
        if self.attempts >= MAX_ATTEMPTS {
            self.state = State::Failed;
            actions.push(Action::Failed);
            return;
        }
        self.pick_new_candidate();
        self.send_discovery(now, actions);
    }

    /// Advances timer-driven transitions: the listen window elapsing, or the
    /// tx-confirmation wait elapsing without a confirmation.
    pub fn poll(&mut self, now: Instant, state: &BusState, cfg: &NodeConfig) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.timer.poll(now) {
            return actions;
        }
        match self.state {
            State::Listening => {
                actions.push(Action::StopListening);
                self.bus_before = *state;
                actions.push(Action::Emit(self.claim_frame()));
                self.timer.arm(now, cfg.claim_tx_confirm);
                actions.push(Action::ArmTimer(cfg.claim_tx_confirm));
                self.state = State::WaitTxConfirm;
            }
            State::WaitTxConfirm => {
                // No tx-confirmation arrived in time: treat like a failed
                // send and retry with a fresh candidate.
                self.retry(now, &mut actions);
            }
            _ => {}
        }
        actions
    }

    /// The CAN driver confirmed transmission of our claim frame.
    pub fn on_claim_tx_complete(&mut self, now: Instant, state_after: &BusState) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != State::WaitTxConfirm {
            return actions;
        }
        self.timer.disarm();
        actions.push(Action::DisarmTimer);
        if state_after.tx_err_cnt > self.bus_before.tx_err_cnt {
            self.retry(now, &mut actions);
        } else {
            self.state = State::Done;
            actions.push(Action::Claimed(self.candidate));
        }
        actions
    }
}

/// Installs the discovery-phase listen filter: matches claim frames
/// (network-management type, broadcast target) from any source, letting the
/// caller check `frame.id.source() == candidate` itself.
pub fn listen_filter() -> CanFilter {
    CanFilter {
        id: CanId::fixed(CLAIM_PRIORITY, MSG_TYPE_NETWORK, NodeId::BROADCAST, NodeId::ANONYMOUS),
        mask: CanId::EFF_MASK & !0xFF,
        flags: FrameFlags::EXTENDED,
    }
}
