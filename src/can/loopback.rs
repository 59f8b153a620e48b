//! A minimal in-process [`CanEndpoint`](super::CanEndpoint) used by tests and
//! the `demos/` binaries. It behaves like two SocketCAN interfaces wired back
//! to back with `vcan_tests` in the teacher crate, except everything lives in
//! one process: frames written on one handle are dispatched, synchronously,
//! to every filter installed via the other handle sharing the same bus.

use super::{BusMode, BusState, CanEndpoint, CanError, CanFilter, CanFrame, FilterId, SendOutcome};
use std::sync::{Arc, Mutex};

struct Filter {
    id: FilterId,
    spec: CanFilter,
    on_frame: Box<dyn FnMut(CanFrame) + Send>,
}

struct Bus {
    filters: Vec<Filter>,
    next_filter_id: u32,
    state: BusState,
}

/// A shared virtual CAN bus. Clone [`LoopbackEndpoint`] handles from the same
/// `LoopbackBus` to simulate multiple nodes on one segment.
#[derive(Clone)]
pub struct LoopbackBus(Arc<Mutex<Bus>>);

impl LoopbackBus {
    pub fn new() -> Self {
        LoopbackBus(Arc::new(Mutex::new(Bus {
            filters: Vec::new(),
            next_filter_id: 0,
            state: BusState::default(),
        })))
    }

    /// Forces the bus's reported tx error count to rise, simulating a frame
    /// collision for address-claim collision-detection tests.
    pub fn inject_tx_error(&self) {
        self.0.lock().unwrap().state.tx_err_cnt += 1;
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of a [`LoopbackBus`].
pub struct LoopbackEndpoint {
    bus: LoopbackBus,
    mode: BusMode,
}

impl LoopbackEndpoint {
    pub fn new(bus: LoopbackBus) -> Self {
        LoopbackEndpoint {
            bus,
            mode: BusMode::Normal,
        }
    }
}

impl CanEndpoint for LoopbackEndpoint {
    fn send(
        &mut self,
        frame: &CanFrame,
        completion: Box<dyn FnOnce(super::SendCompletion) + Send>,
    ) -> Result<SendOutcome, CanError> {
        let mut bus = self.bus.0.lock().unwrap();
        for filter in bus.filters.iter_mut() {
            if (frame.id.raw() & filter.spec.mask) == (filter.spec.id.raw() & filter.spec.mask) {
                (filter.on_frame)(frame.clone());
            }
        }
        drop(bus);
        completion(Ok(()));
        Ok(SendOutcome::Ok)
    }

    fn add_rx_filter(
        &mut self,
        filter: CanFilter,
        on_frame: Box<dyn FnMut(CanFrame) + Send>,
    ) -> Result<FilterId, CanError> {
        let mut bus = self.bus.0.lock().unwrap();
        let id = FilterId(bus.next_filter_id);
        bus.next_filter_id += 1;
        bus.filters.push(Filter {
            id,
            spec: filter,
            on_frame,
        });
        Ok(id)
    }

    fn remove_rx_filter(&mut self, filter_id: FilterId) {
        let mut bus = self.bus.0.lock().unwrap();
        bus.filters.retain(|f| f.id != filter_id);
    }

    fn get_state(&self) -> BusState {
        self.bus.0.lock().unwrap().state
    }

    fn start(&mut self) {}

    fn set_mode(&mut self, mode: BusMode) {
        self.mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::{CanId, FrameFlags};
    use std::sync::mpsc;

    #[test]
    fn frames_are_delivered_to_matching_filters() {
        let bus = LoopbackBus::new();
        let mut a = LoopbackEndpoint::new(bus.clone());
        let mut b = LoopbackEndpoint::new(bus);

        let (tx, rx) = mpsc::channel();
        b.add_rx_filter(
            CanFilter {
                id: CanId::new(0x100),
                mask: CanId::EFF_MASK,
                flags: FrameFlags::EXTENDED,
            },
            Box::new(move |frame| tx.send(frame).unwrap()),
        )
        .unwrap();

        let frame = CanFrame::new(CanId::new(0x100), FrameFlags::EXTENDED, &[1, 2, 3]).unwrap();
        a.send(&frame, Box::new(|_| {})).unwrap();

        let received = rx.try_recv().unwrap();
        assert_eq!(received.data(), &[1, 2, 3]);
    }

    #[test]
    fn unmatched_frames_are_not_delivered() {
        let bus = LoopbackBus::new();
        let mut a = LoopbackEndpoint::new(bus.clone());
        let mut b = LoopbackEndpoint::new(bus);

        let (tx, rx) = mpsc::channel::<CanFrame>();
        b.add_rx_filter(
            CanFilter {
                id: CanId::new(0x100),
                mask: CanId::EFF_MASK,
                flags: FrameFlags::EXTENDED,
            },
            Box::new(move |frame| tx.send(frame).unwrap()),
        )
        .unwrap();

        let frame = CanFrame::new(CanId::new(0x200), FrameFlags::EXTENDED, &[]).unwrap();
        a.send(&frame, Box::new(|_| {})).unwrap();

        assert!(rx.try_recv().is_err());
    }
}
