//! Drives a single node through the bus address-claim procedure on a
//! [`LoopbackBus`] and prints the outcome. A second, already-present node
//! occupying the candidate address is simulated with `--collide`.

use clap::Parser;
use isotp_node::can::loopback::{LoopbackBus, LoopbackEndpoint};
use isotp_node::can::{CanEndpoint, CanFrame, NodeId};
use isotp_node::config::NodeConfig;
use isotp_node::node::claim::{initial_candidate, listen_filter, Action, AddressClaim};
use isotp_node::persist::{MemoryNodeIdStore, NodeIdStore};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Parser)]
struct Args {
    /// Candidate node id to start the claim from.
    #[arg(long, default_value_t = 0x10)]
    start_id: u8,

    /// Simulate another node already holding the candidate address by
    /// forcing the bus's tx error counter to rise after our claim frame.
    #[arg(long)]
    collide: bool,
}

fn main() {
    isotp_node::setup_logging();
    let args = Args::parse();

    let bus = LoopbackBus::new();
    let mut endpoint = LoopbackEndpoint::new(bus.clone());
    let cfg = NodeConfig::default();

    let fallback = NodeId::new_assignable(args.start_id).expect("valid candidate id");
    let store = Arc::new(Mutex::new(MemoryNodeIdStore::default()));
    let initial = initial_candidate(&*store.lock().unwrap(), fallback);
    let (claim, actions) = AddressClaim::start(initial, [0xAA; 8]);
    let claim = Arc::new(Mutex::new(claim));
    apply(&claim, &store, &mut endpoint, actions);

    let deadline = Instant::now() + Duration::from_secs(2);
    while !claim.lock().unwrap().is_finished() && Instant::now() < deadline {
        let now = Instant::now();
        let state = endpoint.get_state();
        let actions = claim.lock().unwrap().poll(now, &state, &cfg);
        let transitioned_to_wait_tx_confirm = actions
            .iter()
            .any(|a| matches!(a, Action::Emit(f) if f.data().len() == 8));
        apply(&claim, &store, &mut endpoint, actions);

        if transitioned_to_wait_tx_confirm {
            if args.collide {
                bus.inject_tx_error();
            }
            let state_after = endpoint.get_state();
            let actions = claim.lock().unwrap().on_claim_tx_complete(now, &state_after);
            apply(&claim, &store, &mut endpoint, actions);
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    if claim.lock().unwrap().is_finished() {
        println!("claim finished with candidate {:?}", claim.lock().unwrap().candidate());
    } else {
        println!("timed out before the claim settled");
    }
}

fn apply(
    claim: &Arc<Mutex<AddressClaim>>,
    store: &Arc<Mutex<MemoryNodeIdStore>>,
    endpoint: &mut LoopbackEndpoint,
    actions: Vec<Action>,
) {
    for action in actions {
        match action {
            Action::Emit(frame) => {
                println!("tx: id={:#010x} len={}", frame.id.raw(), frame.data().len());
                let _ = endpoint.send(&frame, Box::new(|_| {}));
            }
            Action::ArmTimer(d) => println!("timer armed for {:?}", d),
            Action::DisarmTimer => println!("timer disarmed"),
            Action::ListenFor(candidate) => {
                let claim_for_cb = claim.clone();
                let _ = endpoint.add_rx_filter(
                    listen_filter(),
                    Box::new(move |frame: CanFrame| {
                        let source = frame.id.source();
                        if source == candidate {
                            let _ = claim_for_cb.lock().unwrap().on_claim_seen(source, Instant::now());
                        }
                    }),
                );
            }
            Action::StopListening => {}
            Action::Claimed(id) => {
                store.lock().unwrap().save(id);
                println!("address claimed: {:?}", id);
            }
            Action::Failed => println!("address claim failed: candidate pool exhausted"),
        }
    }
}
