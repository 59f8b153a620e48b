//! Binds two ISO-TP engines over a [`LoopbackEndpoint`] pair and sends a
//! message from one to the other, printing what each side observed.

use clap::Parser;
use isotp_node::can::loopback::{LoopbackBus, LoopbackEndpoint};
use isotp_node::can::NodeId;
use isotp_node::config::IsotpConfig;
use isotp_node::isotp::{IsoTpAddr, IsoTpEngine, IsoTpOpts};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Parser)]
struct Args {
    /// Payload length in bytes to send.
    #[arg(long, default_value_t = 16)]
    len: usize,
}

fn addr(local: NodeId, peer: NodeId) -> IsoTpAddr {
    use isotp_node::can::CanId;
    IsoTpAddr::fixed(CanId::fixed(6, 0xDA, local, peer))
}

fn main() {
    isotp_node::setup_logging();
    let args = Args::parse();

    let bus = LoopbackBus::new();
    let mut sender_ep = LoopbackEndpoint::new(bus.clone());
    let mut receiver_ep = LoopbackEndpoint::new(bus);

    let local = NodeId::new(0x01).unwrap();
    let peer = NodeId::new(0x02).unwrap();

    let received: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let r = received.clone();
    let mut receiver = IsoTpEngine::bind(
        &mut receiver_ep,
        addr(peer, local),
        IsoTpOpts::default(),
        IsotpConfig::default(),
        Box::new(move |buf, sender| {
            println!("receiver: delivered {} bytes from {:?}", buf.len(), sender);
            *r.lock().unwrap() = Some(buf);
        }),
        Box::new(|err, sender| println!("receiver: error {:?} from {:?}", err, sender)),
        Box::new(|_, _| {}),
    )
    .unwrap();

    let mut sender = IsoTpEngine::bind(
        &mut sender_ep,
        addr(local, peer),
        IsoTpOpts::default(),
        IsotpConfig::default(),
        Box::new(|_, _| {}),
        Box::new(|_, _| {}),
        Box::new(|result, peer| println!("sender: sent_cb {:?} for {:?}", result, peer)),
    )
    .unwrap();

    let payload: Vec<u8> = (0..args.len).map(|i| i as u8).collect();
    sender.send(&mut sender_ep, payload, peer).unwrap();

    let start = Instant::now();
    while received.lock().unwrap().is_none() && start.elapsed() < Duration::from_secs(1) {
        let now = Instant::now();
        sender.poll(&mut sender_ep, now);
        receiver.poll(&mut receiver_ep, now);
    }

    match received.lock().unwrap().as_ref() {
        Some(buf) => println!("round-trip complete: {} bytes delivered", buf.len()),
        None => println!("timed out waiting for delivery"),
    }
}
