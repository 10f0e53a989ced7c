//! UDP echo example - One ASCII channel talking to a simulated device
//!
//! A device thread answers every line it receives with the same line. The
//! engine sends a command to it with a blocking write and publishes the echo
//! as the new item state.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=netbind=debug cargo run --example udp_echo
//! ```

use config::Config;
use netbind::prelude::*;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Prints every state update the protocol publishes
struct PrintUpdates;

impl EventPublisher for PrintUpdates {
    fn post_update(&self, item: &str, state: &str) {
        println!("{item} is now {state:?}");
    }
}

/// Device that echoes every datagram back to its sender
fn run_device() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind device");
    let addr = socket.local_addr().expect("Device has no address");

    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        while let Ok((len, from)) = socket.recv_from(&mut buf) {
            let _ = socket.send_to(&buf[..len], from);
        }
    });

    addr
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::builder()
        .set_default("port", 0)
        .and_then(|b| b.set_default("listener_address", "127.0.0.1"))
        .and_then(|b| b.set_default("blocking", true))
        .and_then(|b| b.build())
        .expect("Failed to build config");

    let registry = ProtocolRegistry::with_builtin();
    let protocol = registry
        .create_configured(&config, "", Arc::new(PrintUpdates))
        .expect("Failed to create protocol");
    let engine = Arc::new(Engine::new(&config, protocol).expect("Failed to create engine"));
    engine.activate().expect("Failed to activate engine");

    let device = run_device();
    engine
        .bind(Subject::new("Amplifier", ANY_COMMAND, Direction::Out), device.into())
        .expect("Failed to bind channel");

    for command in ["PWR ON", "VOL 12", "PWR OFF"] {
        println!("Sending {command:?}");
        let outcome = engine
            .receive_command("Amplifier", command)
            .expect("Failed to send command");
        if outcome.update_state {
            println!("Amplifier is now {command:?}");
        }
        thread::sleep(Duration::from_millis(50));
    }

    engine.deactivate();
}
