#![allow(dead_code)]

use netbind::prelude::*;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("netbind={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Recording protocol
// ============================================================================

/// Protocol that writes commands verbatim and records everything it sees.
#[derive(Default)]
pub struct Recorder {
    parsed: Mutex<Vec<(String, Vec<u8>)>>,
    configured: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn parsed(&self) -> Vec<(String, Vec<u8>)> {
        self.parsed.lock().unwrap().clone()
    }

    pub fn parsed_for(&self, item: &str) -> Vec<Vec<u8>> {
        self.parsed()
            .into_iter()
            .filter(|(i, _)| i == item)
            .map(|(_, buffer)| buffer)
            .collect()
    }

    pub fn configured(&self) -> Vec<String> {
        self.configured.lock().unwrap().clone()
    }
}

impl ChannelProtocol for Recorder {
    fn configure_channel(&self, _engine: &Engine, channel: &Arc<Channel>) {
        self.configured
            .lock()
            .unwrap()
            .push(channel.item().to_string());
    }

    fn parse_buffer(&self, _engine: &Engine, channel: &Arc<Channel>, buffer: &[u8]) {
        self.parsed
            .lock()
            .unwrap()
            .push((channel.item().to_string(), buffer.to_vec()));
    }

    fn receive_channeled_command(&self, engine: &Engine, channel: &Arc<Channel>, command: &str) -> bool {
        engine
            .write_buffer(channel, command.as_bytes().to_vec(), false, Duration::ZERO)
            .is_ok()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Config with an ephemeral loopback listener plus `pairs`.
pub fn build_config(pairs: &[(&str, &str)]) -> config::Config {
    let mut builder = config::Config::builder()
        .set_default("port", "0")
        .unwrap()
        .set_default("listener_address", "127.0.0.1")
        .unwrap();
    for (key, value) in pairs {
        builder = builder.set_override(*key, *value).unwrap();
    }
    builder.build().unwrap()
}

pub fn new_engine(pairs: &[(&str, &str)]) -> (Arc<Engine>, Arc<Recorder>) {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let engine = Engine::new(&build_config(pairs), recorder.clone()).expect("Failed to create engine");
    (Arc::new(engine), recorder)
}

pub fn out(item: &str, command: &str) -> Subject {
    Subject::new(item, command, Direction::Out)
}

pub fn inbound(item: &str) -> Subject {
    Subject::new(item, ANY_COMMAND, Direction::In)
}

/// Runs poll cycles until `condition` holds or `timeout` passes.
pub fn poll_until<F>(engine: &Engine, timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        engine.poll_cycle().expect("Poll cycle failed");
        if condition() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Waits for `condition` while the engine's own ticker runs.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() <= deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn udp_peer(addr: &str) -> UdpSocket {
    let peer = UdpSocket::bind(addr).expect("Failed to bind peer");
    peer.set_read_timeout(Some(Duration::from_millis(5)))
        .expect("Failed to set read timeout");
    peer
}

/// Polls `engine` until `peer` receives a datagram.
pub fn recv_polling(engine: &Engine, peer: &UdpSocket, timeout: Duration) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = [0u8; 1024];
    let mut received = None;
    poll_until(engine, timeout, || match peer.recv_from(&mut buf) {
        Ok((len, from)) => {
            received = Some((buf[..len].to_vec(), from));
            true
        }
        Err(_) => false,
    });
    received
}

/// Spawns a peer that answers every datagram with `reply(request)`.
pub fn spawn_responder<F>(reply: F) -> (SocketAddr, thread::JoinHandle<()>)
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind responder");
    socket
        .set_read_timeout(Some(Duration::from_millis(50)))
        .expect("Failed to set read timeout");
    let addr = socket.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut buf = [0u8; 1024];
        while Instant::now() < deadline {
            if let Ok((len, from)) = socket.recv_from(&mut buf) {
                if buf[..len] == *b"QUIT" {
                    break;
                }
                if let Some(response) = reply(&buf[..len]) {
                    let _ = socket.send_to(&response, from);
                }
            }
        }
    });
    (addr, handle)
}

pub fn stop_responder(addr: SocketAddr, handle: thread::JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let _ = socket.send_to(b"QUIT", addr);
    handle.join().unwrap();
}
