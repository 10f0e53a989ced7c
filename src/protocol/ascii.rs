//! Line-oriented ASCII protocol.
//!
//! Commands are written as `preamble + command + postamble`. Inbound text
//! that equals a channel's command is published as the item state, and with
//! blocking writes the reply can become the state instead.

use super::{ChannelProtocol, EventPublisher};
use crate::channel::{Channel, ANY_COMMAND};
use crate::config::{get_namespaced_bool, get_namespaced_string, get_namespaced_u64, optional};
use crate::engine::Engine;
use crate::error::Error;
use ::config::Config;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_MS: u64 = 3000;
const DEFAULT_POSTAMBLE: &str = "\r\n";

pub struct AsciiProtocol {
    publisher: Arc<dyn EventPublisher>,
    timeout: Duration,
    blocking: bool,
    preamble: String,
    postamble: String,
    update_with_response: bool,
}

impl AsciiProtocol {
    /// Name under which the protocol is registered.
    pub const NAME: &'static str = "ascii";

    /// Reads `timeout`, `blocking`, `preamble`, `postamble` and
    /// `updatewithresponse`, preferring keys under `name`.
    ///
    /// Pre- and postamble may use `\r`, `\n`, `\t` and `\\` escapes.
    pub fn new(config: &Config, name: &str, publisher: Arc<dyn EventPublisher>) -> Result<Self, Error> {
        let timeout = optional(get_namespaced_u64(config, name, "timeout"))?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS));
        let blocking = optional(get_namespaced_bool(config, name, "blocking"))?.unwrap_or(false);
        let preamble = optional(get_namespaced_string(config, name, "preamble"))?
            .map(|s| unescape(&s))
            .unwrap_or_default();
        let postamble = optional(get_namespaced_string(config, name, "postamble"))?
            .map(|s| unescape(&s))
            .unwrap_or_else(|| DEFAULT_POSTAMBLE.to_string());
        let update_with_response =
            optional(get_namespaced_bool(config, name, "updatewithresponse"))?.unwrap_or(true);

        Ok(Self {
            publisher,
            timeout,
            blocking,
            preamble,
            postamble,
            update_with_response,
        })
    }

    /// [`ProtocolFactory`](super::ProtocolFactory) for the registry.
    pub fn create(
        config: &Config,
        name: &str,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Arc<dyn ChannelProtocol>, Error> {
        Ok(Arc::new(Self::new(config, name, publisher)?))
    }

    /// The bytes written for `command`.
    pub fn frame(&self, command: &str) -> Vec<u8> {
        format!("{}{}{}", self.preamble, command, self.postamble).into_bytes()
    }

    // Inbound text without the framing around it
    fn unframe<'a>(&self, text: &'a str) -> &'a str {
        let text = text.strip_prefix(self.preamble.as_str()).unwrap_or(text);
        let text = if self.postamble.is_empty() {
            text
        } else {
            text.strip_suffix(self.postamble.as_str()).unwrap_or(text)
        };
        text.trim_end_matches(['\r', '\n'])
    }
}

impl ChannelProtocol for AsciiProtocol {
    fn parse_buffer(&self, _engine: &Engine, channel: &Arc<Channel>, buffer: &[u8]) {
        let text = String::from_utf8_lossy(buffer);
        let text = self.unframe(&text);
        debug!(%channel, text, "Parsing ASCII buffer");

        if channel.command() == ANY_COMMAND {
            self.publisher.post_update(channel.item(), text);
        } else if channel.command() == text {
            self.publisher.post_update(channel.item(), channel.command());
        }
    }

    fn receive_channeled_command(&self, engine: &Engine, channel: &Arc<Channel>, command: &str) -> bool {
        match engine.write_buffer(channel, self.frame(command), self.blocking, self.timeout) {
            Ok(Some(response)) if self.update_with_response => {
                let text = String::from_utf8_lossy(&response);
                self.publisher.post_update(channel.item(), self.unframe(&text));
                false
            }
            Ok(_) => true,
            Err(err) => {
                warn!(%channel, command, ?err, "Failed to write command");
                false
            }
        }
    }
}

impl fmt::Debug for AsciiProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsciiProtocol")
            .field("timeout", &self.timeout)
            .field("blocking", &self.blocking)
            .field("preamble", &self.preamble)
            .field("postamble", &self.postamble)
            .field("update_with_response", &self.update_with_response)
            .finish_non_exhaustive()
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Direction, Subject};
    use crate::config::EngineConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(String, String)>>,
    }

    impl EventPublisher for Recorder {
        fn post_update(&self, item: &str, state: &str) {
            self.updates
                .lock()
                .unwrap()
                .push((item.to_string(), state.to_string()));
        }
    }

    fn fixture(pairs: &[(&str, &str)]) -> (Arc<Recorder>, Arc<AsciiProtocol>, Engine) {
        let mut builder = Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        let config = builder.build().unwrap();
        let recorder = Arc::new(Recorder::default());
        let protocol = Arc::new(AsciiProtocol::new(&config, "", recorder.clone()).unwrap());
        let engine = Engine::with_config("", EngineConfig::default(), protocol.clone()).unwrap();
        (recorder, protocol, engine)
    }

    fn channel(command: &str) -> Arc<Channel> {
        Arc::new(Channel::new(
            0,
            Subject::new("Light", command, Direction::In),
            "127.0.0.1:9999".parse().unwrap(),
        ))
    }

    #[test]
    fn unescapes_control_sequences() {
        assert_eq!(unescape(r"\r\n"), "\r\n");
        assert_eq!(unescape(r"a\tb\\c"), "a\tb\\c");
        assert_eq!(unescape(r"\x"), r"\x");
        assert_eq!(unescape("plain"), "plain");
    }

    #[test]
    fn frames_with_pre_and_postamble() {
        let (_, protocol, _) = fixture(&[("preamble", "@"), ("postamble", r"\r")]);
        assert_eq!(protocol.frame("PWR ON"), b"@PWR ON\r");

        let (_, protocol, _) = fixture(&[]);
        assert_eq!(protocol.frame("PING"), b"PING\r\n");
        assert_eq!(protocol.timeout, Duration::from_millis(3000));
        assert!(!protocol.blocking);
        assert!(protocol.update_with_response);
    }

    #[test]
    fn matching_text_publishes_command() {
        let (recorder, protocol, engine) = fixture(&[]);
        protocol.parse_buffer(&engine, &channel("ON"), b"ON\r\n");
        protocol.parse_buffer(&engine, &channel("ON"), b"OFF\r\n");
        protocol.parse_buffer(&engine, &channel("*"), b"VOLUME 12\r\n");

        let updates = recorder.updates.lock().unwrap();
        assert_eq!(
            *updates,
            vec![
                ("Light".to_string(), "ON".to_string()),
                ("Light".to_string(), "VOLUME 12".to_string()),
            ]
        );
    }

    #[test]
    fn command_on_inactive_engine_is_not_published() {
        let (recorder, protocol, engine) = fixture(&[]);
        assert!(!protocol.receive_channeled_command(&engine, &channel("ON"), "ON"));
        assert!(recorder.updates.lock().unwrap().is_empty());
    }
}
