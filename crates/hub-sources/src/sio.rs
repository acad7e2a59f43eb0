//! Engine.IO v4 / Socket.IO v4 framing
//!
//! Only the subset needed by a listening client: the polling handshake,
//! the probe/upgrade exchange, ping/pong, namespace connect and event
//! packets.

use serde::Deserialize;

pub const PROBE: &str = "2probe";
pub const PROBE_ACK: &str = "3probe";
pub const UPGRADE: &str = "5";
pub const PING: &str = "2";
pub const PONG: &str = "3";
pub const CONNECT: &str = "40";

/// Upper bound on a reassembled frame
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Body of the Engine.IO open packet (`0{...}`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

/// Parse the polling handshake response
///
/// The body may carry several packets separated by `\x1e`; the first
/// JSON object after the open marker is used.
pub fn parse_open(body: &str) -> Option<OpenPacket> {
    let start = body.find('{')?;
    let mut stream = serde_json::Deserializer::from_str(&body[start..]).into_iter::<OpenPacket>();
    stream.next()?.ok()
}

/// Polling handshake URL for a server base URL
pub fn handshake_url(base: &str) -> String {
    format!("{}/socket.io/?EIO=4&transport=polling", http_base(base))
}

/// WebSocket upgrade URL for a server base URL and session id
pub fn upgrade_url(base: &str, sid: &str) -> String {
    let http = http_base(base);
    let ws = if let Some(rest) = http.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = http.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        http
    };
    format!("{}/socket.io/?EIO=4&transport=websocket&sid={}", ws, sid)
}

fn http_base(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = base.strip_suffix("/socket.io").unwrap_or(base);
    if let Some(rest) = base.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = base.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        base.to_string()
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open,
    Close,
    Ping,
    Pong,
    ProbeAck,
    Noop,
    /// Namespace connect acknowledged (`40` / `40{...}`)
    Connected,
    /// Namespace connect refused (`44{...}`)
    ConnectError(String),
    /// Server disconnected the namespace (`41`)
    Disconnect,
    Event {
        name: String,
        data: serde_json::Value,
    },
    Other(String),
}

/// Decode one complete frame
pub fn decode(frame: &str) -> Packet {
    match frame {
        PING => return Packet::Ping,
        PONG => return Packet::Pong,
        PROBE_ACK => return Packet::ProbeAck,
        "1" => return Packet::Close,
        "6" => return Packet::Noop,
        "41" => return Packet::Disconnect,
        _ => {}
    }
    if frame.starts_with('0') {
        return Packet::Open;
    }
    if frame == CONNECT || frame.starts_with("40{") || frame.starts_with("40/") {
        return Packet::Connected;
    }
    if let Some(rest) = frame.strip_prefix("44") {
        return Packet::ConnectError(rest.to_string());
    }
    if frame.starts_with("42") {
        if let Some((name, data)) = parse_event(frame) {
            return Packet::Event { name, data };
        }
    }
    Packet::Other(frame.to_string())
}

/// Split a `42[...]` frame into event name and payload
///
/// A namespace (`42/ns,`) or ack id (`4217[`) before the array is skipped.
pub fn parse_event(frame: &str) -> Option<(String, serde_json::Value)> {
    let body = frame.strip_prefix("42")?;
    let start = body.find('[')?;
    let array: serde_json::Value = serde_json::from_str(&body[start..]).ok()?;
    let mut items = match array {
        serde_json::Value::Array(items) => items.into_iter(),
        _ => return None,
    };
    let name = match items.next()? {
        serde_json::Value::String(s) => s,
        _ => return None,
    };
    let data = items.next().unwrap_or(serde_json::Value::Null);
    Some((name, data))
}

/// Outcome of feeding one transport chunk to the assembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// A complete frame
    Frame(String),
    /// Buffered, waiting for more chunks
    Pending,
    /// A partial frame was abandoned
    Dropped,
}

/// Reassembles event frames split across transport chunks
///
/// While a frame is buffered every chunk is first tried as its continuation.
/// The partial frame is abandoned only when appending makes the JSON
/// malformed; a digit-led chunk is then decoded as a packet of its own. An
/// event frame is complete once its JSON array parses.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: String,
    dropped: u64,
}

enum Completeness {
    Complete,
    Incomplete,
    Malformed,
}

fn event_completeness(frame: &str) -> Completeness {
    let Some(start) = frame.find('[') else {
        return Completeness::Incomplete;
    };
    match serde_json::from_str::<serde_json::Value>(&frame[start..]) {
        Ok(serde_json::Value::Array(_)) => Completeness::Complete,
        Ok(_) => Completeness::Malformed,
        Err(e) if e.is_eof() => Completeness::Incomplete,
        Err(_) => Completeness::Malformed,
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_buffering(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Partial frames abandoned so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Assembled> {
        let mut out = Vec::new();
        let starts_packet = chunk.as_bytes().first().is_some_and(u8::is_ascii_digit);

        if self.is_buffering() {
            let mut frame = std::mem::take(&mut self.buf);
            if frame == "4" {
                // Split inside the packet type
                frame.push_str(chunk);
                self.begin(frame, &mut out);
                return out;
            }
            if frame.len() + chunk.len() > MAX_FRAME_LEN {
                self.dropped += 1;
                out.push(Assembled::Dropped);
                if starts_packet {
                    self.begin(chunk.to_string(), &mut out);
                }
                return out;
            }
            frame.push_str(chunk);
            match event_completeness(&frame) {
                Completeness::Complete => out.push(Assembled::Frame(frame)),
                Completeness::Incomplete => {
                    self.buf = frame;
                    out.push(Assembled::Pending);
                }
                Completeness::Malformed => {
                    // Not a continuation; a digit-led chunk is a packet of its own
                    self.dropped += 1;
                    out.push(Assembled::Dropped);
                    if starts_packet {
                        self.begin(chunk.to_string(), &mut out);
                    }
                }
            }
            return out;
        }

        if !starts_packet {
            // Continuation with nothing to continue
            self.dropped += 1;
            out.push(Assembled::Dropped);
            return out;
        }
        self.begin(chunk.to_string(), &mut out);
        out
    }

    /// Start a new frame, buffering it if it is an unfinished event
    fn begin(&mut self, frame: String, out: &mut Vec<Assembled>) {
        let unfinished = frame == "4"
            || (frame.starts_with("42")
                && matches!(event_completeness(&frame), Completeness::Incomplete));
        if !unfinished {
            out.push(Assembled::Frame(frame));
        } else if frame.len() > MAX_FRAME_LEN {
            self.dropped += 1;
            out.push(Assembled::Dropped);
        } else {
            self.buf = frame;
            out.push(Assembled::Pending);
        }
    }

}

/// Summary stored as a Socket.IO source's last value
///
/// Payloads longer than 50 characters keep their first 45 followed by
/// `...(len)`.
pub fn summarize(data: &serde_json::Value) -> String {
    let text = data.to_string();
    let len = text.len();
    if len > 50 {
        let head: String = text.chars().take(45).collect();
        format!("{}...({})", head, len)
    } else {
        text
    }
}
