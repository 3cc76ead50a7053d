use hyper::header::HeaderValue;
use std::time::Duration;

pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(5);

// Clients allocate SPDY ping ids upward from 1, start far away from them.
const SPDY_PING_ID_BASE: u32 = 0x4000_0001;

/// Control frame written on an idle upgraded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingFrame {
    /// SPDY/3.1 PING control frame.
    Spdy,
    /// Masked client-to-server WebSocket ping.
    WebSocket,
    /// Protocol not recognised, nothing is sent.
    None,
}

impl PingFrame {
    /// Picks the frame from an `Upgrade` header, first recognised token wins.
    pub fn for_protocol(upgrade: Option<&HeaderValue>) -> Self {
        let protocol = upgrade
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        protocol
            .split(',')
            .map(str::trim)
            .find_map(|token| {
                if token.starts_with("spdy/3") {
                    Some(PingFrame::Spdy)
                } else if token == "websocket" {
                    Some(PingFrame::WebSocket)
                } else {
                    None
                }
            })
            .unwrap_or(PingFrame::None)
    }

    /// Frame for the protocol the backend switched to. Falls back to the
    /// client's offer when the 101 carries no `Upgrade` header.
    pub fn negotiated(response: Option<&HeaderValue>, offered: Option<&HeaderValue>) -> Self {
        match response {
            Some(value) => Self::for_protocol(Some(value)),
            None => Self::for_protocol(offered),
        }
    }

    /// Encodes the `sequence`-th ping of a session.
    pub fn encode(&self, sequence: u32) -> Option<Vec<u8>> {
        match self {
            PingFrame::Spdy => {
                let id = SPDY_PING_ID_BASE.wrapping_add(sequence.wrapping_mul(2));
                let mut frame = vec![0x80, 0x03, 0x00, 0x06, 0x00, 0x00, 0x00, 0x04];
                frame.extend_from_slice(&id.to_be_bytes());
                Some(frame)
            }
            PingFrame::WebSocket => {
                let mask: [u8; 4] = rand::random();
                let mut frame = vec![0x89, 0x80];
                frame.extend_from_slice(&mask);
                Some(frame)
            }
            PingFrame::None => None,
        }
    }
}

/// Follows the framing of the client's byte stream so pings are only ever
/// written between two frames.
#[derive(Debug, Clone)]
pub struct FrameTracker {
    frame: PingFrame,
    header: Vec<u8>,
    remaining: u64,
}

impl FrameTracker {
    pub fn new(frame: PingFrame) -> Self {
        Self {
            frame,
            header: Vec::with_capacity(14),
            remaining: 0,
        }
    }

    /// True when no frame is partially forwarded.
    pub fn at_boundary(&self) -> bool {
        self.header.is_empty() && self.remaining == 0
    }

    /// Accounts for bytes forwarded to the backend.
    pub fn observe(&mut self, mut data: &[u8]) {
        if self.frame == PingFrame::None {
            return;
        }
        while !data.is_empty() {
            if self.remaining > 0 {
                let take = data.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
                self.remaining -= take as u64;
                data = &data[take..];
                continue;
            }

            self.header.push(data[0]);
            data = &data[1..];
            if let Some(payload) = self.payload_len() {
                self.header.clear();
                self.remaining = payload;
            }
        }
    }

    // Payload length once the buffered header is complete.
    fn payload_len(&self) -> Option<u64> {
        let h = &self.header;
        match self.frame {
            // control bit, version/type, then flags and a 24-bit length
            PingFrame::Spdy => (h.len() == 8).then(|| u64::from(u32::from_be_bytes([0, h[5], h[6], h[7]]))),
            PingFrame::WebSocket => {
                if h.len() < 2 {
                    return None;
                }
                let mask = if h[1] & 0x80 != 0 { 4 } else { 0 };
                let (extended, payload) = match h[1] & 0x7f {
                    126 => (2, None),
                    127 => (8, None),
                    short => (0, Some(u64::from(short))),
                };
                if h.len() < 2 + extended + mask {
                    return None;
                }
                payload.or_else(|| {
                    let mut len = [0u8; 8];
                    len[8 - extended..].copy_from_slice(&h[2..2 + extended]);
                    Some(u64::from_be_bytes(len))
                })
            }
            PingFrame::None => Some(0),
        }
    }
}

/// Ticker settings for one upgrade session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    period: Duration,
    frame: PingFrame,
}

impl Keepalive {
    pub fn new(period: Duration, frame: PingFrame) -> Self {
        Self { period, frame }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, PingFrame::None)
    }

    pub fn is_enabled(&self) -> bool {
        !self.period.is_zero() && self.frame != PingFrame::None
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn frame(&self) -> PingFrame {
        self.frame
    }
}
