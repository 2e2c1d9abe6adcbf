//! DuckChat wire protocol.
//!
//! Every datagram begins with a 32-bit type tag. Fixed string fields are
//! NUL-padded byte arrays of the widths below; the variable-length shapes
//! carry `u32` counts followed by inline arrays of fixed-width items.
//! Integers travel in host byte order — the deployed clients expect it.

use thiserror::Error;

/// Width of a username field, including the terminating NUL.
pub const USERNAME_MAX: usize = 32;
/// Width of a channel-name field, including the terminating NUL.
pub const CHANNEL_MAX: usize = 32;
/// Width of a say-text or error-text field, including the terminating NUL.
pub const SAY_MAX: usize = 64;
/// Width of an `"ip:port"` address field, including the terminating NUL.
pub const IP_MAX: usize = 32;
/// Maximum number of channels a client may be subscribed to at once.
pub const MAX_CHANNELS: usize = 10;
/// Capacity of the duplicate-suppression ID cache.
pub const MSGQ_SIZE: usize = 48;
/// Minutes of silence before a user or neighbor is swept.
pub const REFRESH_RATE: u8 = 2;
/// The permanent default channel, present on every server.
pub const DEFAULT_CHANNEL: &str = "Common";
/// Receive buffer size, comfortably above the largest traversal packet.
pub const BUFF_SIZE: usize = 65536;

// Type tags. A dense enumeration shared with the client.
pub const REQ_VERIFY: u32 = 0;
pub const REQ_LOGIN: u32 = 1;
pub const REQ_LOGOUT: u32 = 2;
pub const REQ_JOIN: u32 = 3;
pub const REQ_LEAVE: u32 = 4;
pub const REQ_SAY: u32 = 5;
pub const REQ_LIST: u32 = 6;
pub const REQ_WHO: u32 = 7;
pub const REQ_KEEP_ALIVE: u32 = 8;
pub const TXT_SAY: u32 = 9;
pub const TXT_LIST: u32 = 10;
pub const TXT_WHO: u32 = 11;
pub const TXT_ERROR: u32 = 12;
pub const TXT_VERIFY: u32 = 13;
pub const REQ_S2S_JOIN: u32 = 14;
pub const REQ_S2S_LEAVE: u32 = 15;
pub const REQ_S2S_SAY: u32 = 16;
pub const REQ_S2S_LIST: u32 = 17;
pub const REQ_S2S_WHO: u32 = 18;
pub const REQ_S2S_VERIFY: u32 = 19;
pub const REQ_S2S_LEAF: u32 = 20;
pub const REQ_S2S_KEEP_ALIVE: u32 = 21;

/// Why a datagram failed to decode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown packet type {0}")]
    UnknownType(u32),

    #[error("payload count {count} exceeds remaining {remaining} bytes")]
    CountOutOfRange { count: u32, remaining: usize },
}

/// A decoded DuckChat datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    // Client → server requests.
    Verify { username: String },
    Login { username: String },
    Logout,
    Join { channel: String },
    Leave { channel: String },
    Say { channel: String, text: String },
    List,
    Who { channel: String },
    KeepAlive,

    // Server → client texts.
    TxtSay { channel: String, username: String, text: String },
    TxtList { channels: Vec<String> },
    TxtWho { channel: String, users: Vec<String> },
    TxtError { message: String },
    TxtVerify { valid: bool },

    // Server ↔ server.
    S2sJoin { channel: String },
    S2sLeave { channel: String },
    S2sSay { id: u64, username: String, channel: String, text: String },
    S2sList { id: u64, client: String, channels: Vec<String>, to_visit: Vec<String> },
    S2sWho { id: u64, client: String, channel: String, users: Vec<String>, to_visit: Vec<String> },
    S2sVerify { id: u64, username: String, client: String, to_visit: Vec<String> },
    S2sLeaf { id: u64, channel: String },
    S2sKeepAlive,
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_ne_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_ne_bytes());
}

/// Write `s` as a fixed-width NUL-padded field, clipping to `width - 1`
/// bytes so the field always terminates.
fn put_str(buf: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let mut end = bytes.len().min(width - 1);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.extend_from_slice(&bytes[..end]);
    buf.resize(buf.len() + (width - end), 0);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < n {
            return Err(PacketError::Truncated {
                need: self.pos + n,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, PacketError> {
        let b = self.take(8)?;
        Ok(u64::from_ne_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self, width: usize) -> Result<String, PacketError> {
        let raw = self.take(width)?;
        // A conforming sender NUL-terminates; a field packed to the brim
        // still gets clipped to width - 1, the same bound put_str enforces.
        let end = raw
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(width)
            .min(width.saturating_sub(1));
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn string_list(&mut self, count: u32, width: usize) -> Result<Vec<String>, PacketError> {
        match (count as usize).checked_mul(width) {
            Some(need) if need <= self.remaining() => {
                (0..count).map(|_| self.string(width)).collect()
            }
            _ => Err(PacketError::CountOutOfRange {
                count,
                remaining: self.remaining(),
            }),
        }
    }
}

impl Packet {
    /// True for the server-to-server packet family.
    pub fn is_s2s(&self) -> bool {
        matches!(
            self,
            Self::S2sJoin { .. }
                | Self::S2sLeave { .. }
                | Self::S2sSay { .. }
                | Self::S2sList { .. }
                | Self::S2sWho { .. }
                | Self::S2sVerify { .. }
                | Self::S2sLeaf { .. }
                | Self::S2sKeepAlive
        )
    }

    /// Serialize into the fixed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(160);
        match self {
            Self::Verify { username } => {
                put_u32(&mut buf, REQ_VERIFY);
                put_str(&mut buf, username, USERNAME_MAX);
            }
            Self::Login { username } => {
                put_u32(&mut buf, REQ_LOGIN);
                put_str(&mut buf, username, USERNAME_MAX);
            }
            Self::Logout => put_u32(&mut buf, REQ_LOGOUT),
            Self::Join { channel } => {
                put_u32(&mut buf, REQ_JOIN);
                put_str(&mut buf, channel, CHANNEL_MAX);
            }
            Self::Leave { channel } => {
                put_u32(&mut buf, REQ_LEAVE);
                put_str(&mut buf, channel, CHANNEL_MAX);
            }
            Self::Say { channel, text } => {
                put_u32(&mut buf, REQ_SAY);
                put_str(&mut buf, channel, CHANNEL_MAX);
                put_str(&mut buf, text, SAY_MAX);
            }
            Self::List => put_u32(&mut buf, REQ_LIST),
            Self::Who { channel } => {
                put_u32(&mut buf, REQ_WHO);
                put_str(&mut buf, channel, CHANNEL_MAX);
            }
            Self::KeepAlive => put_u32(&mut buf, REQ_KEEP_ALIVE),

            Self::TxtSay {
                channel,
                username,
                text,
            } => {
                put_u32(&mut buf, TXT_SAY);
                put_str(&mut buf, channel, CHANNEL_MAX);
                put_str(&mut buf, username, USERNAME_MAX);
                put_str(&mut buf, text, SAY_MAX);
            }
            Self::TxtList { channels } => {
                put_u32(&mut buf, TXT_LIST);
                put_u32(&mut buf, channels.len() as u32);
                for channel in channels {
                    put_str(&mut buf, channel, CHANNEL_MAX);
                }
            }
            Self::TxtWho { channel, users } => {
                put_u32(&mut buf, TXT_WHO);
                put_u32(&mut buf, users.len() as u32);
                put_str(&mut buf, channel, CHANNEL_MAX);
                for user in users {
                    put_str(&mut buf, user, USERNAME_MAX);
                }
            }
            Self::TxtError { message } => {
                put_u32(&mut buf, TXT_ERROR);
                put_str(&mut buf, message, SAY_MAX);
            }
            Self::TxtVerify { valid } => {
                put_u32(&mut buf, TXT_VERIFY);
                put_u32(&mut buf, *valid as u32);
            }

            Self::S2sJoin { channel } => {
                put_u32(&mut buf, REQ_S2S_JOIN);
                put_str(&mut buf, channel, CHANNEL_MAX);
            }
            Self::S2sLeave { channel } => {
                put_u32(&mut buf, REQ_S2S_LEAVE);
                put_str(&mut buf, channel, CHANNEL_MAX);
            }
            Self::S2sSay {
                id,
                username,
                channel,
                text,
            } => {
                put_u32(&mut buf, REQ_S2S_SAY);
                put_u64(&mut buf, *id);
                put_str(&mut buf, username, USERNAME_MAX);
                put_str(&mut buf, channel, CHANNEL_MAX);
                put_str(&mut buf, text, SAY_MAX);
            }
            Self::S2sList {
                id,
                client,
                channels,
                to_visit,
            } => {
                put_u32(&mut buf, REQ_S2S_LIST);
                put_u64(&mut buf, *id);
                put_str(&mut buf, client, IP_MAX);
                put_u32(&mut buf, channels.len() as u32);
                put_u32(&mut buf, to_visit.len() as u32);
                for channel in channels {
                    put_str(&mut buf, channel, CHANNEL_MAX);
                }
                for peer in to_visit {
                    put_str(&mut buf, peer, IP_MAX);
                }
            }
            Self::S2sWho {
                id,
                client,
                channel,
                users,
                to_visit,
            } => {
                put_u32(&mut buf, REQ_S2S_WHO);
                put_u64(&mut buf, *id);
                put_str(&mut buf, client, IP_MAX);
                put_str(&mut buf, channel, CHANNEL_MAX);
                put_u32(&mut buf, users.len() as u32);
                put_u32(&mut buf, to_visit.len() as u32);
                for user in users {
                    put_str(&mut buf, user, USERNAME_MAX);
                }
                for peer in to_visit {
                    put_str(&mut buf, peer, IP_MAX);
                }
            }
            Self::S2sVerify {
                id,
                username,
                client,
                to_visit,
            } => {
                put_u32(&mut buf, REQ_S2S_VERIFY);
                put_u64(&mut buf, *id);
                put_str(&mut buf, username, USERNAME_MAX);
                put_str(&mut buf, client, IP_MAX);
                put_u32(&mut buf, to_visit.len() as u32);
                for peer in to_visit {
                    put_str(&mut buf, peer, IP_MAX);
                }
            }
            Self::S2sLeaf { id, channel } => {
                put_u32(&mut buf, REQ_S2S_LEAF);
                put_u64(&mut buf, *id);
                put_str(&mut buf, channel, CHANNEL_MAX);
            }
            Self::S2sKeepAlive => put_u32(&mut buf, REQ_S2S_KEEP_ALIVE),
        }
        buf
    }

    /// Parse a datagram. Unknown type tags surface as an error the caller
    /// drops silently.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(buf);
        let packet = match r.u32()? {
            REQ_VERIFY => Self::Verify {
                username: r.string(USERNAME_MAX)?,
            },
            REQ_LOGIN => Self::Login {
                username: r.string(USERNAME_MAX)?,
            },
            REQ_LOGOUT => Self::Logout,
            REQ_JOIN => Self::Join {
                channel: r.string(CHANNEL_MAX)?,
            },
            REQ_LEAVE => Self::Leave {
                channel: r.string(CHANNEL_MAX)?,
            },
            REQ_SAY => Self::Say {
                channel: r.string(CHANNEL_MAX)?,
                text: r.string(SAY_MAX)?,
            },
            REQ_LIST => Self::List,
            REQ_WHO => Self::Who {
                channel: r.string(CHANNEL_MAX)?,
            },
            REQ_KEEP_ALIVE => Self::KeepAlive,

            TXT_SAY => Self::TxtSay {
                channel: r.string(CHANNEL_MAX)?,
                username: r.string(USERNAME_MAX)?,
                text: r.string(SAY_MAX)?,
            },
            TXT_LIST => {
                let count = r.u32()?;
                Self::TxtList {
                    channels: r.string_list(count, CHANNEL_MAX)?,
                }
            }
            TXT_WHO => {
                let count = r.u32()?;
                Self::TxtWho {
                    channel: r.string(CHANNEL_MAX)?,
                    users: r.string_list(count, USERNAME_MAX)?,
                }
            }
            TXT_ERROR => Self::TxtError {
                message: r.string(SAY_MAX)?,
            },
            TXT_VERIFY => Self::TxtVerify {
                valid: r.u32()? != 0,
            },

            REQ_S2S_JOIN => Self::S2sJoin {
                channel: r.string(CHANNEL_MAX)?,
            },
            REQ_S2S_LEAVE => Self::S2sLeave {
                channel: r.string(CHANNEL_MAX)?,
            },
            REQ_S2S_SAY => Self::S2sSay {
                id: r.u64()?,
                username: r.string(USERNAME_MAX)?,
                channel: r.string(CHANNEL_MAX)?,
                text: r.string(SAY_MAX)?,
            },
            REQ_S2S_LIST => {
                let id = r.u64()?;
                let client = r.string(IP_MAX)?;
                let nchannels = r.u32()?;
                let nto_visit = r.u32()?;
                Self::S2sList {
                    id,
                    client,
                    channels: r.string_list(nchannels, CHANNEL_MAX)?,
                    to_visit: r.string_list(nto_visit, IP_MAX)?,
                }
            }
            REQ_S2S_WHO => {
                let id = r.u64()?;
                let client = r.string(IP_MAX)?;
                let channel = r.string(CHANNEL_MAX)?;
                let nusers = r.u32()?;
                let nto_visit = r.u32()?;
                Self::S2sWho {
                    id,
                    client,
                    channel,
                    users: r.string_list(nusers, USERNAME_MAX)?,
                    to_visit: r.string_list(nto_visit, IP_MAX)?,
                }
            }
            REQ_S2S_VERIFY => {
                let id = r.u64()?;
                let username = r.string(USERNAME_MAX)?;
                let client = r.string(IP_MAX)?;
                let nto_visit = r.u32()?;
                Self::S2sVerify {
                    id,
                    username,
                    client,
                    to_visit: r.string_list(nto_visit, IP_MAX)?,
                }
            }
            REQ_S2S_LEAF => Self::S2sLeaf {
                id: r.u64()?,
                channel: r.string(CHANNEL_MAX)?,
            },
            REQ_S2S_KEEP_ALIVE => Self::S2sKeepAlive,

            other => return Err(PacketError::UnknownType(other)),
        };
        Ok(packet)
    }
}
