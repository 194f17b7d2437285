//! Telnet negotiation codec.
//!
//! Implements tokio's `Decoder` and `Encoder` traits for the byte stream of a
//! telnet-mode socket. Decoding strips IAC command sequences and collapses
//! `IAC IAC` to a literal 0xFF; a command split across reads is held in the
//! codec state until the rest arrives. Encoding escapes 0xFF.
//!
//! In tn3270 mode bytes pass through unmodified in both directions; tn3270
//! framing is handled by the front-end.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

pub const IAC_EOR: u8 = 239;
pub const IAC_SE: u8 = 240;
pub const IAC_NOP: u8 = 241;
pub const IAC_BREAK: u8 = 243;
pub const IAC_IP: u8 = 244;
pub const IAC_SB: u8 = 250;
pub const IAC_WILL: u8 = 251;
pub const IAC_WONT: u8 = 252;
pub const IAC_DO: u8 = 253;
pub const IAC_DONT: u8 = 254;
pub const IAC: u8 = 255;

/// Telnet option codes used by the greetings.
pub mod option {
    pub const BINARY: u8 = 0;
    pub const ECHO: u8 = 1;
    pub const SUPPRESS_GO_AHEAD: u8 = 3;
    pub const TERMINAL_TYPE: u8 = 24;
    pub const END_OF_RECORD: u8 = 25;
    /// TERMINAL-TYPE subnegotiation `SEND`.
    pub const TTYPE_SEND: u8 = 1;
}

/// Capacity of the greeting buffer.
pub const GREETING_MAX: usize = 21;

/// Which telnet dialect a socket speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetMode {
    /// Plain telnet: strip commands, escape 0xFF.
    Telnet,
    /// tn3270: greeting only, no stripping or escaping.
    Tn3270,
}

/// The option negotiation sent to a peer before any data, tracked by send
/// offset so a partial write resumes where it stopped.
#[derive(Debug, Clone)]
pub struct TelnetGreeting {
    buf: [u8; GREETING_MAX],
    len: usize,
    offset: usize,
}

impl TelnetGreeting {
    #[must_use]
    pub fn new(mode: TelnetMode) -> Self {
        use option::*;

        let mut greeting = Self {
            buf: [0; GREETING_MAX],
            len: 0,
            offset: 0,
        };
        match mode {
            TelnetMode::Telnet => {
                greeting.push(&[IAC, IAC_WILL, ECHO]);
                greeting.push(&[IAC, IAC_WILL, SUPPRESS_GO_AHEAD]);
                greeting.push(&[IAC, IAC_WILL, BINARY]);
                greeting.push(&[IAC, IAC_DO, BINARY]);
            }
            TelnetMode::Tn3270 => {
                greeting.push(&[IAC, IAC_DO, END_OF_RECORD]);
                greeting.push(&[IAC, IAC_WILL, END_OF_RECORD]);
                greeting.push(&[IAC, IAC_DO, BINARY]);
                greeting.push(&[IAC, IAC_WILL, BINARY]);
                greeting.push(&[IAC, IAC_DO, TERMINAL_TYPE]);
                greeting.push(&[IAC, IAC_SB, TERMINAL_TYPE, TTYPE_SEND, IAC, IAC_SE]);
            }
        }
        greeting
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    /// The whole greeting.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Bytes not yet sent.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.offset..self.len]
    }

    /// Record that `n` more bytes went out.
    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.len);
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.offset == self.len
    }
}

/// One decoded unit of inbound telnet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetFrame {
    /// Payload bytes for the front-end.
    Data(Bytes),
    /// The peer sent `IAC BREAK`.
    Break,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Negotiate(u8),
    Subnegotiation,
    SubnegotiationIac,
}

/// Codec for telnet-mode socket traffic.
#[derive(Debug, Clone)]
pub struct TelnetCodec {
    mode: TelnetMode,
    state: State,
    payload: BytesMut,
    pending_break: bool,
}

impl TelnetCodec {
    #[must_use]
    pub fn new(mode: TelnetMode) -> Self {
        Self {
            mode,
            state: State::Data,
            payload: BytesMut::new(),
            pending_break: false,
        }
    }

    #[must_use]
    pub fn mode(&self) -> TelnetMode {
        self.mode
    }

    /// Whether a command sequence is partly consumed.
    #[must_use]
    pub fn in_command(&self) -> bool {
        self.state != State::Data
    }

    /// Escape `src` for the wire, appending to `dst`.
    pub fn escape_into(&self, src: &[u8], dst: &mut BytesMut) {
        if self.mode == TelnetMode::Tn3270 {
            dst.extend_from_slice(src);
            return;
        }
        dst.reserve(src.len());
        for &b in src {
            if b == IAC {
                dst.put_u8(IAC);
            }
            dst.put_u8(b);
        }
    }

    fn take_payload(&mut self) -> Option<TelnetFrame> {
        if self.payload.is_empty() {
            None
        } else {
            Some(TelnetFrame::Data(self.payload.split().freeze()))
        }
    }
}

impl Decoder for TelnetCodec {
    type Item = TelnetFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if std::mem::take(&mut self.pending_break) {
            return Ok(Some(TelnetFrame::Break));
        }
        if self.mode == TelnetMode::Tn3270 {
            if src.is_empty() {
                return Ok(None);
            }
            return Ok(Some(TelnetFrame::Data(src.split().freeze())));
        }

        while src.has_remaining() {
            let b = src.get_u8();
            self.state = match self.state {
                State::Data if b == IAC => State::Iac,
                State::Data => {
                    self.payload.put_u8(b);
                    State::Data
                }
                State::Iac => match b {
                    IAC => {
                        self.payload.put_u8(IAC);
                        State::Data
                    }
                    IAC_WILL..=IAC_DONT => State::Negotiate(b),
                    IAC_SB => State::Subnegotiation,
                    IAC_BREAK => {
                        self.state = State::Data;
                        return Ok(match self.take_payload() {
                            Some(data) => {
                                self.pending_break = true;
                                Some(data)
                            }
                            None => Some(TelnetFrame::Break),
                        });
                    }
                    other => {
                        trace!(command = other, "discarding telnet command");
                        State::Data
                    }
                },
                State::Negotiate(command) => {
                    debug!(command, option = b, "ignoring telnet option negotiation");
                    State::Data
                }
                State::Subnegotiation if b == IAC => State::SubnegotiationIac,
                State::Subnegotiation => State::Subnegotiation,
                State::SubnegotiationIac if b == IAC_SE => State::Data,
                State::SubnegotiationIac => State::Subnegotiation,
            };
        }

        Ok(self.take_payload())
    }
}

impl Encoder<&[u8]> for TelnetCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.escape_into(item, dst);
        Ok(())
    }
}
