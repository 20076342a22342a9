//! Message framing.
//!
//! ```text
//! MESSAGE_START | SEQUENCE | SIZE_HI | SIZE_LO | TOKEN | BODY[SIZE] | CHECKSUM
//! ```
//!
//! The checksum is the XOR of every preceding byte, start byte included.

use crate::protocol::{MAX_MESSAGE_SIZE, MESSAGE_START, TOKEN};

/// Bytes of framing wrapped around a body
pub const FRAME_OVERHEAD: usize = 6;

/// Reasons a frame was abandoned, recovered by rescanning for a start byte
#[derive(Copy, Clone, PartialEq, Debug, thiserror::Error)]
pub enum FrameError {
    #[error("expected token 0x0e, received 0x{0:02x}")]
    BadToken(u8),
    #[error("checksum mismatch (computed 0x{computed:02x}, received 0x{received:02x})")]
    BadChecksum { computed: u8, received: u8 },
    #[error("declared length {0} exceeds buffer")]
    Oversize(usize),
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Start,
    SeqNum,
    SizeHigh,
    SizeLow,
    Token,
    Data,
    Checksum,
}

/// XOR checksum over a byte slice
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |c, b| c ^ b)
}

/// Encode a frame into `buff`, returning the encoded length
pub fn encode(seq: u8, body: &[u8], buff: &mut [u8]) -> Option<usize> {
    let n = body.len() + FRAME_OVERHEAD;
    if body.len() > u16::MAX as usize || buff.len() < n {
        return None;
    }

    buff[0] = MESSAGE_START;
    buff[1] = seq;
    buff[2] = (body.len() >> 8) as u8;
    buff[3] = body.len() as u8;
    buff[4] = TOKEN;
    buff[5..n - 1].copy_from_slice(body);
    buff[n - 1] = checksum(&buff[..n - 1]);

    Some(n)
}

/// Reassembles frames one byte at a time
///
/// The body is buffered in place; once [`Decoder::push`] reports a complete
/// frame the body is available through [`Decoder::body`] until the next byte
/// is pushed.
pub struct Decoder {
    state: State,
    seq: u8,
    len: usize,
    index: usize,
    checksum: u8,
    body: [u8; MAX_MESSAGE_SIZE],
}

impl Decoder {
    pub const fn new() -> Self {
        Self {
            state: State::Start,
            seq: 0,
            len: 0,
            index: 0,
            checksum: 0,
            body: [0u8; MAX_MESSAGE_SIZE],
        }
    }

    /// Fetch the decoder state
    pub fn state(&self) -> State {
        self.state
    }

    /// Drop any partial frame and wait for the next start byte
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.index = 0;
        self.len = 0;
    }

    /// Sequence number of the last completed frame
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Body of the last completed frame
    pub fn body(&self) -> &[u8] {
        &self.body[..self.len]
    }

    /// Consume one byte, returning `Ok(true)` when a frame has completed
    ///
    /// On error the decoder has already returned to [`State::Start`].
    pub fn push(&mut self, b: u8) -> Result<bool, FrameError> {
        match self.state {
            State::Start => {
                if b == MESSAGE_START {
                    self.checksum = b;
                    self.len = 0;
                    self.index = 0;
                    self.state = State::SeqNum;
                }
            }
            State::SeqNum => {
                // Accepted as presented, the response echoes it
                self.seq = b;
                self.checksum ^= b;
                self.state = State::SizeHigh;
            }
            State::SizeHigh => {
                self.len = (b as usize) << 8;
                self.checksum ^= b;
                self.state = State::SizeLow;
            }
            State::SizeLow => {
                self.len |= b as usize;
                self.checksum ^= b;
                if self.len > MAX_MESSAGE_SIZE {
                    let len = self.len;
                    self.reset();
                    return Err(FrameError::Oversize(len));
                }
                self.state = State::Token;
            }
            State::Token => {
                if b != TOKEN {
                    self.reset();
                    return Err(FrameError::BadToken(b));
                }
                self.checksum ^= b;
                self.state = if self.len == 0 {
                    State::Checksum
                } else {
                    State::Data
                };
            }
            State::Data => {
                self.body[self.index] = b;
                self.index += 1;
                self.checksum ^= b;
                if self.index == self.len {
                    self.state = State::Checksum;
                }
            }
            State::Checksum => {
                let computed = self.checksum;
                self.state = State::Start;
                if b != computed {
                    self.len = 0;
                    return Err(FrameError::BadChecksum {
                        computed,
                        received: b,
                    });
                }
                return Ok(true);
            }
        }

        Ok(false)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
