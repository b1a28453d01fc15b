//! Lockstep wire packets
//!
//! Every datagram starts with a 4-byte type magic followed by big-endian
//! fields. Raw bytes are decoded exactly once, at the transport boundary,
//! into [`Packet`]; nothing past the socket looks at byte offsets.
//!
//! # Wire Format
//!
//! ```text
//! INPUT          [magic][frame:u32][mask:u16][token:u16]
//! HASH           [magic][frame:u32][hash:u32]
//! KEEPALIVE      [magic][token:u32]
//! RESYNC_REQUEST [magic][frame:u32]
//! *_INFO         [magic][size:u32][crc:u32][chunk_size:u16][chunk_count:u16][flags:u16]?
//! *_CHUNK        [magic][index:u16][chunk_count:u16][len:u16][reserved:u16][payload..len]
//! *_ACK          [magic][size:u32][crc:u32]
//! ```

use byteorder::{BigEndian, ByteOrder};

pub const MAGIC_INPUT: [u8; 4] = *b"LSIN";
pub const MAGIC_HASH: [u8; 4] = *b"LSHA";
pub const MAGIC_KEEPALIVE: [u8; 4] = *b"LSKA";
pub const MAGIC_RESYNC_REQUEST: [u8; 4] = *b"LSRR";
pub const MAGIC_STATE_INFO: [u8; 4] = *b"LSSI";
pub const MAGIC_STATE_CHUNK: [u8; 4] = *b"LSSC";
pub const MAGIC_STATE_ACK: [u8; 4] = *b"LSSA";
pub const MAGIC_SAVE_INFO: [u8; 4] = *b"LSVI";
pub const MAGIC_SAVE_CHUNK: [u8; 4] = *b"LSVC";
pub const MAGIC_SAVE_ACK: [u8; 4] = *b"LSVA";

/// Size of the type magic
pub const MAGIC_SIZE: usize = 4;

/// Info flag: completion of this transfer gates session readiness
pub const INFO_FLAG_GATING: u16 = 0x0001;

const INPUT_LEN: usize = MAGIC_SIZE + 8;
const HASH_LEN: usize = MAGIC_SIZE + 8;
const KEEPALIVE_LEN: usize = MAGIC_SIZE + 4;
const RESYNC_REQUEST_LEN: usize = MAGIC_SIZE + 4;
const INFO_LEN_SHORT: usize = MAGIC_SIZE + 12;
const INFO_LEN: usize = MAGIC_SIZE + 14;
const CHUNK_HEADER_LEN: usize = MAGIC_SIZE + 8;
const ACK_LEN: usize = MAGIC_SIZE + 8;

/// Packet decode errors. All of them mean "drop the datagram".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown packet magic {0:02X?}")]
    UnknownMagic([u8; 4]),

    #[error("{kind} packet has wrong length {actual} (expected {expected})")]
    WrongLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("chunk declares {declared} payload bytes but carries {actual}")]
    PayloadLength { declared: usize, actual: usize },
}

/// Frame-tagged local input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPacket {
    pub frame: u32,
    pub mask: u16,
    pub token: u16,
}

/// Bulk transfer announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferInfo {
    pub size: u32,
    pub crc: u32,
    pub chunk_size: u16,
    pub chunk_count: u16,
    pub flags: u16,
}

impl TransferInfo {
    pub fn is_gating(&self) -> bool {
        self.flags & INFO_FLAG_GATING != 0
    }

    /// Announced count matches `ceil(size / chunk_size)`.
    pub fn is_consistent(&self) -> bool {
        if self.chunk_size == 0 {
            return false;
        }
        let expected = (self.size as u64).div_ceil(self.chunk_size as u64);
        expected == self.chunk_count as u64
    }
}

/// One slice of a bulk transfer payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferChunk {
    pub index: u16,
    pub chunk_count: u16,
    pub payload: Vec<u8>,
}

/// Receiver confirmation of an applied transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferAck {
    pub size: u32,
    pub crc: u32,
}

/// Every packet the protocol exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Input(InputPacket),
    Hash { frame: u32, hash: u32 },
    KeepAlive { token: u32 },
    ResyncRequest { frame: u32 },
    StateInfo(TransferInfo),
    StateChunk(TransferChunk),
    StateAck(TransferAck),
    SaveInfo(TransferInfo),
    SaveChunk(TransferChunk),
    SaveAck(TransferAck),
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, v);
    out.extend_from_slice(&b);
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

fn put_info(out: &mut Vec<u8>, info: &TransferInfo) {
    put_u32(out, info.size);
    put_u32(out, info.crc);
    put_u16(out, info.chunk_size);
    put_u16(out, info.chunk_count);
    put_u16(out, info.flags);
}

fn put_chunk(out: &mut Vec<u8>, chunk: &TransferChunk) {
    put_u16(out, chunk.index);
    put_u16(out, chunk.chunk_count);
    put_u16(out, chunk.payload.len() as u16);
    put_u16(out, 0);
    out.extend_from_slice(&chunk.payload);
}

fn put_ack(out: &mut Vec<u8>, ack: &TransferAck) {
    put_u32(out, ack.size);
    put_u32(out, ack.crc);
}

fn expect_len(kind: &'static str, data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() != expected {
        return Err(DecodeError::WrongLength {
            kind,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn read_info(kind: &'static str, data: &[u8]) -> Result<TransferInfo, DecodeError> {
    if data.len() != INFO_LEN && data.len() != INFO_LEN_SHORT {
        return Err(DecodeError::WrongLength {
            kind,
            expected: INFO_LEN,
            actual: data.len(),
        });
    }
    let body = &data[MAGIC_SIZE..];
    // Flags are optional on the wire
    let flags = if data.len() == INFO_LEN {
        BigEndian::read_u16(&body[12..14])
    } else {
        0
    };
    Ok(TransferInfo {
        size: BigEndian::read_u32(&body[0..4]),
        crc: BigEndian::read_u32(&body[4..8]),
        chunk_size: BigEndian::read_u16(&body[8..10]),
        chunk_count: BigEndian::read_u16(&body[10..12]),
        flags,
    })
}

fn read_chunk(data: &[u8]) -> Result<TransferChunk, DecodeError> {
    if data.len() < CHUNK_HEADER_LEN {
        return Err(DecodeError::TooShort(data.len()));
    }
    let header = &data[MAGIC_SIZE..CHUNK_HEADER_LEN];
    let index = BigEndian::read_u16(&header[0..2]);
    let chunk_count = BigEndian::read_u16(&header[2..4]);
    let declared = BigEndian::read_u16(&header[4..6]) as usize;

    let body = &data[CHUNK_HEADER_LEN..];
    if body.len() != declared {
        return Err(DecodeError::PayloadLength {
            declared,
            actual: body.len(),
        });
    }

    Ok(TransferChunk {
        index,
        chunk_count,
        payload: body.to_vec(),
    })
}

fn read_ack(kind: &'static str, data: &[u8]) -> Result<TransferAck, DecodeError> {
    expect_len(kind, data, ACK_LEN)?;
    Ok(TransferAck {
        size: BigEndian::read_u32(&data[4..8]),
        crc: BigEndian::read_u32(&data[8..12]),
    })
}

impl Packet {
    /// Short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Packet::Input(_) => "input",
            Packet::Hash { .. } => "hash",
            Packet::KeepAlive { .. } => "keepalive",
            Packet::ResyncRequest { .. } => "resync_request",
            Packet::StateInfo(_) => "state_info",
            Packet::StateChunk(_) => "state_chunk",
            Packet::StateAck(_) => "state_ack",
            Packet::SaveInfo(_) => "save_info",
            Packet::SaveChunk(_) => "save_chunk",
            Packet::SaveAck(_) => "save_ack",
        }
    }

    fn magic(&self) -> [u8; 4] {
        match self {
            Packet::Input(_) => MAGIC_INPUT,
            Packet::Hash { .. } => MAGIC_HASH,
            Packet::KeepAlive { .. } => MAGIC_KEEPALIVE,
            Packet::ResyncRequest { .. } => MAGIC_RESYNC_REQUEST,
            Packet::StateInfo(_) => MAGIC_STATE_INFO,
            Packet::StateChunk(_) => MAGIC_STATE_CHUNK,
            Packet::StateAck(_) => MAGIC_STATE_ACK,
            Packet::SaveInfo(_) => MAGIC_SAVE_INFO,
            Packet::SaveChunk(_) => MAGIC_SAVE_CHUNK,
            Packet::SaveAck(_) => MAGIC_SAVE_ACK,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Input(_) => INPUT_LEN,
            Packet::Hash { .. } => HASH_LEN,
            Packet::KeepAlive { .. } => KEEPALIVE_LEN,
            Packet::ResyncRequest { .. } => RESYNC_REQUEST_LEN,
            Packet::StateInfo(_) | Packet::SaveInfo(_) => INFO_LEN,
            Packet::StateChunk(c) | Packet::SaveChunk(c) => CHUNK_HEADER_LEN + c.payload.len(),
            Packet::StateAck(_) | Packet::SaveAck(_) => ACK_LEN,
        }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.magic());

        match self {
            Packet::Input(p) => {
                put_u32(&mut out, p.frame);
                put_u16(&mut out, p.mask);
                put_u16(&mut out, p.token);
            }
            Packet::Hash { frame, hash } => {
                put_u32(&mut out, *frame);
                put_u32(&mut out, *hash);
            }
            Packet::KeepAlive { token } => put_u32(&mut out, *token),
            Packet::ResyncRequest { frame } => put_u32(&mut out, *frame),
            Packet::StateInfo(info) | Packet::SaveInfo(info) => put_info(&mut out, info),
            Packet::StateChunk(chunk) | Packet::SaveChunk(chunk) => put_chunk(&mut out, chunk),
            Packet::StateAck(ack) | Packet::SaveAck(ack) => put_ack(&mut out, ack),
        }

        out
    }

    /// Decode one datagram.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < MAGIC_SIZE {
            return Err(DecodeError::TooShort(data.len()));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[..MAGIC_SIZE]);

        match magic {
            MAGIC_INPUT => {
                expect_len("input", data, INPUT_LEN)?;
                Ok(Packet::Input(InputPacket {
                    frame: BigEndian::read_u32(&data[4..8]),
                    mask: BigEndian::read_u16(&data[8..10]),
                    token: BigEndian::read_u16(&data[10..12]),
                }))
            }
            MAGIC_HASH => {
                expect_len("hash", data, HASH_LEN)?;
                Ok(Packet::Hash {
                    frame: BigEndian::read_u32(&data[4..8]),
                    hash: BigEndian::read_u32(&data[8..12]),
                })
            }
            MAGIC_KEEPALIVE => {
                expect_len("keepalive", data, KEEPALIVE_LEN)?;
                Ok(Packet::KeepAlive {
                    token: BigEndian::read_u32(&data[4..8]),
                })
            }
            MAGIC_RESYNC_REQUEST => {
                expect_len("resync_request", data, RESYNC_REQUEST_LEN)?;
                Ok(Packet::ResyncRequest {
                    frame: BigEndian::read_u32(&data[4..8]),
                })
            }
            MAGIC_STATE_INFO => read_info("state_info", data).map(Packet::StateInfo),
            MAGIC_SAVE_INFO => read_info("save_info", data).map(Packet::SaveInfo),
            MAGIC_STATE_CHUNK => read_chunk(data).map(Packet::StateChunk),
            MAGIC_SAVE_CHUNK => read_chunk(data).map(Packet::SaveChunk),
            MAGIC_STATE_ACK => read_ack("state_ack", data).map(Packet::StateAck),
            MAGIC_SAVE_ACK => read_ack("save_ack", data).map(Packet::SaveAck),
            other => Err(DecodeError::UnknownMagic(other)),
        }
    }
}
