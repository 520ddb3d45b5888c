//! Binary frame protocol for document and presence synchronization.
//!
//! Wire format (lib0-style varints: little-endian 7-bit groups, high bit =
//! continuation):
//! ```text
//! ┌─────────────┬────────────────────────────────────────────────┐
//! │ message tag │ payload                                        │
//! │ varint      │ varies by tag                                  │
//! ├─────────────┼────────────────────────────────────────────────┤
//! │ 0 sync      │ varint op tag + varint-length byte buffer      │
//! │ 1 presence  │ varint-length byte buffer                      │
//! │ 3 query     │ (empty)                                        │
//! └─────────────┴────────────────────────────────────────────────┘
//! ```
//!
//! Sync op tags: 0 = step 1 (state vector request), 1 = step 2 (missing
//! state response), 2 = incremental update. The inner buffers are produced
//! and consumed by the document layer (`yrs` v1 encoding); this codec only
//! guarantees the outer framing.
//!
//! Performance target: encode < 200ns for a typical update frame.
//! Reference: Kleppmann — DDIA, Chapter 4 (Encoding and Evolution)

/// Message tag: document sync payload.
pub const TAG_SYNC: u64 = 0;
/// Message tag: presence state update.
pub const TAG_PRESENCE: u64 = 1;
/// Message tag: request for full presence state.
pub const TAG_PRESENCE_QUERY: u64 = 3;

/// Sync op tag: state vector request.
pub const SYNC_STEP1: u64 = 0;
/// Sync op tag: missing state response.
pub const SYNC_STEP2: u64 = 1;
/// Sync op tag: incremental update.
pub const SYNC_UPDATE: u64 = 2;

/// Document sync operation carried inside a sync frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOp {
    /// "What do you already have?" — encoded state vector.
    Step1(Vec<u8>),
    /// "Here is what you are missing" — encoded state diff.
    Step2(Vec<u8>),
    /// Incremental update pushed without a preceding request.
    Update(Vec<u8>),
}

impl SyncOp {
    /// Wire tag for this op.
    pub fn tag(&self) -> u64 {
        match self {
            Self::Step1(_) => SYNC_STEP1,
            Self::Step2(_) => SYNC_STEP2,
            Self::Update(_) => SYNC_UPDATE,
        }
    }

    /// The op's inner byte buffer.
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Step1(p) | Self::Step2(p) | Self::Update(p) => p,
        }
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Document sync traffic.
    Sync(SyncOp),
    /// Presence update bytes (decoded further by the presence layer).
    Presence(Vec<u8>),
    /// Request for the receiver's full presence state.
    PresenceQuery,
}

impl Frame {
    /// Create a sync step 1 frame from an encoded state vector.
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Self::Sync(SyncOp::Step1(state_vector))
    }

    /// Create a sync step 2 frame from an encoded state diff.
    pub fn sync_step2(state_diff: Vec<u8>) -> Self {
        Self::Sync(SyncOp::Step2(state_diff))
    }

    /// Create an incremental update frame.
    pub fn sync_update(update: Vec<u8>) -> Self {
        Self::Sync(SyncOp::Update(update))
    }

    /// Create a presence update frame.
    pub fn presence(update: Vec<u8>) -> Self {
        Self::Presence(update)
    }

    /// Serialize to wire bytes. Writing cannot fail.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.payload_len());
        match self {
            Self::Sync(op) => {
                write_var_u64(&mut buf, TAG_SYNC);
                write_var_u64(&mut buf, op.tag());
                write_var_buf(&mut buf, op.payload());
            }
            Self::Presence(update) => {
                write_var_u64(&mut buf, TAG_PRESENCE);
                write_var_buf(&mut buf, update);
            }
            Self::PresenceQuery => {
                write_var_u64(&mut buf, TAG_PRESENCE_QUERY);
            }
        }
        buf
    }

    /// Deserialize from wire bytes.
    ///
    /// Bytes trailing a complete frame are ignored; a frame is one transport
    /// message and upstream readers stop at the payload boundary.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut pos = 0;
        let tag = read_var_u64(bytes, &mut pos)?;
        match tag {
            TAG_SYNC => {
                let op_tag = read_var_u64(bytes, &mut pos)?;
                let payload = read_var_buf(bytes, &mut pos)?.to_vec();
                let op = match op_tag {
                    SYNC_STEP1 => SyncOp::Step1(payload),
                    SYNC_STEP2 => SyncOp::Step2(payload),
                    SYNC_UPDATE => SyncOp::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncTag(other)),
                };
                Ok(Self::Sync(op))
            }
            TAG_PRESENCE => Ok(Self::Presence(read_var_buf(bytes, &mut pos)?.to_vec())),
            TAG_PRESENCE_QUERY => Ok(Self::PresenceQuery),
            other => Err(ProtocolError::UnknownMessageTag(other)),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Sync(op) => op.payload().len(),
            Self::Presence(update) => update.len(),
            Self::PresenceQuery => 0,
        }
    }
}

// ─── varint primitives ──────────────────────────────────────────────────────

/// Append an unsigned varint (7 bits per byte, LSB group first).
pub(crate) fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read an unsigned varint starting at `*pos`, advancing `*pos` past it.
pub(crate) fn read_var_u64(input: &[u8], pos: &mut usize) -> Result<u64, ProtocolError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *input.get(*pos).ok_or(ProtocolError::UnexpectedEof)?;
        *pos += 1;
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(ProtocolError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Append a length-prefixed byte buffer.
pub(crate) fn write_var_buf(buf: &mut Vec<u8>, payload: &[u8]) {
    write_var_u64(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

/// Read a length-prefixed byte buffer, advancing `*pos` past it.
pub(crate) fn read_var_buf<'a>(input: &'a [u8], pos: &mut usize) -> Result<&'a [u8], ProtocolError> {
    let len = read_var_u64(input, pos)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::VarintOverflow)?;
    let end = pos.checked_add(len).ok_or(ProtocolError::UnexpectedEof)?;
    let slice = input.get(*pos..end).ok_or(ProtocolError::UnexpectedEof)?;
    *pos = end;
    Ok(slice)
}

/// Read a length-prefixed UTF-8 string, advancing `*pos` past it.
pub(crate) fn read_var_string(input: &[u8], pos: &mut usize) -> Result<String, ProtocolError> {
    let bytes = read_var_buf(input, pos)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

/// Append a length-prefixed UTF-8 string.
pub(crate) fn write_var_string(buf: &mut Vec<u8>, value: &str) {
    write_var_buf(buf, value.as_bytes());
}

/// Frame codec errors.
///
/// Decode failures are local: callers log the frame at `warn` and drop it.
/// They never tear down a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended inside a varint or length-prefixed buffer.
    UnexpectedEof,
    /// Varint does not fit in 64 bits.
    VarintOverflow,
    /// Unrecognized top-level message tag.
    UnknownMessageTag(u64),
    /// Unrecognized sync op tag.
    UnknownSyncTag(u64),
    /// String payload is not valid UTF-8.
    InvalidUtf8,
    /// JSON payload failed to parse.
    InvalidJson,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "Unexpected end of frame"),
            Self::VarintOverflow => write!(f, "Varint exceeds 64 bits"),
            Self::UnknownMessageTag(tag) => write!(f, "Unknown message tag: {tag}"),
            Self::UnknownSyncTag(tag) => write!(f, "Unknown sync op tag: {tag}"),
            Self::InvalidUtf8 => write!(f, "String payload is not valid UTF-8"),
            Self::InvalidJson => write!(f, "JSON payload failed to parse"),
        }
    }
}

impl std::error::Error for ProtocolError {}
