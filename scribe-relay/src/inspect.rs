//! Bounded structural checks over lib0 v1 payloads.
//!
//! yrs sizes some buffers from the counts a payload declares, before reading
//! the entries behind them. This module walks the same layout with a plain
//! [`Cursor`] and rejects any count that cannot fit in the bytes that are
//! left, so a short frame never gets to claim millions of entries. Only
//! payloads that pass are handed to yrs.
//!
//! ```text
//! update       = clients:var { blocks:var client:var clock:var block* }  delete_set
//! block        = info:u8 ( GC len | SKIP len | item )
//! delete_set   = clients:var { client:var ranges:var (clock:var len:var)* }
//! state_vector = clients:var { client:var clock:var }
//! ```

use yrs::encoding::read::{Cursor, Read};
use yrs::sync::protocol::{
    MSG_AUTH, MSG_QUERY_AWARENESS, MSG_SYNC, MSG_SYNC_STEP_1, MSG_SYNC_STEP_2, MSG_SYNC_UPDATE,
    PERMISSION_DENIED,
};

use crate::error::RelayError;

/// Deepest `Any` nesting accepted inside an update.
pub const MAX_ANY_DEPTH: usize = 64;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;
const CONTENT_MOVE: u8 = 11;

const TYPE_XML_ELEMENT: u8 = 3;

/// One y-sync frame, split into its kind and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFrame<'a> {
    /// Encoded state vector of the sender, already checked.
    Step1(&'a [u8]),
    /// Encoded update, not yet checked.
    Step2(&'a [u8]),
    /// Encoded update, not yet checked.
    Update(&'a [u8]),
    /// Awareness, auth or custom frame, by tag.
    Other(u8),
}

/// Split a y-sync frame without decoding its payload.
pub fn sync_frame(bytes: &[u8]) -> Result<SyncFrame<'_>, RelayError> {
    let mut cursor = Cursor::new(bytes);
    let tag: u8 = cursor.read_var()?;
    let frame = match tag {
        MSG_SYNC => {
            let kind: u8 = cursor.read_var()?;
            let payload = take_buf(&mut cursor)?;
            match kind {
                MSG_SYNC_STEP_1 => {
                    check_state_vector(payload)?;
                    SyncFrame::Step1(payload)
                }
                MSG_SYNC_STEP_2 => SyncFrame::Step2(payload),
                MSG_SYNC_UPDATE => SyncFrame::Update(payload),
                other => return Err(malformed(format!("unknown sync message kind {other}"))),
            }
        }
        MSG_AUTH => {
            if cursor.read_var::<u8>()? == PERMISSION_DENIED {
                utf8(take_buf(&mut cursor)?)?;
            }
            SyncFrame::Other(tag)
        }
        MSG_QUERY_AWARENESS => SyncFrame::Other(tag),
        // Awareness and custom frames carry one length-prefixed buffer.
        _ => {
            take_buf(&mut cursor)?;
            SyncFrame::Other(tag)
        }
    };
    Ok(frame)
}

/// Check that `bytes` is a v1 update whose every count fits the payload.
pub fn check_update(bytes: &[u8]) -> Result<(), RelayError> {
    Walker::new(bytes).update()
}

/// Check that `bytes` is a v1 state vector whose entry count fits the payload.
pub fn check_state_vector(bytes: &[u8]) -> Result<(), RelayError> {
    Walker::new(bytes).state_vector()
}

fn malformed(reason: String) -> RelayError {
    RelayError::MalformedMessage(reason)
}

fn utf8(bytes: &[u8]) -> Result<(), RelayError> {
    std::str::from_utf8(bytes)
        .map(|_| ())
        .map_err(|e| malformed(format!("string is not UTF-8: {e}")))
}

/// Length-prefixed buffer borrowed for the lifetime of the input.
fn take_buf<'a>(cursor: &mut Cursor<'a>) -> Result<&'a [u8], RelayError> {
    let len = cursor.read_var::<u32>()? as usize;
    let start = cursor.next;
    cursor.read_exact(len)?;
    let buf: &'a [u8] = cursor.buf;
    Ok(&buf[start..start + len])
}

struct Walker<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Walker<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    fn remaining(&self) -> usize {
        self.cursor.buf.len().saturating_sub(self.cursor.next)
    }

    /// Accept `declared` entries only if each can take `min_bytes` of what is left.
    fn count(&self, what: &str, declared: u64, min_bytes: u64) -> Result<u64, RelayError> {
        let left = self.remaining();
        if declared.saturating_mul(min_bytes) > left as u64 {
            return Err(malformed(format!(
                "{what} count {declared} exceeds the {left} bytes left"
            )));
        }
        Ok(declared)
    }

    fn var_u32(&mut self) -> Result<u32, RelayError> {
        Ok(self.cursor.read_var::<u32>()?)
    }

    fn var_u64(&mut self) -> Result<u64, RelayError> {
        Ok(self.cursor.read_var::<u64>()?)
    }

    fn string(&mut self) -> Result<(), RelayError> {
        let bytes = take_buf(&mut self.cursor)?;
        utf8(bytes)
    }

    fn id(&mut self) -> Result<(), RelayError> {
        self.var_u32()?;
        self.var_u32()?;
        Ok(())
    }

    fn update(&mut self) -> Result<(), RelayError> {
        let clients = self.var_u32()?;
        // blocks, client and clock take a byte each at least
        let clients = self.count("client", u64::from(clients), 3)?;
        for _ in 0..clients {
            let blocks = self.var_u32()?;
            self.var_u32()?;
            self.var_u32()?;
            let blocks = self.count("block", u64::from(blocks), 2)?;
            for _ in 0..blocks {
                self.block()?;
            }
        }
        self.delete_set()
    }

    fn block(&mut self) -> Result<(), RelayError> {
        let info = self.cursor.read_u8()?;
        match info {
            BLOCK_GC | BLOCK_SKIP => {
                self.var_u32()?;
            }
            _ => {
                if info & HAS_ORIGIN != 0 {
                    self.id()?;
                }
                if info & HAS_RIGHT_ORIGIN != 0 {
                    self.id()?;
                }
                let carries_parent = info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0;
                if carries_parent {
                    if self.var_u32()? == 1 {
                        self.string()?;
                    } else {
                        self.id()?;
                    }
                    if info & HAS_PARENT_SUB != 0 {
                        self.string()?;
                    }
                }
                self.content(info)?;
            }
        }
        Ok(())
    }

    fn content(&mut self, info: u8) -> Result<(), RelayError> {
        match info & 0b1111 {
            CONTENT_DELETED => {
                self.var_u32()?;
            }
            CONTENT_JSON => {
                // len + 1 strings follow
                let len = self.var_u32()?;
                let strings = self.count("json", u64::from(len) + 1, 1)?;
                for _ in 0..strings {
                    self.string()?;
                }
            }
            CONTENT_BINARY => {
                take_buf(&mut self.cursor)?;
            }
            CONTENT_STRING | CONTENT_EMBED => self.string()?,
            CONTENT_FORMAT => {
                self.string()?;
                self.string()?;
            }
            CONTENT_TYPE => match self.cursor.read_u8()? {
                TYPE_XML_ELEMENT => self.string()?,
                0 | 1 | 2 | 4 | 5 | 6 | 9 | 15 => {}
                other => return Err(malformed(format!("unknown type ref {other}"))),
            },
            CONTENT_ANY => {
                let len = self.var_u32()?;
                let values = self.count("any", u64::from(len), 1)?;
                for _ in 0..values {
                    self.any(0)?;
                }
            }
            CONTENT_DOC => {
                self.string()?;
                self.any(0)?;
            }
            CONTENT_MOVE => {
                let flags = self.cursor.read_var::<i32>()?;
                self.var_u64()?;
                self.var_u32()?;
                if flags & 1 == 0 {
                    self.var_u64()?;
                    self.var_u32()?;
                }
            }
            other => return Err(malformed(format!("unknown content ref {other}"))),
        }
        Ok(())
    }

    fn any(&mut self, depth: usize) -> Result<(), RelayError> {
        if depth >= MAX_ANY_DEPTH {
            return Err(malformed(format!("value nested deeper than {MAX_ANY_DEPTH}")));
        }
        match self.cursor.read_u8()? {
            // undefined, null, false, true
            127 | 126 | 121 | 120 => {}
            125 => {
                self.cursor.read_var::<i64>()?;
            }
            124 => {
                self.cursor.read_exact(4)?;
            }
            123 | 122 => {
                self.cursor.read_exact(8)?;
            }
            119 => self.string()?,
            118 => {
                let len = self.var_u64()?;
                // key and value take a byte each at least
                let entries = self.count("map entry", len, 2)?;
                for _ in 0..entries {
                    self.string()?;
                    self.any(depth + 1)?;
                }
            }
            117 => {
                let len = self.var_u64()?;
                let items = self.count("array item", len, 1)?;
                for _ in 0..items {
                    self.any(depth + 1)?;
                }
            }
            116 => {
                take_buf(&mut self.cursor)?;
            }
            other => return Err(malformed(format!("unknown value tag {other}"))),
        }
        Ok(())
    }

    fn delete_set(&mut self) -> Result<(), RelayError> {
        let clients = self.var_u32()?;
        let clients = self.count("deleted client", u64::from(clients), 2)?;
        for _ in 0..clients {
            self.var_u32()?;
            let ranges = self.var_u32()?;
            let ranges = self.count("deleted range", u64::from(ranges), 2)?;
            for _ in 0..ranges {
                self.var_u32()?;
                self.var_u32()?;
            }
        }
        Ok(())
    }

    fn state_vector(&mut self) -> Result<(), RelayError> {
        let len = self.var_u32()?;
        let entries = self.count("state vector entry", u64::from(len), 2)?;
        for _ in 0..entries {
            self.var_u64()?;
            self.var_u32()?;
        }
        Ok(())
    }
}
