//! msgpack decoder.
//!
//! Reads directly from the bound byte stream with a one-byte peek cache for
//! `type_next`. Scope state mirrors the writer: object scopes count key and
//! value slots (2n) and enforce the `read_key_next` discipline; `end_*`
//! with a matching key breaks out of any nested unfinished scopes, skipping
//! their remaining elements so the stream stays aligned.
//!
//! Ext payloads are treated as opaque binary and skipped; their typecodes
//! are never surfaced.

use std::sync::Arc;

use smallvec::SmallVec;

use outrigger_core::archive::{ArchiveConfig, ArchiveRead, ContextKey, EntityType};
use outrigger_core::error::{ArchiveError, StreamError};
use outrigger_core::transport::{read_exact, ByteStream};

use crate::typecode as tc;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Object,
    Array,
    Binary,
}

struct Scope {
    kind: ScopeKind,
    key: u64,
    /// Object scopes count slots (2n); binary scopes count bytes.
    slots_left: u64,
    reading_key: bool,
}

enum Num {
    I(i64),
    U(u64),
    F(f64),
}

pub struct Reader {
    src: Option<Arc<dyn ByteStream>>,
    peeked: Option<u8>,
    scopes: SmallVec<[Scope; 8]>,
    keygen: u32,
    pub config: ArchiveConfig,
}

impl Reader {
    #[must_use]
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            src: None,
            peeked: None,
            scopes: SmallVec::new(),
            keygen: 0,
            config,
        }
    }

    /// Rebind to a byte stream, clearing all parse state.
    pub fn bind(&mut self, src: Arc<dyn ByteStream>) {
        self.src = Some(src);
        self.peeked = None;
        self.scopes.clear();
        self.keygen = 0;
    }

    // ---- byte-level helpers ----

    fn src(&self) -> Result<&Arc<dyn ByteStream>, ArchiveError> {
        self.src
            .as_ref()
            .ok_or(ArchiveError::CheckFailed("reader is not bound to a stream"))
    }

    fn peek(&mut self) -> Result<u8, ArchiveError> {
        if let Some(byte) = self.peeked {
            return Ok(byte);
        }
        let mut byte = [0u8; 1];
        let src = self.src()?.clone();
        map_eof(read_exact(&*src, &mut byte))?;
        self.peeked = Some(byte[0]);
        Ok(byte[0])
    }

    fn bump(&mut self) -> Result<u8, ArchiveError> {
        let byte = self.peek()?;
        self.peeked = None;
        Ok(byte)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), ArchiveError> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut start = 0;
        if let Some(byte) = self.peeked.take() {
            buf[0] = byte;
            start = 1;
        }
        if start < buf.len() {
            let src = self.src()?.clone();
            map_eof(read_exact(&*src, &mut buf[start..]))?;
        }
        Ok(())
    }

    fn be_u16(&mut self) -> Result<u16, ArchiveError> {
        let mut buf = [0u8; 2];
        self.read_bytes(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn be_u32(&mut self) -> Result<u32, ArchiveError> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn be_u64(&mut self) -> Result<u64, ArchiveError> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn discard(&mut self, mut bytes: usize) -> Result<(), ArchiveError> {
        let mut scratch = [0u8; 256];
        while bytes > 0 {
            let take = bytes.min(scratch.len());
            self.read_bytes(&mut scratch[..take])?;
            bytes -= take;
        }
        Ok(())
    }

    // ---- header helpers (consume the typecode byte) ----

    fn read_str_len(&mut self) -> Result<u32, ArchiveError> {
        let header = self.peek()?;
        match header {
            0xa0..=0xbf => {
                self.bump()?;
                Ok(u32::from(header & 0x1f))
            }
            tc::STR8 => {
                self.bump()?;
                Ok(u32::from(self.bump()?))
            }
            tc::STR16 => {
                self.bump()?;
                self.be_u16().map(u32::from)
            }
            tc::STR32 => {
                self.bump()?;
                self.be_u32()
            }
            other => Err(ArchiveError::TypeMismatch {
                expected: "string",
                found: other,
            }),
        }
    }

    fn read_bin_len(&mut self) -> Result<u32, ArchiveError> {
        let header = self.peek()?;
        match header {
            tc::BIN8 => {
                self.bump()?;
                Ok(u32::from(self.bump()?))
            }
            tc::BIN16 => {
                self.bump()?;
                self.be_u16().map(u32::from)
            }
            tc::BIN32 => {
                self.bump()?;
                self.be_u32()
            }
            other => Err(ArchiveError::TypeMismatch {
                expected: "binary",
                found: other,
            }),
        }
    }

    fn read_ext_len(&mut self) -> Result<u32, ArchiveError> {
        let header = self.peek()?;
        match header {
            tc::EXT8 => {
                self.bump()?;
                Ok(u32::from(self.bump()?))
            }
            tc::EXT16 => {
                self.bump()?;
                self.be_u16().map(u32::from)
            }
            tc::EXT32 => {
                self.bump()?;
                self.be_u32()
            }
            other => Err(ArchiveError::TypeMismatch {
                expected: "ext",
                found: other,
            }),
        }
    }

    fn read_array_len(&mut self) -> Result<u32, ArchiveError> {
        let header = self.peek()?;
        match header {
            0x90..=0x9f => {
                self.bump()?;
                Ok(u32::from(header & 0x0f))
            }
            tc::ARRAY16 => {
                self.bump()?;
                self.be_u16().map(u32::from)
            }
            tc::ARRAY32 => {
                self.bump()?;
                self.be_u32()
            }
            other => Err(ArchiveError::TypeMismatch {
                expected: "array",
                found: other,
            }),
        }
    }

    fn read_map_len(&mut self) -> Result<u32, ArchiveError> {
        let header = self.peek()?;
        match header {
            0x80..=0x8f => {
                self.bump()?;
                Ok(u32::from(header & 0x0f))
            }
            tc::MAP16 => {
                self.bump()?;
                self.be_u16().map(u32::from)
            }
            tc::MAP32 => {
                self.bump()?;
                self.be_u32()
            }
            other => Err(ArchiveError::TypeMismatch {
                expected: "map",
                found: other,
            }),
        }
    }

    /// Consume one numeric value (no context step).
    fn read_number_raw(&mut self) -> Result<Num, ArchiveError> {
        let header = self.peek()?;
        match header {
            0x00..=0x7f => {
                self.bump()?;
                Ok(Num::U(u64::from(header)))
            }
            0xe0..=0xff => {
                self.bump()?;
                Ok(Num::I(i64::from(header as i8)))
            }
            tc::FALSE => {
                self.bump()?;
                Ok(Num::U(0))
            }
            tc::TRUE => {
                self.bump()?;
                Ok(Num::U(1))
            }
            tc::FLOAT32 => {
                self.bump()?;
                Ok(Num::F(f64::from(f32::from_bits(self.be_u32()?))))
            }
            tc::FLOAT64 => {
                self.bump()?;
                Ok(Num::F(f64::from_bits(self.be_u64()?)))
            }
            tc::UINT8 => {
                self.bump()?;
                Ok(Num::U(u64::from(self.bump()?)))
            }
            tc::UINT16 => {
                self.bump()?;
                Ok(Num::U(u64::from(self.be_u16()?)))
            }
            tc::UINT32 => {
                self.bump()?;
                Ok(Num::U(u64::from(self.be_u32()?)))
            }
            tc::UINT64 => {
                self.bump()?;
                Ok(Num::U(self.be_u64()?))
            }
            tc::INT8 => {
                self.bump()?;
                Ok(Num::I(i64::from(self.bump()? as i8)))
            }
            tc::INT16 => {
                self.bump()?;
                Ok(Num::I(i64::from(self.be_u16()? as i16)))
            }
            tc::INT32 => {
                self.bump()?;
                Ok(Num::I(i64::from(self.be_u32()? as i32)))
            }
            tc::INT64 => {
                self.bump()?;
                Ok(Num::I(self.be_u64()? as i64))
            }
            other => Err(ArchiveError::TypeMismatch {
                expected: "number",
                found: other,
            }),
        }
    }

    // ---- scope discipline ----

    fn step_context(&mut self) -> Result<(), ArchiveError> {
        let Some(top) = self.scopes.last_mut() else {
            return Ok(());
        };
        match top.kind {
            ScopeKind::Binary => {
                return Err(ArchiveError::CheckFailed(
                    "binary scope cannot contain elements",
                ))
            }
            ScopeKind::Object if top.slots_left % 2 == 0 => {
                if !top.reading_key {
                    return Err(ArchiveError::CheckFailed("read_key_next was not called"));
                }
                top.reading_key = false;
            }
            _ => {}
        }
        if top.slots_left == 0 {
            return Err(ArchiveError::CheckFailed("all elements already read"));
        }
        top.slots_left -= 1;
        Ok(())
    }

    /// Like `step_context` without the key discipline; used while skipping.
    fn step_context_on_skip(&mut self) -> Result<(), ArchiveError> {
        let Some(top) = self.scopes.last_mut() else {
            return Ok(());
        };
        if top.slots_left == 0 {
            return Err(ArchiveError::CheckFailed("all elements already read"));
        }
        top.slots_left -= 1;
        Ok(())
    }

    fn verify_not_key_slot(&self) -> Result<(), ArchiveError> {
        let Some(top) = self.scopes.last() else {
            return Ok(());
        };
        if top.kind == ScopeKind::Object {
            if top.slots_left % 2 == 0 {
                return Err(ArchiveError::CheckFailed(
                    "container cannot appear in key position",
                ));
            }
            if top.reading_key {
                return Err(ArchiveError::CheckFailed("pending key read"));
            }
        }
        Ok(())
    }

    fn new_scope(&mut self, kind: ScopeKind, raw_count: u64) -> ContextKey {
        self.keygen = self.keygen.wrapping_add(1);
        let key = (u64::from(self.keygen) << 32) | self.scopes.len() as u64;
        let slots = if kind == ScopeKind::Object {
            raw_count * 2
        } else {
            raw_count
        };
        self.scopes.push(Scope {
            kind,
            key,
            slots_left: slots,
            reading_key: false,
        });
        ContextKey::new(key)
    }

    /// Number of scopes (innermost first) that `end_*` must break to reach
    /// the one `key` opened.
    fn count_break_scopes(&self, kind: ScopeKind, key: ContextKey) -> Result<usize, ArchiveError> {
        for (depth, scope) in self.scopes.iter().rev().enumerate() {
            if scope.key == key.raw() {
                if scope.kind == kind {
                    return Ok(depth + 1);
                }
                return Err(ArchiveError::CheckFailed("scope kind mismatch on end"));
            }
        }
        Err(ArchiveError::InvalidContext("foreign or stale context key"))
    }

    /// Skip the rest of the innermost scope and pop it.
    fn break_scope(&mut self) -> Result<(), ArchiveError> {
        loop {
            let Some(top) = self.scopes.last_mut() else {
                return Err(ArchiveError::InvalidContext("no open scope"));
            };
            if top.kind == ScopeKind::Binary {
                let leftover = top.slots_left as usize;
                self.scopes.pop();
                self.discard(leftover)?;
                return Ok(());
            }
            if top.slots_left == 0 {
                break;
            }
            if top.kind == ScopeKind::Object && top.slots_left % 2 == 0 {
                top.reading_key = true;
            }
            self.skip_once()?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn skip_once(&mut self) -> Result<(), ArchiveError> {
        let header = self.peek()?;
        match header {
            // numbers, bools
            0x00..=0x7f
            | 0xe0..=0xff
            | tc::FALSE
            | tc::TRUE
            | tc::FLOAT32
            | tc::FLOAT64
            | tc::UINT8..=tc::UINT64
            | tc::INT8..=tc::INT64 => {
                self.read_number_raw()?;
                self.step_context_on_skip()?;
            }
            tc::NIL => {
                self.bump()?;
                self.step_context_on_skip()?;
            }
            0xa0..=0xbf | tc::STR8..=tc::STR32 => {
                let len = self.read_str_len()? as usize;
                self.step_context_on_skip()?;
                self.discard(len)?;
            }
            tc::BIN8..=tc::BIN32 => {
                let len = self.read_bin_len()? as usize;
                self.step_context_on_skip()?;
                self.discard(len)?;
            }
            tc::FIXEXT1 => self.skip_fixext(1)?,
            tc::FIXEXT2 => self.skip_fixext(2)?,
            tc::FIXEXT4 => self.skip_fixext(4)?,
            tc::FIXEXT8 => self.skip_fixext(8)?,
            tc::FIXEXT16 => self.skip_fixext(16)?,
            tc::EXT8..=tc::EXT32 => {
                // the ext type byte counts toward the skipped region
                let len = self.read_ext_len()? as usize;
                self.step_context_on_skip()?;
                self.discard(len + 1)?;
            }
            0x90..=0x9f | tc::ARRAY16 | tc::ARRAY32 => {
                let key = self.begin_array_skipping()?;
                self.end_array(key)?;
            }
            0x80..=0x8f | tc::MAP16 | tc::MAP32 => {
                let key = self.begin_object_skipping()?;
                self.end_object(key)?;
            }
            other => {
                return Err(ArchiveError::ParseFailed(format!(
                    "unsupported typecode {other:#04x}"
                )))
            }
        }
        Ok(())
    }

    fn skip_fixext(&mut self, data: usize) -> Result<(), ArchiveError> {
        self.bump()?;
        self.step_context_on_skip()?;
        self.discard(data + 1) // type byte + payload
    }

    /// `begin_array` without the key-slot discipline, for skip paths.
    fn begin_array_skipping(&mut self) -> Result<ContextKey, ArchiveError> {
        let count = self.read_array_len()?;
        self.step_context_on_skip()?;
        Ok(self.new_scope(ScopeKind::Array, u64::from(count)))
    }

    fn begin_object_skipping(&mut self) -> Result<ContextKey, ArchiveError> {
        let count = self.read_map_len()?;
        self.step_context_on_skip()?;
        Ok(self.new_scope(ScopeKind::Object, u64::from(count)))
    }

    fn top_scope(&self) -> Result<&Scope, ArchiveError> {
        self.scopes
            .last()
            .ok_or(ArchiveError::CheckFailed("not inside any scope"))
    }

    fn verify_top(&mut self, kind: ScopeKind) -> Result<&mut Scope, ArchiveError> {
        let top = self
            .scopes
            .last_mut()
            .ok_or(ArchiveError::CheckFailed("not inside any scope"))?;
        if top.kind != kind {
            return Err(ArchiveError::CheckFailed("scope kind mismatch"));
        }
        Ok(top)
    }
}

fn map_eof(result: Result<(), StreamError>) -> Result<(), ArchiveError> {
    match result {
        Ok(()) => Ok(()),
        Err(StreamError::Closed) => Err(ArchiveError::UnexpectedEof),
        Err(error) => Err(ArchiveError::Stream(error)),
    }
}

impl ArchiveRead for Reader {
    fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    fn skip_next(&mut self) -> Result<(), ArchiveError> {
        self.skip_once()
    }

    fn read_bool(&mut self) -> Result<bool, ArchiveError> {
        let value = self.read_number_raw()?;
        self.step_context()?;
        Ok(match value {
            Num::I(v) => v != 0,
            Num::U(v) => v != 0,
            Num::F(v) => v != 0.0,
        })
    }

    fn read_i64(&mut self) -> Result<i64, ArchiveError> {
        let value = self.read_number_raw()?;
        self.step_context()?;
        Ok(match value {
            Num::I(v) => v,
            Num::U(v) => v as i64,
            Num::F(v) => v as i64,
        })
    }

    fn read_u64(&mut self) -> Result<u64, ArchiveError> {
        let value = self.read_number_raw()?;
        self.step_context()?;
        Ok(match value {
            Num::I(v) => v as u64,
            Num::U(v) => v,
            Num::F(v) => v as u64,
        })
    }

    fn read_f64(&mut self) -> Result<f64, ArchiveError> {
        let value = self.read_number_raw()?;
        self.step_context()?;
        Ok(match value {
            Num::I(v) => v as f64,
            Num::U(v) => v as f64,
            Num::F(v) => v,
        })
    }

    fn read_str(&mut self, into: &mut String) -> Result<(), ArchiveError> {
        let len = self.read_str_len()? as usize;
        self.step_context()?;
        let mut buf = vec![0u8; len];
        self.read_bytes(&mut buf)?;
        *into = String::from_utf8(buf)
            .map_err(|_| ArchiveError::Recoverable("invalid utf-8 in string".into()))?;
        Ok(())
    }

    fn elem_left(&self) -> Result<usize, ArchiveError> {
        Ok(self.top_scope()?.slots_left as usize)
    }

    fn begin_array(&mut self) -> Result<ContextKey, ArchiveError> {
        self.verify_not_key_slot()?;
        let count = self.read_array_len()?;
        self.step_context()?;
        Ok(self.new_scope(ScopeKind::Array, u64::from(count)))
    }

    fn end_array(&mut self, key: ContextKey) -> Result<(), ArchiveError> {
        let breaks = self.count_break_scopes(ScopeKind::Array, key)?;
        for _ in 0..breaks {
            self.break_scope()?;
        }
        Ok(())
    }

    fn begin_object(&mut self) -> Result<ContextKey, ArchiveError> {
        self.verify_not_key_slot()?;
        let count = self.read_map_len()?;
        self.step_context()?;
        Ok(self.new_scope(ScopeKind::Object, u64::from(count)))
    }

    fn end_object(&mut self, key: ContextKey) -> Result<(), ArchiveError> {
        let breaks = self.count_break_scopes(ScopeKind::Object, key)?;
        for _ in 0..breaks {
            self.break_scope()?;
        }
        Ok(())
    }

    fn should_break(&self, key: ContextKey) -> Result<bool, ArchiveError> {
        let top = self.top_scope()?;
        Ok(top.key == key.raw() && top.slots_left == 0)
    }

    fn read_key_next(&mut self) -> Result<(), ArchiveError> {
        let top = self.verify_top(ScopeKind::Object)?;
        if top.slots_left % 2 != 0 {
            return Err(ArchiveError::InvalidContext("not in key position"));
        }
        if top.reading_key {
            return Err(ArchiveError::CheckFailed("read_key_next called twice"));
        }
        top.reading_key = true;
        Ok(())
    }

    fn begin_binary(&mut self) -> Result<usize, ArchiveError> {
        self.verify_not_key_slot()?;
        let len = self.read_bin_len()?;
        self.step_context()?;
        self.new_scope(ScopeKind::Binary, u64::from(len));
        Ok(len as usize)
    }

    fn binary_read_some(&mut self, buf: &mut [u8]) -> Result<usize, ArchiveError> {
        let left = {
            let top = self.verify_top(ScopeKind::Binary)?;
            top.slots_left as usize
        };
        let take = buf.len().min(left);
        self.read_bytes(&mut buf[..take])?;
        let top = self.verify_top(ScopeKind::Binary)?;
        top.slots_left -= take as u64;
        Ok(take)
    }

    fn end_binary(&mut self) -> Result<(), ArchiveError> {
        let leftover = {
            let top = self.verify_top(ScopeKind::Binary)?;
            top.slots_left as usize
        };
        self.scopes.pop();
        self.discard(leftover)
    }

    fn type_next(&mut self) -> Result<EntityType, ArchiveError> {
        let header = self.peek()?;
        match header {
            tc::FLOAT32 | tc::FLOAT64 => Ok(EntityType::FloatingPoint),
            0x00..=0x7f | 0xe0..=0xff | tc::UINT8..=tc::UINT64 | tc::INT8..=tc::INT64 => {
                Ok(EntityType::Integer)
            }
            tc::FALSE | tc::TRUE => Ok(EntityType::Boolean),
            0xa0..=0xbf | tc::STR8..=tc::STR32 => Ok(EntityType::String),
            tc::BIN8..=tc::BIN32 => Ok(EntityType::Binary),
            0x90..=0x9f | tc::ARRAY16 | tc::ARRAY32 => Ok(EntityType::Array),
            0x80..=0x8f | tc::MAP16 | tc::MAP32 => Ok(EntityType::Dictionary),
            tc::NIL => Ok(EntityType::Null),
            other => Err(ArchiveError::ParseFailed(format!(
                "unsupported typecode {other:#04x}"
            ))),
        }
    }
}
