//! msgpack encoder.
//!
//! Stages frames in an internal buffer and commits them to the bound byte
//! stream on [`flush`](ArchiveWrite::flush), so everything written between
//! flushes lands contiguously on the wire. Integer policy: smallest
//! lossless encoding, fix-forms when in range.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use outrigger_core::archive::{ArchiveConfig, ArchiveWrite};
use outrigger_core::error::ArchiveError;
use outrigger_core::transport::ByteStream;

use crate::typecode as tc;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Object,
    Array,
    Binary,
}

struct Scope {
    kind: ScopeKind,
    /// Object scopes count key and value slots separately (2n); binary
    /// scopes count bytes.
    slots_left: usize,
    key_pending: bool,
}

/// Tracks open scopes and enforces the element/key write discipline.
#[derive(Default)]
struct WriteContext {
    scopes: SmallVec<[Scope; 8]>,
}

impl WriteContext {
    fn write_next(&mut self) -> Result<(), ArchiveError> {
        let Some(top) = self.scopes.last_mut() else {
            return Ok(());
        };
        match top.kind {
            ScopeKind::Binary => {
                return Err(ArchiveError::CheckFailed(
                    "binary scope cannot contain elements",
                ))
            }
            ScopeKind::Object => {
                if top.slots_left == 0 {
                    return Err(ArchiveError::CheckFailed("all object elements written"));
                }
                if top.slots_left % 2 == 0 {
                    if !top.key_pending {
                        return Err(ArchiveError::CheckFailed("write_key_next was not called"));
                    }
                    top.key_pending = false;
                }
                top.slots_left -= 1;
            }
            ScopeKind::Array => {
                if top.slots_left == 0 {
                    return Err(ArchiveError::CheckFailed("all array elements written"));
                }
                top.slots_left -= 1;
            }
        }
        Ok(())
    }

    fn key_next(&mut self) -> Result<(), ArchiveError> {
        let Some(top) = self.scopes.last_mut() else {
            return Err(ArchiveError::InvalidContext("write_key_next outside object"));
        };
        if top.kind != ScopeKind::Object {
            return Err(ArchiveError::InvalidContext("write_key_next outside object"));
        }
        if top.slots_left % 2 != 0 {
            return Err(ArchiveError::CheckFailed("key is not expected here"));
        }
        if top.key_pending {
            return Err(ArchiveError::CheckFailed("write_key_next called twice"));
        }
        top.key_pending = true;
        Ok(())
    }

    fn push(&mut self, kind: ScopeKind, raw_count: usize) {
        let slots = if kind == ScopeKind::Object {
            raw_count * 2
        } else {
            raw_count
        };
        self.scopes.push(Scope {
            kind,
            slots_left: slots,
            key_pending: false,
        });
    }

    fn pop(&mut self, kind: ScopeKind) -> Result<(), ArchiveError> {
        let Some(top) = self.scopes.last() else {
            return Err(ArchiveError::InvalidContext("no open scope to pop"));
        };
        if top.kind != kind {
            return Err(ArchiveError::InvalidContext("scope kind mismatch on pop"));
        }
        if top.slots_left != 0 {
            return Err(ArchiveError::InvalidContext("scope closed early"));
        }
        self.scopes.pop();
        Ok(())
    }

    fn binary_write(&mut self, len: usize) -> Result<(), ArchiveError> {
        let Some(top) = self.scopes.last_mut() else {
            return Err(ArchiveError::InvalidContext("no open binary scope"));
        };
        if top.kind != ScopeKind::Binary {
            return Err(ArchiveError::InvalidContext("not inside a binary scope"));
        }
        if len > top.slots_left {
            return Err(ArchiveError::CheckFailed("binary write exceeds declared size"));
        }
        top.slots_left -= len;
        Ok(())
    }
}

pub struct Writer {
    sink: Option<Arc<dyn ByteStream>>,
    out: BytesMut,
    ctx: WriteContext,
    pub config: ArchiveConfig,
}

impl Writer {
    #[must_use]
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            sink: None,
            out: BytesMut::with_capacity(256),
            ctx: WriteContext::default(),
            config,
        }
    }

    /// Rebind to a byte stream, dropping any staged bytes and scope state.
    pub fn bind(&mut self, sink: Arc<dyn ByteStream>) {
        self.sink = Some(sink);
        self.out.clear();
        self.ctx = WriteContext::default();
    }

    /// Detach the staged bytes; mainly for tests and offline encoding.
    pub fn take_buffer(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    fn check_u32(&self, size: usize) -> Result<u32, ArchiveError> {
        u32::try_from(size).map_err(|_| ArchiveError::CheckFailed("size exceeds 32-bit range"))
    }

    /// str/bin/ext share the 8/16/32-bit length-header ladder.
    fn put_size8(&mut self, base: u8, size: u32) {
        if size > 0xffff {
            self.out.put_u8(base + 2);
            self.out.put_u32(size);
        } else if size > 0xff {
            self.out.put_u8(base + 1);
            self.out.put_u16(size as u16);
        } else {
            self.out.put_u8(base);
            self.out.put_u8(size as u8);
        }
    }

    fn put_uint(&mut self, value: u64) {
        if value < 0x80 {
            self.out.put_u8(value as u8);
        } else if value <= 0xff {
            self.out.put_u8(tc::UINT8);
            self.out.put_u8(value as u8);
        } else if value <= 0xffff {
            self.out.put_u8(tc::UINT16);
            self.out.put_u16(value as u16);
        } else if value <= 0xffff_ffff {
            self.out.put_u8(tc::UINT32);
            self.out.put_u32(value as u32);
        } else {
            self.out.put_u8(tc::UINT64);
            self.out.put_u64(value);
        }
    }
}

impl ArchiveWrite for Writer {
    fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    fn write_null(&mut self) -> Result<(), ArchiveError> {
        self.ctx.write_next()?;
        self.out.put_u8(tc::NIL);
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<(), ArchiveError> {
        self.ctx.write_next()?;
        self.out.put_u8(if value { tc::TRUE } else { tc::FALSE });
        Ok(())
    }

    fn write_i64(&mut self, value: i64) -> Result<(), ArchiveError> {
        self.ctx.write_next()?;
        if value >= 0 {
            self.put_uint(value as u64);
        } else if value >= -32 {
            self.out.put_u8(value as u8); // negative fixint
        } else if value >= i64::from(i8::MIN) {
            self.out.put_u8(tc::INT8);
            self.out.put_i8(value as i8);
        } else if value >= i64::from(i16::MIN) {
            self.out.put_u8(tc::INT16);
            self.out.put_i16(value as i16);
        } else if value >= i64::from(i32::MIN) {
            self.out.put_u8(tc::INT32);
            self.out.put_i32(value as i32);
        } else {
            self.out.put_u8(tc::INT64);
            self.out.put_i64(value);
        }
        Ok(())
    }

    fn write_u64(&mut self, value: u64) -> Result<(), ArchiveError> {
        self.ctx.write_next()?;
        self.put_uint(value);
        Ok(())
    }

    fn write_f32(&mut self, value: f32) -> Result<(), ArchiveError> {
        self.ctx.write_next()?;
        self.out.put_u8(tc::FLOAT32);
        self.out.put_f32(value);
        Ok(())
    }

    fn write_f64(&mut self, value: f64) -> Result<(), ArchiveError> {
        self.ctx.write_next()?;
        self.out.put_u8(tc::FLOAT64);
        self.out.put_f64(value);
        Ok(())
    }

    fn write_str(&mut self, value: &str) -> Result<(), ArchiveError> {
        let size = self.check_u32(value.len())?;
        self.ctx.write_next()?;
        if size < 32 {
            self.out.put_u8(tc::FIXSTR | size as u8);
        } else {
            self.put_size8(tc::STR8, size);
        }
        self.out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn array_push(&mut self, num_elems: usize) -> Result<(), ArchiveError> {
        let size = self.check_u32(num_elems)?;
        self.ctx.write_next()?;
        self.ctx.push(ScopeKind::Array, num_elems);
        if size < 16 {
            self.out.put_u8(tc::FIXARRAY | size as u8);
        } else if size <= 0xffff {
            self.out.put_u8(tc::ARRAY16);
            self.out.put_u16(size as u16);
        } else {
            self.out.put_u8(tc::ARRAY32);
            self.out.put_u32(size);
        }
        Ok(())
    }

    fn array_pop(&mut self) -> Result<(), ArchiveError> {
        self.ctx.pop(ScopeKind::Array)
    }

    fn object_push(&mut self, num_elems: usize) -> Result<(), ArchiveError> {
        let size = self.check_u32(num_elems)?;
        self.ctx.write_next()?;
        self.ctx.push(ScopeKind::Object, num_elems);
        if size < 16 {
            self.out.put_u8(tc::FIXMAP | size as u8);
        } else if size <= 0xffff {
            self.out.put_u8(tc::MAP16);
            self.out.put_u16(size as u16);
        } else {
            self.out.put_u8(tc::MAP32);
            self.out.put_u32(size);
        }
        Ok(())
    }

    fn object_pop(&mut self) -> Result<(), ArchiveError> {
        self.ctx.pop(ScopeKind::Object)
    }

    fn write_key_next(&mut self) -> Result<(), ArchiveError> {
        self.ctx.key_next()
    }

    fn binary_push(&mut self, total: usize) -> Result<(), ArchiveError> {
        let size = self.check_u32(total)?;
        self.ctx.write_next()?;
        self.ctx.push(ScopeKind::Binary, total);
        self.put_size8(tc::BIN8, size);
        Ok(())
    }

    fn binary_write_some(&mut self, chunk: &[u8]) -> Result<(), ArchiveError> {
        self.ctx.binary_write(chunk.len())?;
        self.out.extend_from_slice(chunk);
        Ok(())
    }

    fn binary_pop(&mut self) -> Result<(), ArchiveError> {
        self.ctx.pop(ScopeKind::Binary)
    }

    fn flush(&mut self) -> Result<(), ArchiveError> {
        if let Some(sink) = &self.sink {
            if !self.out.is_empty() {
                sink.write(&self.out).map_err(ArchiveError::Stream)?;
                self.out.clear();
            }
            sink.flush().map_err(ArchiveError::Stream)?;
        }
        Ok(())
    }
}
