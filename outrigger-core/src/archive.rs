//! SAX-style archive contract.
//!
//! A [`ArchiveWrite`]/[`ArchiveRead`] pair is the only way typed data crosses
//! a byte stream. Concrete encodings (msgpack being the primary) implement
//! these traits; the metadata layer drives them without knowing the wire
//! format.

use std::fmt::Write as _;

use crate::error::ArchiveError;

/// SAX-level kind of the next element in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Null,
    Boolean,
    Integer,
    FloatingPoint,
    String,
    Binary,
    Array,
    Tuple,
    Dictionary,
    Object,
}

impl EntityType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::FloatingPoint => "floating_point",
            Self::String => "string",
            Self::Binary => "binary",
            Self::Array => "array",
            Self::Tuple => "tuple",
            Self::Dictionary => "dictionary",
            Self::Object => "object",
        }
    }
}

/// Opaque token returned by `begin_array`/`begin_object` and consumed by the
/// matching `end_*` call. Passing a foreign or stale key fails with
/// [`ArchiveError::InvalidContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextKey(u64);

impl ContextKey {
    /// Mint a key. Reserved for archive implementations.
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Behavioral switches shared by readers and writers.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveConfig {
    /// Encode object keys as unsigned integers derived from metadata instead
    /// of strings. Must match between peers.
    pub use_integer_key: bool,

    /// Reader: tolerate absent required properties.
    pub allow_missing_argument: bool,

    /// Reader: silently discard unknown object keys.
    pub allow_unknown_argument: bool,

    /// Reader: merge into existing containers instead of clearing them.
    pub merge_on_read: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            use_integer_key: false,
            allow_missing_argument: true,
            allow_unknown_argument: true,
            merge_on_read: false,
        }
    }
}

/// Typed, context-scoped encoder over a byte stream.
pub trait ArchiveWrite {
    fn config(&self) -> &ArchiveConfig;

    fn write_null(&mut self) -> Result<(), ArchiveError>;
    fn write_bool(&mut self, value: bool) -> Result<(), ArchiveError>;
    fn write_i64(&mut self, value: i64) -> Result<(), ArchiveError>;
    fn write_u64(&mut self, value: u64) -> Result<(), ArchiveError>;
    fn write_f32(&mut self, value: f32) -> Result<(), ArchiveError> {
        self.write_f64(f64::from(value))
    }
    fn write_f64(&mut self, value: f64) -> Result<(), ArchiveError>;
    fn write_str(&mut self, value: &str) -> Result<(), ArchiveError>;

    /// Open an array scope of exactly `num_elems` elements.
    fn array_push(&mut self, num_elems: usize) -> Result<(), ArchiveError>;
    fn array_pop(&mut self) -> Result<(), ArchiveError>;

    /// Open an object scope of exactly `num_elems` key/value pairs.
    fn object_push(&mut self, num_elems: usize) -> Result<(), ArchiveError>;
    fn object_pop(&mut self) -> Result<(), ArchiveError>;

    /// Assert that the next write inside an object scope is a key.
    fn write_key_next(&mut self) -> Result<(), ArchiveError>;

    /// Open a binary scope. Exactly `total` bytes must be written through
    /// `binary_write_some` before `binary_pop`.
    fn binary_push(&mut self, total: usize) -> Result<(), ArchiveError>;
    fn binary_write_some(&mut self, chunk: &[u8]) -> Result<(), ArchiveError>;
    fn binary_pop(&mut self) -> Result<(), ArchiveError>;

    /// Commit internally buffered bytes to the underlying stream.
    fn flush(&mut self) -> Result<(), ArchiveError>;
}

/// Typed, context-scoped decoder over a byte stream.
pub trait ArchiveRead {
    fn config(&self) -> &ArchiveConfig;

    /// Consume and discard the next element, recursing into containers.
    fn skip_next(&mut self) -> Result<(), ArchiveError>;

    fn read_bool(&mut self) -> Result<bool, ArchiveError>;
    fn read_i64(&mut self) -> Result<i64, ArchiveError>;
    fn read_u64(&mut self) -> Result<u64, ArchiveError>;
    fn read_f64(&mut self) -> Result<f64, ArchiveError>;
    fn read_str(&mut self, into: &mut String) -> Result<(), ArchiveError>;

    /// Remaining element slots in the innermost active scope.
    fn elem_left(&self) -> Result<usize, ArchiveError>;

    fn begin_array(&mut self) -> Result<ContextKey, ArchiveError>;
    fn end_array(&mut self, key: ContextKey) -> Result<(), ArchiveError>;
    fn begin_object(&mut self) -> Result<ContextKey, ArchiveError>;
    fn end_object(&mut self, key: ContextKey) -> Result<(), ArchiveError>;

    /// The only legal termination test for variable-length containers.
    fn should_break(&self, key: ContextKey) -> Result<bool, ArchiveError>;

    /// Assert that the next read inside an object scope is a key.
    fn read_key_next(&mut self) -> Result<(), ArchiveError>;

    /// Open a binary scope; returns the total byte count.
    fn begin_binary(&mut self) -> Result<usize, ArchiveError>;
    fn binary_read_some(&mut self, buf: &mut [u8]) -> Result<usize, ArchiveError>;
    fn end_binary(&mut self) -> Result<(), ArchiveError>;

    /// Peek the kind of the next element without consuming it.
    fn type_next(&mut self) -> Result<EntityType, ArchiveError>;

    fn is_null_next(&mut self) -> Result<bool, ArchiveError> {
        Ok(self.type_next()? == EntityType::Null)
    }
}

/// Dump exactly one element from `reader` as JSON-style text.
///
/// Used for the reply-error buffer path: the error slot of a REPLY is
/// captured as human-readable text without knowing its shape. Binary
/// payloads render as number arrays.
pub fn dump_json(reader: &mut dyn ArchiveRead, out: &mut String) -> Result<(), ArchiveError> {
    match reader.type_next()? {
        EntityType::Null => {
            reader.skip_next()?;
            out.push_str("null");
        }
        EntityType::Boolean => {
            let value = reader.read_bool()?;
            out.push_str(if value { "true" } else { "false" });
        }
        EntityType::Integer => {
            let value = reader.read_i64()?;
            let _ = write!(out, "{value}");
        }
        EntityType::FloatingPoint => {
            let value = reader.read_f64()?;
            let _ = write!(out, "{value}");
        }
        EntityType::String => {
            let mut text = String::new();
            reader.read_str(&mut text)?;
            escape_json(&text, out);
        }
        EntityType::Binary => {
            let total = reader.begin_binary()?;
            out.push('[');
            let mut chunk = [0u8; 64];
            let mut read = 0usize;
            let mut first = true;
            while read < total {
                let n = reader.binary_read_some(&mut chunk)?;
                if n == 0 {
                    break;
                }
                for byte in &chunk[..n] {
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    let _ = write!(out, "{byte}");
                }
                read += n;
            }
            reader.end_binary()?;
            out.push(']');
        }
        EntityType::Array | EntityType::Tuple => {
            let key = reader.begin_array()?;
            out.push('[');
            let mut first = true;
            while !reader.should_break(key)? {
                if !first {
                    out.push(',');
                }
                first = false;
                dump_json(reader, out)?;
            }
            reader.end_array(key)?;
            out.push(']');
        }
        EntityType::Dictionary | EntityType::Object => {
            let key = reader.begin_object()?;
            out.push('{');
            let mut first = true;
            while !reader.should_break(key)? {
                if !first {
                    out.push(',');
                }
                first = false;
                reader.read_key_next()?;
                dump_json(reader, out)?;
                out.push(':');
                dump_json(reader, out)?;
            }
            reader.end_object(key)?;
            out.push('}');
        }
    }
    Ok(())
}

fn escape_json(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keys_compare_by_value() {
        assert_eq!(ContextKey::new(7), ContextKey::new(7));
        assert_ne!(ContextKey::new(7), ContextKey::new(8));
    }

    #[test]
    fn default_config_is_lenient() {
        let config = ArchiveConfig::default();
        assert!(!config.use_integer_key);
        assert!(config.allow_missing_argument);
        assert!(config.allow_unknown_argument);
        assert!(!config.merge_on_read);
    }

    #[test]
    fn json_escaping() {
        let mut out = String::new();
        escape_json("a\"b\\c\nd", &mut out);
        assert_eq!(out, "\"a\\\"b\\\\c\\nd\"");
    }
}
