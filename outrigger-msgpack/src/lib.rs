//! Outrigger msgpack
//!
//! The concrete archive (bit-exact msgpack framing) and the msgpack-rpc
//! protocol adapter. Pure encode/decode over the `outrigger-core` archive
//! and transport contracts; no sockets or threads of its own.

pub mod reader;
pub mod rpc;
pub mod writer;

mod typecode;

pub use reader::Reader;
pub use rpc::{MsgpackRpc, ERR_INVALID_PARAMETER, ERR_METHOD_NOT_FOUND};
pub use writer::Writer;

#[cfg(test)]
mod tests {
    use outrigger_core::archive::{ArchiveConfig, ArchiveWrite};

    use crate::Writer;

    fn encoded(build: impl FnOnce(&mut Writer)) -> Vec<u8> {
        let mut writer = Writer::new(ArchiveConfig::default());
        build(&mut writer);
        writer.take_buffer().to_vec()
    }

    #[test]
    fn integer_boundaries_use_smallest_encoding() {
        assert_eq!(encoded(|w| w.write_i64(0).unwrap()), [0x00]);
        assert_eq!(encoded(|w| w.write_i64(127).unwrap()), [0x7f]);
        assert_eq!(encoded(|w| w.write_i64(128).unwrap()), [0xcc, 0x80]);
        assert_eq!(encoded(|w| w.write_i64(-1).unwrap()), [0xff]);
        assert_eq!(encoded(|w| w.write_i64(-32).unwrap()), [0xe0]);
        assert_eq!(encoded(|w| w.write_i64(-33).unwrap()), [0xd0, 0xdf]);
        assert_eq!(encoded(|w| w.write_i64(-129).unwrap()), [0xd1, 0xff, 0x7f]);
        assert_eq!(encoded(|w| w.write_u64(255).unwrap()), [0xcc, 0xff]);
        assert_eq!(encoded(|w| w.write_u64(256).unwrap()), [0xcd, 0x01, 0x00]);
        assert_eq!(
            encoded(|w| w.write_u64(0x1_0000_0000).unwrap()),
            [0xcf, 0, 0, 0, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn string_boundaries() {
        let short = "a".repeat(31);
        let bytes = encoded(|w| w.write_str(&short).unwrap());
        assert_eq!(bytes[0], 0xbf); // fixstr, 31 bytes
        assert_eq!(bytes.len(), 32);

        let long = "a".repeat(32);
        let bytes = encoded(|w| w.write_str(&long).unwrap());
        assert_eq!(&bytes[..2], &[0xd9, 32]); // str8
    }

    #[test]
    fn container_boundaries() {
        let bytes = encoded(|w| {
            w.array_push(15).unwrap();
            for _ in 0..15 {
                w.write_null().unwrap();
            }
            w.array_pop().unwrap();
        });
        assert_eq!(bytes[0], 0x9f); // fixarray

        let bytes = encoded(|w| {
            w.array_push(16).unwrap();
            for _ in 0..16 {
                w.write_null().unwrap();
            }
            w.array_pop().unwrap();
        });
        assert_eq!(&bytes[..3], &[0xdc, 0x00, 0x10]); // array16

        let bytes = encoded(|w| {
            w.object_push(1).unwrap();
            w.write_key_next().unwrap();
            w.write_str("k").unwrap();
            w.write_bool(true).unwrap();
            w.object_pop().unwrap();
        });
        assert_eq!(bytes, [0x81, 0xa1, b'k', 0xc3]);
    }

    #[test]
    fn floats_keep_their_width() {
        assert_eq!(encoded(|w| w.write_f32(1.0).unwrap())[0], 0xca);
        assert_eq!(encoded(|w| w.write_f64(1.0).unwrap())[0], 0xcb);
    }

    #[test]
    fn writer_enforces_key_discipline() {
        let mut writer = Writer::new(ArchiveConfig::default());
        writer.object_push(1).unwrap();
        // value write without write_key_next
        assert!(writer.write_str("k").is_err());
    }

    #[test]
    fn writer_rejects_early_pop() {
        let mut writer = Writer::new(ArchiveConfig::default());
        writer.array_push(2).unwrap();
        writer.write_null().unwrap();
        assert!(writer.array_pop().is_err());
    }
}
