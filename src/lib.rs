//! A block-oriented binary delta engine in the bsdiff family. [`generate`] produces a compact
//! patch from a reference ("old") and a target ("new") byte sequence; [`apply`] and
//! [`apply_cached`] reconstruct the target from the reference plus the patch. Each run of the
//! target is encoded as an approximate match against the reference (a byte-wise difference modulo
//! 256) followed by a literal tail, which stays small whenever the two inputs share long stretches
//! of bytes at shifted offsets.
//!
//! The stream is cut into blocks of up to `block_size` target bytes. Every block boundary carries
//! a CRC-32 of the reference bytes consumed and of the target bytes produced, and [`apply_cached`]
//! keeps verified blocks on disk and splices them back over the reference, so a large update can
//! be applied in place and resumed after an interruption.
//!
//! Generation holds the reference, the target and the suffix array in memory at once: up to
//! o + n + 4 × (max(o, n) + 1) bytes for inputs of o and n bytes. Both inputs are capped at
//! 2³¹ − 1 bytes. Application streams through two fixed 32 KiB buffers.
//!
//! **Note**: the patch stream is not compressed, and unchanged regions still cost one difference
//! byte (zero) each. Run the stream through an external compressor if patch size matters.
//!
//! ## Features
//!
//! The suffix sort uses the C divsufsort library by default. A pure-Rust port is available for
//! builds without a C compiler; select it with `default-features = false`:
//!
//! ```toml
//! [dependencies]
//! bdelta = { version = "0.1.0", default-features = false }
//! ```

use byteorder::BigEndian;
use zerocopy::byteorder::{U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub use diff::generate;
pub use error::{Error, Result};
pub use patch::{apply, apply_cached};

/// First bytes of every patch stream; the trailing digits change with the format.
const MAGIC: &[u8; 8] = b"BDELTA01";

/// Reserved `seek` value marking a block boundary. Serialises as `7F FF FF FF`, which keeps it
/// distinct from the all-zero end-of-stream record.
const FLUSH: i32 = i32::MAX;

mod diff;
mod error;
mod patch;

#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct PatchHeader {
    magic: [u8; 8],
    new_file_size: U64<BigEndian>,
}

/// One record header. When the decoded `seek` equals [`FLUSH`], the record is a block boundary:
/// `diff` carries the reference CRC-32 and `extra` the target CRC-32, and no payload follows.
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct EntryHeader {
    diff: U32<BigEndian>,
    extra: U32<BigEndian>,
    seek: U32<BigEndian>,
}

/// Two's-complement bit pattern of a signed seek, spelled out so the wire bytes do not depend on
/// platform cast semantics.
fn seek_to_wire(value: i32) -> u32 {
    if value >= 0 {
        value as u32
    } else {
        !value.unsigned_abs() + 1
    }
}

fn seek_from_wire(raw: u32) -> i32 {
    if raw & 0x8000_0000 != 0 {
        -(raw.wrapping_neg() as i64) as i32
    } else {
        raw as i32
    }
}
