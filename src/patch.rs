use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::debug;
use zerocopy::LayoutVerified;

use crate::{seek_from_wire, EntryHeader, Error, PatchHeader, Result, FLUSH, MAGIC};

/// Size of the fixed copy buffers.
const BLOCK_SIZE: usize = 32 * 1024;

/// Name of the in-progress block file inside the cache directory.
const SCRATCH_NAME: &str = "bdelta.tmp";

macro_rules! read {
    ($reader:expr, $type:ty) => {{
        let mut buf = [0; size_of::<$type>()];
        let data: Result<$type> = $reader
            .read_exact(&mut buf)
            .map_err(Error::PatchIo)
            .and_then(|_| {
                LayoutVerified::<_, $type>::new_unaligned(&buf[..])
                    .map(|data| *data)
                    .ok_or(Error::Algorithm("record header layout mismatch"))
            });
        data
    }};
}

/// Adds `size` patch bytes onto as many reference bytes modulo 256, accumulating the CRC of the
/// reference bytes consumed.
fn apply_diff(
    patch_f: &mut impl Read,
    old_f: &mut impl Read,
    new_f: &mut impl Write,
    mut size: u64,
    oldcrc: &mut Hasher,
) -> Result<()> {
    let mut old = [0; BLOCK_SIZE];
    let mut patch = [0; BLOCK_SIZE];
    while size > 0 {
        let to_read = (BLOCK_SIZE as u64).min(size) as usize;
        let old = &mut old[..to_read];
        let patch = &mut patch[..to_read];

        patch_f.read_exact(patch).map_err(Error::PatchIo)?;
        old_f.read_exact(old).map_err(Error::OldIo)?;

        oldcrc.update(old);
        old.iter_mut()
            .zip(patch.iter())
            .for_each(|(old, patch)| *old = old.wrapping_add(*patch));

        new_f.write_all(old).map_err(Error::NewIo)?;

        size -= to_read as u64;
    }
    Ok(())
}

fn copy_bytes(src: &mut impl Read, dst: &mut impl Write, mut bytes: u64) -> Result<()> {
    let mut buf = [0; BLOCK_SIZE];
    while bytes > 0 {
        let to_read = (BLOCK_SIZE as u64).min(bytes) as usize;
        let buf = &mut buf[..to_read];
        src.read_exact(buf).map_err(Error::PatchIo)?;
        dst.write_all(buf).map_err(Error::NewIo)?;
        bytes -= to_read as u64;
    }
    Ok(())
}

fn read_header(patch: &mut impl Read) -> Result<u64> {
    let header = read!(patch, PatchHeader)?;
    if &header.magic != MAGIC {
        return Err(Error::BadMagic);
    }
    Ok(header.new_file_size.get())
}

/// Apply a patch to `old`, writing the reconstructed target to `new`.
///
/// `old` only needs relative seeks; `new` and the patch are consumed strictly sequentially, and
/// nothing past the next record header is ever buffered. Block-boundary records are passed over,
/// so this mode is for patches generated as a single block (`block_size` 0): a blocked patch
/// encodes each block against the reconstruction of the previous ones, which only
/// [`apply_cached`] mirrors.
pub fn apply(
    old: &mut (impl Read + Seek),
    new: &mut impl Write,
    patch: &mut impl Read,
) -> Result<()> {
    let expected = read_header(patch)?;
    let mut bytes_written: u64 = 0;
    let mut oldcrc = Hasher::new();
    loop {
        let entry = read!(patch, EntryHeader)?;
        let seek = seek_from_wire(entry.seek.get());
        if entry.diff.get() == 0 && entry.extra.get() == 0 && seek == 0 {
            new.flush().map_err(Error::NewIo)?;
            return if bytes_written == expected {
                Ok(())
            } else {
                Err(Error::PatchShort {
                    written: bytes_written,
                    expected,
                })
            };
        }
        if seek == FLUSH {
            continue;
        }

        apply_diff(patch, old, new, u64::from(entry.diff.get()), &mut oldcrc)?;
        copy_bytes(patch, new, u64::from(entry.extra.get()))?;
        old.seek(SeekFrom::Current(i64::from(seek)))
            .map_err(Error::OldIo)?;
        bytes_written += u64::from(entry.diff.get()) + u64::from(entry.extra.get());
    }
}

fn create_block(path: &Path) -> Result<File> {
    File::create(path).map_err(Error::NewIo)
}

/// Copy `src` over `old[start..end)`, leaving the reference cursor where it was. The spliced
/// bytes must hash to `want`; a mismatch means the cache entry does not hold this block.
fn splice_block(src: &Path, old: &mut File, start: u64, end: u64, want: u32) -> Result<()> {
    let mut buf = [0; BLOCK_SIZE];
    let mut crc = Hasher::new();
    let origin = old.stream_position().map_err(Error::OldIo)?;
    old.seek(SeekFrom::Start(start)).map_err(Error::OldIo)?;
    let mut src = File::open(src).map_err(Error::NewIo)?;

    let mut from = start;
    while from < end {
        let to_read = (BLOCK_SIZE as u64).min(end - from) as usize;
        let buf = &mut buf[..to_read];
        src.read_exact(buf).map_err(Error::NewIo)?;
        crc.update(buf);
        old.write_all(buf).map_err(Error::OldIo)?;
        from += to_read as u64;
    }

    old.sync_all().map_err(Error::OldIo)?;
    old.seek(SeekFrom::Start(origin)).map_err(Error::OldIo)?;

    if crc.finalize() != want {
        return Err(Error::NewIo(io::Error::new(
            io::ErrorKind::InvalidData,
            "cached block failed its checksum",
        )));
    }
    Ok(())
}

/// Apply a patch with the block cache, rewriting `old` in place.
///
/// The current block of output goes to a scratch file inside `dir`. At every block boundary a
/// block whose reference checksum matched is kept under its target checksum, and a block some
/// earlier run already verified is spliced over the matching region of `old` — which is how an
/// interrupted application resumes, and why `old` must be opened read + write. After the final
/// block `old` holds the reconstructed target (plus any original bytes past its end, when the
/// target is shorter than the reference).
pub fn apply_cached(old: &mut File, dir: &Path, patch: &mut impl Read) -> Result<()> {
    let expected = read_header(patch)?;
    let scratch = dir.join(SCRATCH_NAME);
    let _ = fs::remove_file(&scratch);
    let mut block = create_block(&scratch)?;
    let mut bytes_written: u64 = 0;
    let mut oldcrc = Hasher::new();

    loop {
        let entry = read!(patch, EntryHeader)?;
        let seek = seek_from_wire(entry.seek.get());
        if entry.diff.get() == 0 && entry.extra.get() == 0 && seek == 0 {
            block.sync_all().map_err(Error::NewIo)?;
            drop(block);
            let _ = fs::remove_file(&scratch);
            return if bytes_written == expected {
                Ok(())
            } else {
                Err(Error::PatchShort {
                    written: bytes_written,
                    expected,
                })
            };
        }

        if seek == FLUSH {
            let record_oldcrc = entry.diff.get();
            let record_newcrc = entry.extra.get();
            let block_len = block.stream_position().map_err(Error::NewIo)?;
            let start = bytes_written - block_len;
            block.sync_all().map_err(Error::NewIo)?;
            drop(block);

            let cached = cache_entry(dir, record_newcrc);
            if oldcrc.finalize() == record_oldcrc {
                debug!(newcrc = record_newcrc, "block verified, promoting to cache");
                let _ = fs::remove_file(&cached);
                fs::rename(&scratch, &cached).map_err(Error::NewIo)?;
            }
            if cached.exists() {
                debug!(newcrc = record_newcrc, start, "splicing block over reference");
                splice_block(&cached, old, start, bytes_written, record_newcrc)?;
                let _ = fs::remove_file(&cached);
            }

            let _ = fs::remove_file(&scratch);
            block = create_block(&scratch)?;
            oldcrc = Hasher::new();
            continue;
        }

        apply_diff(
            patch,
            old,
            &mut block,
            u64::from(entry.diff.get()),
            &mut oldcrc,
        )?;
        copy_bytes(patch, &mut block, u64::from(entry.extra.get()))?;
        old.seek(SeekFrom::Current(i64::from(seek)))
            .map_err(Error::OldIo)?;
        bytes_written += u64::from(entry.diff.get()) + u64::from(entry.extra.get());
    }
}

/// Cache filename for a verified block, keyed by the CRC-32 of its contents.
fn cache_entry(dir: &Path, newcrc: u32) -> PathBuf {
    dir.join(format!("{newcrc}.tmp"))
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use byteorder::{BigEndian, WriteBytesExt};

    use super::*;
    use crate::seek_to_wire;

    fn header(new_file_size: u64) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.write_u64::<BigEndian>(new_file_size).unwrap();
        out
    }

    fn entry(diff: u32, extra: u32, seek: i32) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.write_u32::<BigEndian>(diff).unwrap();
        out.write_u32::<BigEndian>(extra).unwrap();
        out.write_u32::<BigEndian>(seek_to_wire(seek)).unwrap();
        out
    }

    const END: [u8; 12] = [0; 12];

    #[test]
    fn handcrafted_stream_reconstructs() {
        let old = b"aaaabbbb";
        let mut patch = header(10);
        // "aaaa" + 1 each = "bbbb", then two literals, rewind, "aaaa" verbatim
        patch.extend(entry(4, 2, -4));
        patch.extend([1u8; 4]);
        patch.extend(b"XY");
        patch.extend(entry(4, 0, 0));
        patch.extend([0u8; 4]);
        patch.extend(END);

        let mut out = Vec::new();
        apply(&mut Cursor::new(old), &mut out, &mut &patch[..]).unwrap();
        assert_eq!(out, b"bbbbXYaaaa");
    }

    #[test]
    fn flush_records_are_skipped() {
        let old = b"12345678";
        let mut patch = header(4);
        patch.extend(entry(0xDEAD_BEEF, 0x0BAD_CAFE, FLUSH));
        patch.extend(entry(4, 0, 0));
        patch.extend([0u8; 4]);
        patch.extend(entry(0xDEAD_BEEF, 0x0BAD_CAFE, FLUSH));
        patch.extend(END);

        let mut out = Vec::new();
        apply(&mut Cursor::new(old), &mut out, &mut &patch[..]).unwrap();
        assert_eq!(out, b"1234");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut patch = b"NOTMINE0".to_vec();
        patch.write_u64::<BigEndian>(0).unwrap();
        patch.extend(END);
        let err = apply(&mut Cursor::new(b""), &mut Vec::new(), &mut &patch[..]).unwrap_err();
        assert!(matches!(err, Error::BadMagic));
    }

    #[test]
    fn missing_end_sentinel_is_patch_io() {
        let old = b"aaaa";
        let mut patch = header(4);
        patch.extend(entry(4, 0, 0));
        patch.extend([0u8; 4]);
        // no END
        let err = apply(&mut Cursor::new(old), &mut Vec::new(), &mut &patch[..]).unwrap_err();
        assert!(matches!(err, Error::PatchIo(_)));
    }

    #[test]
    fn declared_size_mismatch_is_patch_short() {
        let old = b"aaaa";
        let mut patch = header(5);
        patch.extend(entry(4, 0, 0));
        patch.extend([0u8; 4]);
        patch.extend(END);
        let err = apply(&mut Cursor::new(old), &mut Vec::new(), &mut &patch[..]).unwrap_err();
        assert!(matches!(
            err,
            Error::PatchShort {
                written: 4,
                expected: 5
            }
        ));
    }

    #[test]
    fn corrupt_length_field_errors_without_panicking() {
        let old = b"aaaa";
        let mut patch = header(4);
        patch.extend(entry(4, 0, 0));
        patch.extend([0u8; 4]);
        patch.extend(END);
        // inflate the first record's diff count far past the payload
        patch[16] = 0xFF;
        let err = apply(&mut Cursor::new(old), &mut Vec::new(), &mut &patch[..]).unwrap_err();
        assert!(matches!(err, Error::PatchIo(_) | Error::OldIo(_)));
    }

    fn write_reference(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("reference.bin");
        fs::write(&path, bytes).unwrap();
        path
    }

    fn open_rw(path: &Path) -> File {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn cached_apply_patches_reference_in_place() {
        let mut old = Vec::new();
        for i in 0..100u32 {
            old.extend(i.to_le_bytes());
        }
        let mut new = old.clone();
        new[13] ^= 0xA5;
        new.extend(std::iter::repeat(0xEEu8).take(600));

        let mut patch = Vec::new();
        crate::generate(&old, &new, &mut patch, 64).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let reference = write_reference(dir.path(), &old);
        let mut old_f = open_rw(&reference);
        apply_cached(&mut old_f, dir.path(), &mut &patch[..]).unwrap();
        drop(old_f);

        assert_eq!(fs::read(&reference).unwrap(), new);
        // every block was verified, spliced, and its cache entry consumed
        assert!(!dir.path().join(SCRATCH_NAME).exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("reference.bin")]);
    }

    #[test]
    fn cached_apply_recovers_from_seeded_cache() {
        const BS: usize = 256;
        use rand_xoshiro::rand_core::{RngCore, SeedableRng};
        let mut rng = rand_xoshiro::Xoshiro256Plus::seed_from_u64(42);
        let mut old = vec![0u8; 4 * BS];
        rng.fill_bytes(&mut old);
        let mut new = old.clone();
        new[3 * BS + 10] ^= 0x42;

        let mut patch = Vec::new();
        crate::generate(&old, &new, &mut patch, BS).unwrap();

        // the reference on disk is damaged inside the first block, but an earlier run
        // left that block's verified reconstruction in the cache
        let mut damaged = old.clone();
        damaged[5] ^= 0xFF;
        let dir = tempfile::tempdir().unwrap();
        let reference = write_reference(dir.path(), &damaged);
        let seeded = cache_entry(dir.path(), crc32fast::hash(&new[..BS]));
        fs::write(&seeded, &new[..BS]).unwrap();

        let mut old_f = open_rw(&reference);
        apply_cached(&mut old_f, dir.path(), &mut &patch[..]).unwrap();
        drop(old_f);

        assert_eq!(fs::read(&reference).unwrap(), new);
    }

    #[test]
    fn cached_apply_rejects_lying_cache_entry() {
        const BS: usize = 128;
        let old = vec![7u8; 2 * BS];
        let mut new = old.clone();
        new[0] = 9;

        let mut patch = Vec::new();
        crate::generate(&old, &new, &mut patch, BS).unwrap();

        // damage the reference so the first block cannot be verified, then seed its cache
        // slot with bytes that do not hash to the recorded checksum
        let mut damaged = old.clone();
        damaged[1] ^= 0xFF;
        let dir = tempfile::tempdir().unwrap();
        let reference = write_reference(dir.path(), &damaged);
        let seeded = cache_entry(dir.path(), crc32fast::hash(&new[..BS]));
        fs::write(&seeded, vec![0u8; BS]).unwrap();

        let mut old_f = open_rw(&reference);
        let err = apply_cached(&mut old_f, dir.path(), &mut &patch[..]).unwrap_err();
        assert!(matches!(err, Error::NewIo(_)));
    }

    #[test]
    fn negative_seek_walks_backwards() {
        let old = b"abcd";
        let mut patch = header(8);
        patch.extend(entry(4, 0, -4));
        patch.extend([0u8; 4]);
        patch.extend(entry(4, 0, 0));
        patch.extend([0u8; 4]);
        patch.extend(END);
        let mut out = Vec::new();
        apply(&mut Cursor::new(old), &mut out, &mut &patch[..]).unwrap();
        assert_eq!(out, b"abcdabcd");
    }
}
