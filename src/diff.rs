use std::cmp::Ordering;
use std::io::Write;

use byteorder::WriteBytesExt;
use crc32fast::Hasher;
use tracing::debug;
use zerocopy::byteorder::{U32, U64};
use zerocopy::AsBytes;

use crate::{seek_to_wire, EntryHeader, Error, PatchHeader, Result, FLUSH, MAGIC};

const FUZZ: isize = 8;

/// Consecutive near-stationary search steps tolerated before a cut is forced. Without this,
/// regions that differ from the reference by a handful of bytes every few positions keep the
/// scan loop pinned for quadratic time.
const MAX_STALLED_STEPS: u32 = 100;

/// Lexicographically sorted suffix indices of `text`, with one slack slot appended.
fn suffix_sort(text: &[u8]) -> Vec<i32> {
    if text.is_empty() {
        return vec![0];
    }
    #[cfg(feature = "c")]
    let sorted = cdivsufsort::sort(text);
    #[cfg(not(feature = "c"))]
    let sorted = divsufsort::sort(text);
    let mut sa = sorted.into_parts().1;
    sa.push(0);
    sa
}

fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Compares lexicographically over the shorter of the two lengths.
fn prefix_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let len = a.len().min(b.len());
    a[..len].cmp(&b[..len])
}

/// Binary search over `sa[st..=en]`, the sorted suffixes of `old`, for the longest prefix of
/// `new`. Returns the match length and stores its reference position in `pos`; ties resolve to
/// the higher suffix index.
fn search(sa: &[i32], old: &[u8], new: &[u8], st: usize, en: usize, pos: &mut isize) -> isize {
    if en - st < 2 {
        let x = match_len(&old[sa[st] as usize..], new) as isize;
        let y = match_len(&old[sa[en] as usize..], new) as isize;

        if x > y {
            *pos = sa[st] as isize;
            x
        } else {
            *pos = sa[en] as isize;
            y
        }
    } else {
        let x = st + (en - st) / 2;
        if prefix_cmp(&old[sa[x] as usize..], new) != Ordering::Greater {
            search(sa, old, new, x, en, pos)
        } else {
            search(sa, old, new, st, x, pos)
        }
    }
}

fn oversize() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "input exceeds 2 GiB - 1 limit",
    )
}

/// Generate a patch that rewrites `old` into `new`, writing the stream to `patch`.
///
/// `block_size` caps how many target bytes are encoded between two block boundaries; `0` encodes
/// the whole target as one block. Between blocks the finished slice of the target is overlaid
/// onto the reference and the suffix array is rebuilt, so later blocks may match against earlier
/// output — the counterpart of [`apply_cached`](crate::apply_cached) reusing verified blocks.
/// Smaller blocks make application resumable at a finer grain at some cost in patch size and
/// generation time.
pub fn generate(old: &[u8], new: &[u8], patch: &mut impl Write, block_size: usize) -> Result<()> {
    if old.len() > i32::MAX as usize {
        return Err(Error::OldIo(oversize()));
    }
    if new.len() > i32::MAX as usize {
        return Err(Error::NewIo(oversize()));
    }
    patch
        .write_all(
            PatchHeader {
                magic: *MAGIC,
                new_file_size: U64::new(new.len() as u64),
            }
            .as_bytes(),
        )
        .map_err(Error::PatchIo)?;

    let newsize = new.len() as isize;
    let block = block_size.min(i32::MAX as usize) as isize;

    // The reference buffer grows to target size up front; blocks finished later are overlaid
    // into the zero-padded tail before it is ever sorted.
    let mut old = old.to_vec();
    let mut oldsize = old.len() as isize;
    if new.len() > old.len() {
        old.resize(new.len(), 0);
    }

    let mut scan: isize = 0;
    let mut pos: isize = 0;
    let mut len: isize;
    let mut lastscan: isize = 0;
    let mut lastpos: isize = 0;
    let mut lastoffset: isize = 0;
    let mut scansize = if block > 0 { block.min(newsize) } else { newsize };

    loop {
        len = 0;
        let mut oldcrc = Hasher::new();
        let mut newcrc = Hasher::new();
        debug!(
            sorted = oldsize as i64,
            block_end = scansize as i64,
            "building suffix array"
        );
        let sa = suffix_sort(&old[..oldsize as usize]);

        while scan < scansize {
            let mut stalled = 0u32;
            let mut oldscore: isize = 0;
            scan += len;
            let mut scsc = scan;
            while scan < scansize {
                let prev_len = len;
                let prev_oldscore = oldscore;
                let prev_pos = pos;

                len = if oldsize == 0 {
                    pos = 0;
                    0
                } else {
                    search(
                        &sa,
                        &old[..oldsize as usize],
                        &new[scan as usize..scansize as usize],
                        0,
                        (oldsize - 1) as usize,
                        &mut pos,
                    )
                };

                while scsc < scan + len {
                    if scsc + lastoffset < oldsize
                        && old[(scsc + lastoffset) as usize] == new[scsc as usize]
                    {
                        oldscore += 1;
                    }
                    scsc += 1;
                }

                if (len == oldscore && len != 0) || len > oldscore + 8 {
                    break;
                }

                if scan + lastoffset < oldsize
                    && old[(scan + lastoffset) as usize] == new[scan as usize]
                {
                    oldscore -= 1;
                }

                if prev_len - FUZZ <= len
                    && len <= prev_len
                    && prev_oldscore - FUZZ <= oldscore
                    && oldscore <= prev_oldscore
                    && prev_pos <= pos
                    && pos <= prev_pos + FUZZ
                    && oldscore <= len
                    && len <= oldscore + FUZZ
                {
                    stalled += 1;
                } else {
                    stalled = 0;
                }
                if stalled > MAX_STALLED_STEPS {
                    break;
                }

                scan += 1;
            }

            if len != oldscore || scan == scansize {
                // Forward extension from the previous record's alignment: keep the prefix
                // where matches outweigh mismatches.
                let mut s: isize = 0;
                let mut best_f: isize = 0;
                let mut lenf: isize = 0;
                let mut i: isize = 0;
                while lastscan + i < scan && lastpos + i < oldsize {
                    if old[(lastpos + i) as usize] == new[(lastscan + i) as usize] {
                        s += 1;
                    }
                    i += 1;
                    if s * 2 - i > best_f * 2 - lenf {
                        best_f = s;
                        lenf = i;
                    }
                }

                // Backward extension from the new match, by the same score.
                let mut lenb: isize = 0;
                if scan < scansize {
                    let mut s: isize = 0;
                    let mut best_b: isize = 0;
                    let mut i: isize = 1;
                    while scan >= lastscan + i && pos >= i {
                        if old[(pos - i) as usize] == new[(scan - i) as usize] {
                            s += 1;
                        }
                        if s * 2 - i > best_b * 2 - lenb {
                            best_b = s;
                            lenb = i;
                        }
                        i += 1;
                    }
                }

                // The extensions may claim the same target bytes; split the overlap where the
                // forward side stops out-matching the backward side.
                if lastscan + lenf > scan - lenb {
                    let overlap = (lastscan + lenf) - (scan - lenb);
                    let mut s: isize = 0;
                    let mut best: isize = 0;
                    let mut lens: isize = 0;
                    for i in 0..overlap {
                        if new[(lastscan + lenf - overlap + i) as usize]
                            == old[(lastpos + lenf - overlap + i) as usize]
                        {
                            s += 1;
                        }
                        if new[(scan - lenb + i) as usize] == old[(pos - lenb + i) as usize] {
                            s -= 1;
                        }
                        if s > best {
                            best = s;
                            lens = i + 1;
                        }
                    }
                    lenf += lens - overlap;
                    lenb -= lens;
                }

                let extra = (scan - lenb) - (lastscan + lenf);
                let seek = (pos - lenb) - (lastpos + lenf);
                if lenf < 0 || extra < 0 {
                    return Err(Error::Algorithm("negative record length"));
                }
                let diff_len =
                    u32::try_from(lenf).map_err(|_| Error::Algorithm("record length overflow"))?;
                let extra_len =
                    u32::try_from(extra).map_err(|_| Error::Algorithm("record length overflow"))?;
                let seek_val =
                    i32::try_from(seek).map_err(|_| Error::Algorithm("seek overflow"))?;
                if seek_val == FLUSH {
                    return Err(Error::Algorithm("seek collides with the flush sentinel"));
                }

                patch
                    .write_all(
                        EntryHeader {
                            diff: U32::new(diff_len),
                            extra: U32::new(extra_len),
                            seek: U32::new(seek_to_wire(seek_val)),
                        }
                        .as_bytes(),
                    )
                    .map_err(Error::PatchIo)?;
                for i in 0..lenf {
                    patch
                        .write_u8(
                            new[(lastscan + i) as usize].wrapping_sub(old[(lastpos + i) as usize]),
                        )
                        .map_err(Error::PatchIo)?;
                }
                if extra != 0 {
                    patch
                        .write_all(&new[(lastscan + lenf) as usize..(scan - lenb) as usize])
                        .map_err(Error::PatchIo)?;
                }

                oldcrc.update(&old[lastpos as usize..(lastpos + lenf) as usize]);
                newcrc.update(&new[lastscan as usize..(scan - lenb) as usize]);

                lastscan = scan - lenb;
                lastpos = pos - lenb;
                lastoffset = pos - scan;
            }
        }

        let (block_oldcrc, block_newcrc) = (oldcrc.finalize(), newcrc.finalize());
        debug!(
            block_end = scan as i64,
            oldcrc = block_oldcrc,
            newcrc = block_newcrc,
            "block flushed"
        );
        patch
            .write_all(
                EntryHeader {
                    diff: U32::new(block_oldcrc),
                    extra: U32::new(block_newcrc),
                    seek: U32::new(seek_to_wire(FLUSH)),
                }
                .as_bytes(),
            )
            .map_err(Error::PatchIo)?;

        if scan < newsize {
            // Overlay the finished block of the target onto the reference at the same offset
            // and widen the sorted range to cover it; the applier mirrors this when it splices
            // a verified block back over its reference.
            old[(scansize - block) as usize..scansize as usize]
                .copy_from_slice(&new[(scansize - block) as usize..scansize as usize]);
            oldsize = oldsize.max(scansize);
            scansize = (scansize + block).min(newsize);
        } else {
            break;
        }
    }

    patch
        .write_all(
            EntryHeader {
                diff: Default::default(),
                extra: Default::default(),
                seek: Default::default(),
            }
            .as_bytes(),
        )
        .map_err(Error::PatchIo)?;
    patch.flush().map_err(Error::PatchIo)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn match_len_stops_at_first_difference() {
        assert_eq!(match_len(b"abcdef", b"abcfed"), 3);
        assert_eq!(match_len(b"abc", b"abcfed"), 3);
        assert_eq!(match_len(b"abcdef", b"abc"), 3);
        assert_eq!(match_len(b"dabcde", b"abcfed"), 0);
    }

    #[test]
    fn suffix_sort_orders_suffixes() {
        let sa = suffix_sort(b"banana");
        assert_eq!(&sa[..6], &[5, 3, 1, 0, 4, 2]);
        assert_eq!(sa.len(), 7);
    }

    #[test]
    fn search_finds_longest_prefix() {
        let old = b"abracadabra";
        let sa = suffix_sort(old);
        let mut pos = 0;
        let len = search(&sa, old, b"cadabra and more", 0, old.len() - 1, &mut pos);
        assert_eq!(pos, 4);
        assert_eq!(len, 7);
        let len = search(&sa, old, b"zzz", 0, old.len() - 1, &mut pos);
        assert_eq!(len, 0);
    }

    #[test]
    fn search_prefers_some_maximal_position() {
        // "ab" occurs at 0 and 3; either position is acceptable, the length is not negotiable
        let old = b"abcab";
        let sa = suffix_sort(old);
        let mut pos = 0;
        let len = search(&sa, old, b"abx", 0, old.len() - 1, &mut pos);
        assert_eq!(len, 2);
        assert!(pos == 0 || pos == 3);
    }
}
