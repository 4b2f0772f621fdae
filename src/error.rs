use std::io;

use thiserror::Error;

/// Failure modes surfaced by patch generation and application.
///
/// Errors propagate straight to the caller; nothing is retried. A reference-checksum mismatch at
/// a block boundary in [`apply_cached`](crate::apply_cached) is *not* an error — the applier falls
/// back to a previously verified block, and only a failed verification of that fallback ends up
/// here.
#[derive(Debug, Error)]
pub enum Error {
    /// Reading, seeking or rewriting the reference failed, or it exceeds 2³¹ − 1 bytes.
    #[error("reference file: {0}")]
    OldIo(#[source] io::Error),
    /// Reading the target or writing reconstructed output failed.
    #[error("output file: {0}")]
    NewIo(#[source] io::Error),
    /// Reading or writing the patch stream failed, including a stream that ends mid-record.
    #[error("patch stream: {0}")]
    PatchIo(#[source] io::Error),
    /// The stream terminated after fewer bytes than its header declared.
    #[error("patch ended after {written} of {expected} bytes")]
    PatchShort { written: u64, expected: u64 },
    /// The file header magic did not match.
    #[error("not a bdelta patch (bad magic)")]
    BadMagic,
    /// A generator invariant was violated; the inputs cannot be encoded in this format.
    #[error("delta algorithm failure: {0}")]
    Algorithm(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
