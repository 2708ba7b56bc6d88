//! 16-bit one's-complement checksum arithmetic
//!
//! The sender never recomputes a checksum from scratch on the hot path.
//! Templates carry an uncomplemented partial sum; per-frame the varying
//! fields are added to it and the result is folded and complemented.

/// Sums `data` as big-endian 16-bit words. An odd trailing byte is taken
/// as the high byte of a final word.
#[inline]
pub fn raw_sum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Folds the carry bits back into the low 16 bits. Two rounds are enough
/// for any sum of 16-bit words.
#[inline]
pub fn fold(mut sum: u32) -> u16 {
    sum = (sum >> 16) + (sum & 0xffff);
    sum = (sum >> 16) + (sum & 0xffff);
    sum as u16
}

/// Folded, uncomplemented sum of `data`; the form stored in CE records.
#[inline]
pub fn folded_sum(data: &[u8]) -> u16 {
    fold(raw_sum(data))
}

/// Folds and complements an accumulated sum.
#[inline]
pub fn finalize(sum: u32) -> u16 {
    !fold(sum)
}

/// Like [`finalize`], but substitutes 0xFFFF for 0. UDP over IPv4 and the
/// IPv4 header checksum use 0 to mean "no checksum".
#[inline]
pub fn finalize_nonzero(sum: u32) -> u16 {
    match finalize(sum) {
        0 => 0xffff,
        c => c,
    }
}
