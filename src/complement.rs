//! Bytewise one's complement, applied to whole request frames in the
//! ABNT dialect. The transformation is its own inverse.

/// Complement every byte of `data`.
#[must_use]
pub fn complement(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| !b).collect()
}

/// Complement a buffer in place.
pub fn complement_in_place(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b = !*b;
    }
}
