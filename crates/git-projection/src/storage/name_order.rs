//! Case-insensitive ordering for projected names.
//!
//! Names are compared byte-wise after ASCII case folding. Two siblings never
//! fold to the same bytes, so within a folder this is a total order. Non-ASCII
//! bytes compare by value.

use std::cmp::Ordering;

/// Compares two names case-insensitively.
#[inline]
pub fn compare_names(a: &[u8], b: &[u8]) -> Ordering {
    let len = a.len().min(b.len());
    for i in 0..len {
        let (x, y) = (a[i].to_ascii_lowercase(), b[i].to_ascii_lowercase());
        if x != y {
            return x.cmp(&y);
        }
    }
    a.len().cmp(&b.len())
}

/// Returns true if the names are equal ignoring ASCII case.
#[inline]
pub fn names_equal(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Appends the case-folded form of `path` to `out`.
pub fn fold_path_into(path: &[u8], out: &mut Vec<u8>) {
    out.extend(path.iter().map(u8::to_ascii_lowercase));
}
