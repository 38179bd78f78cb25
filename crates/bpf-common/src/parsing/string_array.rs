//! StringArray is a fixed size, NUL padded text field written by the probe,
//! like the task `comm` or the UTS nodename.
//!
//! Converting it to text:
//! - trims NUL bytes at both ends
//! - replaces NUL bytes left inside the value with spaces
//! - decodes the rest with String::from_utf8_lossy
use core::fmt;

use bytes::Buf;

#[derive(Clone, PartialEq, Eq)]
pub struct StringArray<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> StringArray<N> {
    /// Copy the next `N` bytes out of `buf`. The caller must make sure
    /// at least `N` bytes are remaining.
    pub fn read_from(buf: &mut impl Buf) -> Self {
        let mut data = [0; N];
        buf.copy_to_slice(&mut data);
        Self { data }
    }
}

impl<const N: usize> From<&str> for StringArray<N> {
    fn from(slice: &str) -> Self {
        let mut data = [0; N];
        let len = slice.len().min(N);
        data[..len].copy_from_slice(&slice.as_bytes()[..len]);
        Self { data }
    }
}

impl<const N: usize> fmt::Display for StringArray<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_nul_padded(&self.data))
    }
}

impl<const N: usize> fmt::Debug for StringArray<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringArray")
            .field("data", &self.to_string())
            .finish()
    }
}

/// Convert a NUL padded byte field to text.
pub fn format_nul_padded(data: &[u8]) -> String {
    let start = data.iter().position(|c| *c != 0).unwrap_or(data.len());
    let end = data.iter().rposition(|c| *c != 0).map_or(start, |pos| pos + 1);
    let trimmed: Vec<u8> = data[start..end]
        .iter()
        .map(|c| if *c == 0 { b' ' } else { *c })
        .collect();
    String::from_utf8_lossy(&trimmed).into_owned()
}
