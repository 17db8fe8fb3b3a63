//! Filter mask: a bitset over device ids selecting the archived subset.
//!
//! `N` (the device count) is chosen once, when the archive is created, and
//! may only change across a full archive recreation, so `FilterMask` owns a
//! `Vec<u8>` sized to `N` rather than a fixed-size array.

use std::fmt;

/// `R` followed by `N/4` uppercase hex nibbles, or a comma-separated list of
/// `id` / `id1-id2` items.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FilterMask {
    bits: Vec<u8>,
    n: u32,
}

#[derive(Debug, Fail, Eq, PartialEq)]
pub enum MaskError {
    #[fail(display = "id {} out of range (N = {})", id, n)]
    IdOutOfRange { id: u32, n: u32 },

    #[fail(display = "range {}-{} is empty", start, end)]
    EmptyRange { start: u32, end: u32 },

    #[fail(display = "unexpected character {:?} in mask text", ch)]
    BadChar { ch: char },

    #[fail(display = "buffer too small to hold formatted mask")]
    BufferTooSmall,
}

impl FilterMask {
    /// A mask of `n` bits, all clear.
    pub fn new(n: u32) -> Self {
        FilterMask {
            bits: vec![0u8; Self::byte_len(n)],
            n,
        }
    }

    fn byte_len(n: u32) -> usize {
        ((n + 7) / 8) as usize
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn test(&self, id: u32) -> bool {
        assert!(id < self.n, "id {} out of range (N = {})", id, self.n);
        (self.bits[(id / 8) as usize] >> (id % 8)) & 1 != 0
    }

    pub fn set(&mut self, id: u32) {
        assert!(id < self.n, "id {} out of range (N = {})", id, self.n);
        self.bits[(id / 8) as usize] |= 1 << (id % 8);
    }

    pub fn popcount(&self) -> u32 {
        (0..self.n).filter(|&id| self.test(id)).count() as u32
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.n).filter(move |&id| self.test(id))
    }

    /// The underlying byte-packed bitset, little-endian byte order, for
    /// on-disk storage.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Rebuilds a mask from its packed byte representation.
    pub fn from_raw_bytes(n: u32, bytes: &[u8]) -> Self {
        let mut bits = vec![0u8; Self::byte_len(n)];
        let len = bits.len().min(bytes.len());
        bits[..len].copy_from_slice(&bytes[..len]);
        FilterMask { bits, n }
    }

    /// Parses either the raw `R...` form or the readable comma/range form.
    pub fn parse(text: &str, n: u32) -> ::std::result::Result<Self, MaskError> {
        let mut mask = FilterMask::new(n);
        let mut chars = text.chars().peekable();

        if chars.peek() == Some(&'R') {
            chars.next();
            parse_raw(&mut chars, n, &mut mask)?;
        } else {
            parse_readable(&mut chars, n, &mut mask)?;
        }

        Ok(mask)
    }

    /// Formats the mask, preferring the readable form (maximal ranges) and
    /// falling back to the raw `R` form when the readable rendering would
    /// not fit in a buffer of `buffer_len` bytes (including one byte for a
    /// terminator).
    pub fn format(&self, buffer_len: usize) -> ::std::result::Result<String, MaskError> {
        let readable = self.format_readable();
        if readable.len() + 1 <= buffer_len {
            return Ok(readable);
        }
        let raw = self.format_raw();
        if raw.len() + 1 <= buffer_len {
            Ok(raw)
        } else {
            Err(MaskError::BufferTooSmall)
        }
    }

    fn format_readable(&self) -> String {
        let mut out = String::new();
        let mut in_range = false;
        let mut range_start = 0u32;
        let mut first = true;

        let mut push_range = |out: &mut String, start: u32, end: u32, first: bool| {
            if !first {
                out.push(',');
            }
            out.push_str(&start.to_string());
            if end > start {
                out.push('-');
                out.push_str(&end.to_string());
            }
        };

        for id in 0..self.n {
            let set = self.test(id);
            if set && !in_range {
                in_range = true;
                range_start = id;
            } else if !set && in_range {
                push_range(&mut out, range_start, id - 1, first);
                in_range = false;
                first = false;
            }
        }
        if in_range {
            push_range(&mut out, range_start, self.n - 1, first);
        }
        out
    }

    fn format_raw(&self) -> String {
        let mut out = String::with_capacity(1 + self.bits.len() * 2);
        out.push('R');
        for byte in self.bits.iter().rev() {
            out.push_str(&format!("{:02X}", byte));
        }
        out
    }
}

impl fmt::Display for FilterMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.format(usize::max_value()) {
            Ok(s) => f.write_str(&s),
            Err(_) => Ok(()),
        }
    }
}

fn parse_raw(
    chars: &mut ::std::iter::Peekable<::std::str::Chars>,
    n: u32,
    mask: &mut FilterMask,
) -> ::std::result::Result<(), MaskError> {
    let nibble_count = n / 4;
    let mut nibbles = vec![0u8; nibble_count as usize];

    // The string holds nibbles high-index-first; walk it in that order.
    for i in (0..nibble_count).rev() {
        let ch = chars
            .next()
            .ok_or(MaskError::BadChar { ch: '\0' })?;
        let nibble = match ch {
            '0'..='9' => ch as u8 - b'0',
            'A'..='F' => ch as u8 - b'A' + 10,
            _ => return Err(MaskError::BadChar { ch }),
        };
        nibbles[i as usize] = nibble;
    }

    for (i, nibble) in nibbles.into_iter().enumerate() {
        let byte_idx = i / 2;
        let shift = 4 * (i % 2);
        mask.bits[byte_idx] |= nibble << shift;
    }

    Ok(())
}

fn parse_readable(
    chars: &mut ::std::iter::Peekable<::std::str::Chars>,
    n: u32,
    mask: &mut FilterMask,
) -> ::std::result::Result<(), MaskError> {
    loop {
        let id = parse_id(chars, n)?;
        let mut end_id = id;

        if chars.peek() == Some(&'-') {
            chars.next();
            end_id = parse_id(chars, n)?;
            if id > end_id {
                return Err(MaskError::EmptyRange {
                    start: id,
                    end: end_id,
                });
            }
        }

        for i in id..=end_id {
            mask.set(i);
        }

        match chars.peek() {
            Some(&',') => {
                chars.next();
            }
            _ => break,
        }
    }
    Ok(())
}

fn parse_id(
    chars: &mut ::std::iter::Peekable<::std::str::Chars>,
    n: u32,
) -> ::std::result::Result<u32, MaskError> {
    let mut digits = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    if digits.is_empty() {
        return Err(MaskError::BadChar {
            ch: chars.peek().copied().unwrap_or('\0'),
        });
    }
    let id: u32 = digits.parse().map_err(|_| MaskError::BadChar { ch: '0' })?;
    if id >= n {
        return Err(MaskError::IdOutOfRange { id, n });
    }
    Ok(id)
}
