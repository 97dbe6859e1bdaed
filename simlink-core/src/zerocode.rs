//! Zero-coding: each run of zero bytes becomes `0x00, run_len` (runs over 255 are split).

use crate::wire::WireError;

/// Compress runs of zero bytes.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut run: u8 = 0;
    for &b in input {
        if b == 0 {
            if run == u8::MAX {
                out.extend_from_slice(&[0, run]);
                run = 0;
            }
            run += 1;
        } else {
            if run > 0 {
                out.extend_from_slice(&[0, run]);
                run = 0;
            }
            out.push(b);
        }
    }
    if run > 0 {
        out.extend_from_slice(&[0, run]);
    }
    out
}

/// Expand a zero-coded buffer. A zero marker with count 0 or without a count is malformed.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != 0 {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(&0) | None => return Err(WireError::BadZeroCode),
            Some(&n) => out.resize(out.len() + n as usize, 0),
        }
    }
    Ok(out)
}
