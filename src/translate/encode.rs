// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Binary-format encoding helpers.
//!
//! The ingest path never hand-parses sections (`wasmparser` owns that); these
//! encoders exist for the parts of the runtime that *produce* binary-format
//! framing: the serialized artifact blob, and synthetic sections in tests.
//! Encodings round-trip byte-for-byte with the standard format.

/// Section id of the function section.
pub const SECTION_ID_FUNCTION: u8 = 0x03;
/// Section id of the start section.
pub const SECTION_ID_START: u8 = 0x08;

/// Appends a LEB128-encoded `u32`.
pub fn write_u32(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Appends a LEB128-encoded `u64`.
pub fn write_u64(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Appends a length-prefixed byte blob.
pub fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(out, u32::try_from(bytes.len()).unwrap());
    out.extend_from_slice(bytes);
}

/// Reads a LEB128-encoded `u32`, advancing `pos`.
pub fn read_u32(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    let mut result: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        if shift == 28 && byte & 0xf0 != 0 {
            return None;
        }
        result |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
}

/// Reads a LEB128-encoded `u64`, advancing `pos`.
pub fn read_u64(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        if shift == 63 && byte & 0xfe != 0 {
            return None;
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
}

/// Reads a length-prefixed byte blob, advancing `pos`.
pub fn read_bytes<'a>(bytes: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len = read_u32(bytes, pos)? as usize;
    let out = bytes.get(*pos..*pos + len)?;
    *pos += len;
    Some(out)
}

/// Encodes a section: id byte, LEB128 payload size, payload.
fn encode_section(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![id];
    write_bytes(&mut out, payload);
    out
}

/// Encodes a function section over the given type indices.
pub fn encode_function_section(indices: &[u32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(indices.len() + 1);
    write_u32(&mut payload, u32::try_from(indices.len()).unwrap());
    for index in indices {
        write_u32(&mut payload, *index);
    }
    encode_section(SECTION_ID_FUNCTION, &payload)
}

/// Encodes a start section over the given function index.
pub fn encode_start_section(func_index: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    write_u32(&mut payload, func_index);
    encode_section(SECTION_ID_START, &payload)
}

/// Decodes a section produced by [`encode_function_section`].
pub fn decode_function_section(bytes: &[u8]) -> Option<Vec<u32>> {
    let mut pos = 0;
    if *bytes.first()? != SECTION_ID_FUNCTION {
        return None;
    }
    pos += 1;
    let payload = read_bytes(bytes, &mut pos)?;
    let mut pos = 0;
    let count = read_u32(payload, &mut pos)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_u32(payload, &mut pos)?);
    }
    (pos == payload.len()).then_some(out)
}

/// Decodes a section produced by [`encode_start_section`].
pub fn decode_start_section(bytes: &[u8]) -> Option<u32> {
    let mut pos = 0;
    if *bytes.first()? != SECTION_ID_START {
        return None;
    }
    pos += 1;
    let payload = read_bytes(bytes, &mut pos)?;
    let mut pos = 0;
    let index = read_u32(payload, &mut pos)?;
    (pos == payload.len()).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_section_golden() {
        assert_eq!(
            encode_function_section(&[5]),
            vec![SECTION_ID_FUNCTION, 0x02, 0x01, 0x05]
        );
    }

    // Uses the same index as `function_section_golden` to highlight that the
    // encoding is different.
    #[test]
    fn start_section_golden() {
        assert_eq!(encode_start_section(5), vec![SECTION_ID_START, 0x01, 0x05]);
    }

    #[test]
    fn section_round_trip() {
        for indices in [&[][..], &[5][..], &[0, 1, 127, 128, 16384, u32::MAX][..]] {
            let encoded = encode_function_section(indices);
            assert_eq!(decode_function_section(&encoded).as_deref(), Some(indices));
        }
        for index in [0, 5, 127, 128, u32::MAX] {
            let encoded = encode_start_section(index);
            assert_eq!(decode_start_section(&encoded), Some(index));
        }
    }

    #[test]
    fn leb_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 1 << 20, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            write_u64(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_u64(&buf, &mut pos), Some(value));
            assert_eq!(pos, buf.len());
        }
    }
}
