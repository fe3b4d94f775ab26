//! Order-preserving encoders for the fixed-width numeric types.
//!
//! Every encoder here guarantees that unsigned lexicographic comparison of
//! the output equals the natural ordering of the input: signed integers get
//! their sign bit flipped, floats go through the total-order transform
//! (negative values have all bits inverted, non-negative values only the
//! sign bit). All output is big-endian.

const SIGN_BIT_16: u16 = 1 << 15;
const SIGN_BIT_32: u32 = 1 << 31;
const SIGN_BIT_64: u64 = 1 << 63;

/// Encodes a signed i16 with order preservation.
pub fn encode_i16(v: i16) -> [u8; 2] {
    ((v as u16) ^ SIGN_BIT_16).to_be_bytes()
}

/// Decodes a signed i16 with order preservation.
pub fn decode_i16(src: [u8; 2]) -> i16 {
    (u16::from_be_bytes(src) ^ SIGN_BIT_16) as i16
}

/// Encodes a signed i32 with order preservation.
pub fn encode_i32(v: i32) -> [u8; 4] {
    ((v as u32) ^ SIGN_BIT_32).to_be_bytes()
}

/// Decodes a signed i32 with order preservation.
pub fn decode_i32(src: [u8; 4]) -> i32 {
    (u32::from_be_bytes(src) ^ SIGN_BIT_32) as i32
}

/// Encodes a signed i64 with order preservation (flip sign bit for sorting).
pub fn encode_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ SIGN_BIT_64).to_be_bytes()
}

/// Decodes a signed i64 with order preservation.
pub fn decode_i64(src: [u8; 8]) -> i64 {
    (u64::from_be_bytes(src) ^ SIGN_BIT_64) as i64
}

/// Encodes an f32 under the total order (NaN sorts above all numbers).
pub fn encode_f32(v: f32) -> [u8; 4] {
    let bits = v.to_bits();
    let mapped = if bits & SIGN_BIT_32 != 0 {
        !bits
    } else {
        bits ^ SIGN_BIT_32
    };
    mapped.to_be_bytes()
}

/// Decodes an f32 encoded by [`encode_f32`].
pub fn decode_f32(src: [u8; 4]) -> f32 {
    let mapped = u32::from_be_bytes(src);
    let bits = if mapped & SIGN_BIT_32 != 0 {
        mapped ^ SIGN_BIT_32
    } else {
        !mapped
    };
    f32::from_bits(bits)
}

/// Encodes an f64 under the total order (NaN sorts above all numbers).
pub fn encode_f64(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let mapped = if bits & SIGN_BIT_64 != 0 {
        !bits
    } else {
        bits ^ SIGN_BIT_64
    };
    mapped.to_be_bytes()
}

/// Decodes an f64 encoded by [`encode_f64`].
pub fn decode_f64(src: [u8; 8]) -> f64 {
    let mapped = u64::from_be_bytes(src);
    let bits = if mapped & SIGN_BIT_64 != 0 {
        mapped ^ SIGN_BIT_64
    } else {
        !mapped
    };
    f64::from_bits(bits)
}
