//! Serial number arithmetic (RFC 1982) for 32-bit TSNs and 16-bit stream
//! sequence numbers.

pub fn tsn_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn tsn_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

pub fn tsn_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

pub fn tsn_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

pub fn tsn_max(a: u32, b: u32) -> u32 {
    if tsn_gt(a, b) { a } else { b }
}

pub fn ssn_gt(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}
