//! Identifier token validation and the guid <-> mid codec
//!
//! Three interchangeable encodings exist for a graph node:
//! - guid: `#` followed by 32 lowercase hex digits (internal form),
//! - id: human-readable namespaced path (`/type/object/...`),
//! - mid: compact machine id, `/m/0` followed by a base-32 rendering of the
//!   low 32 bits of the guid.
//!
//! The mid alphabet deliberately omits vowels and easily-confused letters so
//! a mid never spells a word and survives transcription.

/// Base-32 alphabet for mids. Index is the digit value.
const MID_ALPHABET: &[u8; 32] = b"0123456789bcdfghjklmnpqrstvwxyz_";

/// Number of hex digits in a guid (after the `#`).
pub const GUID_HEX_LEN: usize = 32;

/// Number of trailing guid hex digits encoded into a mid.
const MID_SUFFIX_HEX: usize = 8;

/// True if the token is a well-formed guid: `#` + 32 lowercase hex digits.
pub fn is_guid(token: &str) -> bool {
    let Some(hex) = token.strip_prefix('#') else {
        return false;
    };
    hex.len() == GUID_HEX_LEN
        && hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// True if the token is a well-formed mid: `/m/0` + at least one mid digit.
pub fn is_mid(token: &str) -> bool {
    let Some(digits) = token.strip_prefix("/m/0") else {
        return false;
    };
    !digits.is_empty() && digits.bytes().all(|b| MID_ALPHABET.contains(&b))
}

/// True if the token looks like a graphd timestamp:
/// `YYYY-MM-DDTHH:MM:SS[.frac]Z`.
///
/// This is a shape check, not a calendar check; the server is the authority
/// on whether the instant is addressable.
pub fn is_timestamp(token: &str) -> bool {
    let bytes = token.as_bytes();
    if bytes.len() < 20 || *bytes.last().unwrap() != b'Z' {
        return false;
    }
    let body = &token[..token.len() - 1];
    let (date_time, frac) = match body.split_once('.') {
        Some((dt, frac)) => (dt, Some(frac)),
        None => (body, None),
    };
    if let Some(frac) = frac {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    let Some((date, time)) = date_time.split_once('T') else {
        return false;
    };
    let date_ok = date.len() == 10
        && date
            .bytes()
            .enumerate()
            .all(|(i, b)| if i == 4 || i == 7 { b == b'-' } else { b.is_ascii_digit() });
    let time_ok = time.len() == 8
        && time
            .bytes()
            .enumerate()
            .all(|(i, b)| if i == 2 || i == 5 { b == b':' } else { b.is_ascii_digit() });
    date_ok && time_ok
}

/// Encode the low 32 bits of a guid as a mid.
///
/// Returns None if the token is not a well-formed guid.
pub fn mid_from_guid(guid: &str) -> Option<String> {
    if !is_guid(guid) {
        return None;
    }
    let hex = &guid[1 + GUID_HEX_LEN - MID_SUFFIX_HEX..];
    let mut value = u32::from_str_radix(hex, 16).ok()?;
    let mut digits = Vec::new();
    loop {
        digits.push(MID_ALPHABET[(value % 32) as usize]);
        value /= 32;
        if value == 0 {
            break;
        }
    }
    digits.reverse();
    let mut mid = String::from("/m/0");
    mid.push_str(std::str::from_utf8(&digits).expect("alphabet is ascii"));
    Some(mid)
}

/// Reconstruct a guid from a mid given the 24-hex-digit namespace prefix the
/// deployment uses for ordinary nodes.
///
/// A mid only carries the low 32 bits, which is why the server stays
/// authoritative for mid resolution (merged or replaced nodes move
/// namespaces). This codec is used for validation and for rendering batch
/// lookup requests.
pub fn guid_from_mid(mid: &str, namespace: &str) -> Option<String> {
    if !is_mid(mid) || namespace.len() != GUID_HEX_LEN - MID_SUFFIX_HEX {
        return None;
    }
    let digits = &mid[4..];
    let mut value: u64 = 0;
    for b in digits.bytes() {
        let digit = MID_ALPHABET.iter().position(|&a| a == b)? as u64;
        value = value.checked_mul(32)?.checked_add(digit)?;
        if value > u32::MAX as u64 {
            return None;
        }
    }
    Some(format!("#{}{:08x}", namespace, value as u32))
}
