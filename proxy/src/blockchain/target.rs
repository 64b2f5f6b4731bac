/// Difficulty/target conversions for ethash work.
///
/// Share difficulty is carried as an integer number of hashes. EthereumStratum
/// expresses it as a float where 1.0 == 2^32 hashes.

/// Hashes represented by float difficulty 1.0
pub const DIFF1: f64 = 4_294_967_296.0;

pub fn to_float(difficulty: i64) -> f64 {
    difficulty as f64 / DIFF1
}

pub fn from_float(value: f64) -> i64 {
    let d = (value * DIFF1).round();
    if !d.is_finite() || d < 1.0 {
        return 1;
    }
    // `as` saturates at i64::MAX
    d as i64
}

pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.as_bytes().iter().all(|b| b.is_ascii_hexdigit())
}

/// `0x`-prefixed hex string with exactly `len` hex digits after the prefix.
pub fn is_prefixed_hex(s: &str, len: usize) -> bool {
    match s.strip_prefix("0x") {
        Some(h) => h.len() == len && is_hex(h),
        None => false,
    }
}

/// floor((2^256 - 1) / difficulty) as a 0x-prefixed 32-byte hex string.
pub fn target_from_difficulty(difficulty: i64) -> String {
    let mut out = [0xffu8; 32];
    let diff = difficulty.max(1) as u128;
    if diff > 1 {
        let mut rem: u128 = 0;
        for b in out.iter_mut() {
            let acc = (rem << 8) | (*b as u128);
            *b = (acc / diff) as u8;
            rem = acc % diff;
        }
    }
    format!("0x{}", hex::encode(out))
}

/// Network difficulty for a boundary (2^256 / target). `None` for a zero or
/// unparsable target.
pub fn difficulty_from_target(target: &str) -> Option<i64> {
    let t = strip_0x(target.trim());
    if !is_hex(t) || t.len() > 64 {
        return None;
    }
    let mut value = 0f64;
    for c in t.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
    }
    if value == 0.0 {
        return None;
    }
    let diff = 2f64.powi(256) / value;
    Some(diff.round().min(i64::MAX as f64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_difficulty_round_trips_through_hashes() {
        assert_eq!(from_float(1.0), 4_294_967_296);
        assert_eq!(to_float(2_147_483_648), 0.5);
        assert_eq!(from_float(0.0), 1);
        assert_eq!(from_float(f64::NAN), 1);
    }

    #[test]
    fn target_for_difficulty_one_is_all_ones() {
        assert_eq!(target_from_difficulty(1), format!("0x{}", "f".repeat(64)));
    }

    #[test]
    fn target_for_2_pow_32() {
        // (2^256 - 1) / 2^32 == 2^224 - 1
        let t = target_from_difficulty(4_294_967_296);
        assert_eq!(t, format!("0x00000000{}", "f".repeat(56)));
        assert_eq!(difficulty_from_target(&t), Some(4_294_967_296));
    }

    #[test]
    fn zero_target_has_no_difficulty() {
        assert_eq!(difficulty_from_target("0x00"), None);
        assert_eq!(difficulty_from_target("0xzz"), None);
    }

    #[test]
    fn prefixed_hex_checks_length() {
        assert!(is_prefixed_hex("0x00ff00ff00ff00ff", 16));
        assert!(!is_prefixed_hex("00ff00ff00ff00ff", 16));
        assert!(!is_prefixed_hex("0x00ff", 16));
        assert!(!is_prefixed_hex("0x00ff00ff00ff00fg", 16));
    }
}
