//! Stable 32-bit hashing for ring tokens
//!
//! All tokens, partition identifiers and tag-compound keys derive from
//! FNV-1a over UTF-8 bytes, which is identical on every platform.

use crate::Token;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// FNV-1a hash of a string
pub fn hash_str(s: &str) -> Token {
    hash_bytes(s.as_bytes())
}

/// FNV-1a hash of raw bytes
pub fn hash_bytes(bytes: &[u8]) -> Token {
    let mut hash = FNV_OFFSET_BASIS;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Integers hash by their canonical decimal string
pub fn hash_i64(v: i64) -> Token {
    hash_str(&v.to_string())
}

/// Floats hash by their decimal string with 10 fractional digits
pub fn hash_f64(v: f64) -> Token {
    hash_str(&format!("{:.10}", v))
}

/// Token used for points of a database without a partition key
pub fn database_token(database: &str) -> Token {
    hash_str(&format!("{}.", database))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(hash_str(""), 2_166_136_261);
        assert_eq!(hash_str("a"), 3_826_002_220);
        assert_eq!(hash_str("foobar"), 3_214_735_720);
        assert_eq!(hash_str("gold"), 3_966_162_835);
    }

    #[test]
    fn test_numeric_canonical_forms() {
        assert_eq!(hash_i64(42), hash_str("42"));
        assert_eq!(hash_f64(1.5), hash_str("1.5000000000"));
    }

    #[test]
    fn test_database_token() {
        assert_eq!(database_token("sharded"), 3_304_990_508);
        assert_eq!(database_token("db"), hash_str("db."));
    }
}
