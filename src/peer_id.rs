//! Peer id validation and generation.
//!
//! A peer id is exactly 40 lowercase hex characters. Hub-mode servers
//! generate their own mesh identity with the same shape.

/// Returns true when `id` is a well-formed peer id.
pub fn is_valid_peer_id(id: &str) -> bool {
    id.len() == 40
        && id
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Generate a fresh random peer id (20 random bytes, hex-encoded).
pub fn generate_peer_id() -> String {
    let mut bytes = [0u8; 20];
    getrandom::getrandom(&mut bytes).expect("system RNG unavailable");
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_id() {
        assert!(is_valid_peer_id(&"a".repeat(40)));
        assert!(is_valid_peer_id(&"0123456789abcdef0123456789abcdef01234567"));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(!is_valid_peer_id(&"a".repeat(39)));
        assert!(!is_valid_peer_id(&"a".repeat(41)));
        assert!(!is_valid_peer_id(""));
    }

    #[test]
    fn test_wrong_alphabet_rejected() {
        assert!(!is_valid_peer_id(&"A".repeat(40)));
        assert!(!is_valid_peer_id(&"g".repeat(40)));
        assert!(!is_valid_peer_id(&format!("{}!", "a".repeat(39))));
    }

    #[test]
    fn test_generated_ids_are_valid_and_distinct() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert!(is_valid_peer_id(&a));
        assert!(is_valid_peer_id(&b));
        assert_ne!(a, b);
    }
}
