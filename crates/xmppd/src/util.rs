//! Small shared helpers: random identifiers and username validation.

use rand::Rng;

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz\
                            ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                            0123456789";

/// Generate a random printable identifier of the given length.
///
/// Used for stanza ids, roster-push ids, and server-assigned resources.
pub fn generate_id(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ID_CHARSET[rng.random_range(0..ID_CHARSET.len())] as char)
        .collect()
}

/// Validate a local username: `[A-Za-z0-9._-]+`.
pub fn valid_username(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_printable_and_sized() {
        let id = generate_id(16);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(generate_id(12), generate_id(12));
    }

    #[test]
    fn username_validation() {
        assert!(valid_username("alice"));
        assert!(valid_username("alice.b-c_d42"));
        assert!(!valid_username(""));
        assert!(!valid_username("alice bob"));
        assert!(!valid_username("alice@host"));
        assert!(!valid_username("../etc/passwd"));
    }
}
