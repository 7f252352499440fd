//! Package Verification
//!
//! End-to-end integrity check of a downloaded package against the digest the
//! endpoint advertised.

use super::AgentError;
use crate::engine::hasher;

/// Compare a computed digest against the advertised one
pub fn verify_digest(expected: &str, actual: &str) -> Result<(), AgentError> {
    if hasher::digests_match(expected, actual) {
        Ok(())
    } else {
        Err(AgentError::VerificationFailed {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_checksum_verification_success() {
        let actual = hasher::hash_bytes(b"hello world");
        assert!(verify_digest(HELLO_WORLD, &actual).is_ok());
        assert!(verify_digest(&HELLO_WORLD.to_uppercase(), &actual).is_ok());
    }

    #[test]
    fn test_checksum_verification_failure() {
        let actual = hasher::hash_bytes(b"hello world");
        let result = verify_digest("wrongchecksum", &actual);
        assert!(matches!(
            result,
            Err(AgentError::VerificationFailed { ref actual, .. }) if actual == HELLO_WORLD
        ));
    }
}
