use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Canonical content digest: SHA-256 over the concatenated inputs, base64
/// encoded. Input order is significant and fixed at each call site (a story
/// hashes `(content, summary, title)`; a feed hashes the raw response body).
pub fn compute_hash_base64<T: AsRef<[u8]>>(parts: &[T]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let a = compute_hash_base64(&["content", "summary", "title"]);
        let b = compute_hash_base64(&["content", "summary", "title"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_input_order_matters() {
        let a = compute_hash_base64(&["content", "summary"]);
        let b = compute_hash_base64(&["summary", "content"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_differs_on_change() {
        let a = compute_hash_base64(&["one"]);
        let b = compute_hash_base64(&["two"]);
        assert_ne!(a, b);
    }
}
