use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 6;

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

pub fn verify_password(salt: &str, password: &str, expected_hash: &str) -> bool {
    let actual = hash_password(salt, password);
    // Constant-time compare.
    actual.len() == expected_hash.len()
        && actual
            .bytes()
            .zip(expected_hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
fn sha256_hex(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_salted_and_verifiable() {
        let a = hash_password("salt-a", "secret1");
        let b = hash_password("salt-b", "secret1");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(verify_password("salt-a", "secret1", &a));
        assert!(!verify_password("salt-a", "secret2", &a));
        assert!(!verify_password("salt-b", "secret1", &a));
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
