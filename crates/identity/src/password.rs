use sha2::{Digest, Sha256};

const SALT_BYTES: usize = 16;

pub(crate) fn generate_salt() -> String {
    let salt: [u8; SALT_BYTES] = rand::random();
    hex::encode(salt)
}

pub(crate) fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn verify_password(password: &str, salt: &str, expected_hash: &str) -> bool {
    let actual = hash_password(password, salt);
    if actual.len() != expected_hash.len() {
        return false;
    }

    // Constant time over the full digest.
    actual
        .bytes()
        .zip(expected_hash.bytes())
        .fold(0_u8, |diff, (left, right)| diff | (left ^ right))
        == 0
}

/// Trims and lower-cases an email, returning `None` when it is not shaped like `local@domain`.
pub(crate) fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || email.chars().any(char::is_whitespace)
    {
        return None;
    }

    Some(email)
}
