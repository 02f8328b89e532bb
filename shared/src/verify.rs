//! Name verification against a heartbeat salt, and player name rules.

use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::Rng;

pub const SALT_LEN: usize = 16;
pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 16;

/// Random alphanumeric salt shared with the heartbeat service.
pub fn generate_salt() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LEN)
        .map(char::from)
        .collect()
}

/// The token a legitimate client presents: lowercase hex MD5 of salt + name.
pub fn name_token(salt: &str, name: &str) -> String {
    format!("{:x}", Md5::digest(format!("{}{}", salt, name).as_bytes()))
}

/// Checks a client-supplied key. Some clients drop leading zeros or send
/// uppercase hex, so the key is normalized before comparing.
pub fn verify_name(key: &str, salt: &str, name: &str) -> bool {
    let key = key.trim().to_ascii_lowercase();
    if key.len() > 32 {
        return false;
    }
    format!("{:0>32}", key) == name_token(salt, name)
}

pub fn is_valid_name(name: &str) -> bool {
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.len())
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
