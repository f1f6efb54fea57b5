use std::collections::HashMap;

use sha1::{Digest, Sha1};

/// How a startup authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Trust,
    CleartextPassword,
}

/// Pluggable authentication for both wire protocols. The front-end does not
/// implement mechanisms beyond password comparison; anything stronger plugs
/// in here.
pub trait Authenticator: Send + Sync {
    fn decision(&self, user: &str) -> AuthDecision;

    fn verify(&self, user: &str, password: &str) -> bool;

    /// Cleartext password for scramble-based flows (MySQL native auth).
    fn password_of(&self, user: &str) -> Option<String>;
}

/// Accept anyone, the default for embedded deployments.
#[derive(Debug, Default)]
pub struct TrustAuthenticator;

impl Authenticator for TrustAuthenticator {
    fn decision(&self, _user: &str) -> AuthDecision {
        AuthDecision::Trust
    }

    fn verify(&self, _user: &str, _password: &str) -> bool {
        true
    }

    fn password_of(&self, _user: &str) -> Option<String> {
        None
    }
}

/// Fixed user/password table.
#[derive(Debug, Default)]
pub struct PasswordAuthenticator {
    users: HashMap<String, String>,
}

impl PasswordAuthenticator {
    pub fn new() -> Self {
        PasswordAuthenticator {
            users: HashMap::new(),
        }
    }

    pub fn add_user(&mut self, user: &str, password: &str) {
        self.users.insert(user.to_string(), password.to_string());
    }
}

impl Authenticator for PasswordAuthenticator {
    fn decision(&self, _user: &str) -> AuthDecision {
        // unknown users are still challenged, so name probing stays blind
        AuthDecision::CleartextPassword
    }

    fn verify(&self, user: &str, password: &str) -> bool {
        self.users.get(user).map(String::as_str) == Some(password)
    }

    fn password_of(&self, user: &str) -> Option<String> {
        self.users.get(user).cloned()
    }
}

pub fn sha1_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

pub fn xor(slice1: &[u8], slice2: &[u8]) -> Vec<u8> {
    let mut result = vec![0u8; slice1.len()];
    for i in 0..result.len() {
        result[i] = slice1[i] ^ slice2[i % slice2.len()];
    }
    result
}

/// Expected `mysql_native_password` token for a scramble:
/// `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`.
pub fn mysql_native_token(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let password_hash = sha1_digest(password.as_bytes());
    let concat_hash = [scramble.to_vec(), sha1_digest(&password_hash)].concat();
    xor(&password_hash, &sha1_digest(&concat_hash))
}

#[cfg(test)]
mod test {
    use super::{
        mysql_native_token, xor, AuthDecision, Authenticator, PasswordAuthenticator,
        TrustAuthenticator,
    };

    #[test]
    fn test_trust() {
        let auth = TrustAuthenticator;
        assert_eq!(auth.decision("anyone"), AuthDecision::Trust);
        assert!(auth.verify("anyone", ""));
    }

    #[test]
    fn test_password() {
        let mut auth = PasswordAuthenticator::new();
        auth.add_user("alice", "secret");
        assert_eq!(auth.decision("alice"), AuthDecision::CleartextPassword);
        assert!(auth.verify("alice", "secret"));
        assert!(!auth.verify("alice", "wrong"));
        assert!(!auth.verify("mallory", "secret"));
    }

    #[test]
    fn test_scramble_token() {
        assert_eq!(xor(&[0xff, 0x00], &[0x0f]), vec![0xf0, 0x0f]);

        let scramble = [7u8; 20];
        let token = mysql_native_token("secret", &scramble);
        assert_eq!(token.len(), 20);
        // deterministic for the same scramble
        assert_eq!(token, mysql_native_token("secret", &scramble));
        assert_ne!(token, mysql_native_token("other", &scramble));
        assert!(mysql_native_token("", &scramble).is_empty());
    }
}
