//! Authentication gate for CONNECT credentials.

/// Verifies a username/password pair from a CONNECT packet.
///
/// The broker only consults a validator when anonymous connections are
/// disallowed; how credentials are stored and hashed is up to the
/// implementation (the daemon ships an argon2 password-file validator).
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, username: &str, password: &[u8]) -> bool;
}
