//! Extensions to the `secrecy` crate. Specifically, to make secrets comparable.

use derive_more::AsRef;
use secrecy::{ExposeSecret, Secret};
use subtle::ConstantTimeEq;

/// [`Secret`], specialized to [`String`], with constant-time comparisons.
///
/// Repository auth descriptors carry these so that config types can derive
/// `PartialEq` without leaking timing information about the secret contents.
#[derive(Debug, Clone, AsRef)]
pub struct ComparableSecretString(Secret<String>);

impl ComparableSecretString {
    /// Expose the wrapped secret.
    ///
    /// Call sites should be careful to never log or persist the exposed value;
    /// it only leaves the wrapper at the moment it is handed to an external process.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl PartialEq for ComparableSecretString {
    fn eq(&self, other: &Self) -> bool {
        let lhs = self.0.expose_secret().as_bytes();
        let rhs = other.0.expose_secret().as_bytes();
        ConstantTimeEq::ct_eq(lhs, rhs).into()
    }
}

impl Eq for ComparableSecretString {}

impl From<String> for ComparableSecretString {
    fn from(value: String) -> Self {
        let secret = Secret::new(value);
        Self(secret)
    }
}

impl From<&str> for ComparableSecretString {
    fn from(value: &str) -> Self {
        Self::from(String::from(value))
    }
}
