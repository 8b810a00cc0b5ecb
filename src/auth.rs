use tracing::warn;

use crate::observability;

/// Shared-secret check for the first request on a connection.
#[derive(Debug, Clone)]
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }

    /// Compare without short-circuiting on the first differing byte.
    pub fn verify(&self, candidate: &str) -> bool {
        let expected = self.password.as_bytes();
        let given = candidate.as_bytes();
        let diff = expected
            .iter()
            .zip(given)
            .fold(expected.len() ^ given.len(), |acc, (a, b)| acc | (a ^ b) as usize);
        if diff != 0 {
            warn!("authentication failed");
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        }
        diff == 0
    }
}
