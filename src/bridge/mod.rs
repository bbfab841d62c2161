//! The client↔server Bridge (spec C5): a typed RPC from a client-side
//! module to its server-side twin, with a per-request ephemeral Ingress on
//! the server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod ingress;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A 10-character alphanumeric request ID for log correlation (spec §4.5
/// step 1). Derived from a monotonic counter plus process-start entropy
/// rather than pulling in a `rand` dependency the teacher never needed.
pub fn generate_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let seed = format!("{}-{}-{}", std::process::id(), nanos, seq);
    crate::manifest::sha256_hex(seed.as_bytes())[..10].to_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_ids_are_ten_alphanumeric_characters_and_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_eq!(10, a.len());
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
