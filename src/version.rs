//! The running build's version, used for `--self-update` comparisons and
//! reported by `/assets/kiwi/` consumers.

/// The runtime's own version string, compared against the remote manifest's
/// `kiwi` entry hash during self-update (spec §8 "Self-update no-op").
pub const KIWI_VERSION: &str = env!("CARGO_PKG_VERSION");
