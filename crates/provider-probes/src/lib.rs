//! Existence probes against third-party provider endpoints, plus
//! detection of which platform hosts a domain's mail.
//!
//! Each provider family is globally serialized with a minimum
//! inter-call spacing; the upstreams are undocumented and quick to
//! throttle, so probe outcomes are advisory evidence, never proof.

use serde::Serialize;

mod hosting;
mod pacing;
mod probes;

pub use hosting::{detect_hosting, is_consumer_gmail, is_major_provider, HostedBy};
pub use pacing::Pacer;
pub use probes::{gravatar_hash, Endpoints, ProviderProber};

/// Tri-state outcomes for every provider consulted about one email.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderChecks {
    pub microsoft: Option<bool>,
    pub google: Option<bool>,
    pub apple: Option<bool>,
    pub gravatar: Option<bool>,
    pub github: Option<bool>,
    pub pgp: Option<bool>,
    pub hibp: Option<bool>,
}

impl ProviderChecks {
    /// A definitive "no" from the platform that hosts the mailbox
    /// outweighs everything else.
    pub fn any_host_denies(&self) -> bool {
        self.microsoft == Some(false)
            || self.google == Some(false)
            || self.apple == Some(false)
    }

    pub fn any_host_confirms(&self) -> bool {
        self.microsoft == Some(true)
            || self.google == Some(true)
            || self.apple == Some(true)
    }

    /// Secondary presence signals: not mailbox proof, but evidence
    /// the address is in real use.
    pub fn any_footprint(&self) -> bool {
        self.gravatar == Some(true)
            || self.github == Some(true)
            || self.pgp == Some(true)
            || self.hibp == Some(true)
    }
}
