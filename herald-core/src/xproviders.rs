//! Builder for extended-provider advertisements.
//!
//! An extended-provider ad announces additional parties serving content
//! under one logical provider. Each included provider co-signs its own
//! sub-record; the main provider is always part of the announced set.

use cid::Cid;
use libp2p::identity::{Keypair, PeerId};
use libp2p::Multiaddr;

use crate::ad::{Advertisement, ExtendedProvider, ProviderRecord, Result};

/// One extended provider: identity, signing key, retrieval metadata and
/// addresses.
#[derive(Clone)]
pub struct Info {
    pub id: PeerId,
    pub key: Keypair,
    pub metadata: Vec<u8>,
    pub addrs: Vec<Multiaddr>,
}

impl Info {
    pub fn new(id: PeerId, key: Keypair, metadata: Vec<u8>, addrs: Vec<Multiaddr>) -> Self {
        Self {
            id,
            key,
            metadata,
            addrs,
        }
    }
}

/// Fluent builder assembling and signing an extended-provider ad.
pub struct AdBuilder {
    provider: PeerId,
    key: Keypair,
    addrs: Vec<Multiaddr>,
    providers: Vec<Info>,
    override_previous: bool,
    context_id: Vec<u8>,
    metadata: Vec<u8>,
    last_ad_cid: Option<Cid>,
}

impl AdBuilder {
    pub fn new(provider: PeerId, key: Keypair, addrs: Vec<Multiaddr>) -> Self {
        Self {
            provider,
            key,
            addrs,
            providers: Vec::new(),
            override_previous: false,
            context_id: Vec::new(),
            metadata: Vec::new(),
            last_ad_cid: None,
        }
    }

    pub fn with_extended_providers(mut self, providers: impl IntoIterator<Item = Info>) -> Self {
        self.providers.extend(providers);
        self
    }

    pub fn with_override(mut self, override_previous: bool) -> Self {
        self.override_previous = override_previous;
        self
    }

    pub fn with_context_id(mut self, context_id: Vec<u8>) -> Self {
        self.context_id = context_id;
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Chain the built ad onto an existing head.
    pub fn with_last_ad_cid(mut self, cid: Cid) -> Self {
        self.last_ad_cid = Some(cid);
        self
    }

    /// Assemble the ad, sign every provider sub-record with its own key and
    /// the whole ad with the main provider key.
    pub fn build_and_sign(self) -> Result<Advertisement> {
        let provider_str = self.provider.to_string();
        let addr_strings: Vec<String> = self.addrs.iter().map(|a| a.to_string()).collect();

        let mut records: Vec<ProviderRecord> = self
            .providers
            .iter()
            .map(|info| ProviderRecord {
                id: info.id.to_string(),
                addresses: info.addrs.iter().map(|a| a.to_string()).collect(),
                metadata: info.metadata.clone(),
                signature: Vec::new(),
            })
            .collect();

        // The main provider is always announced alongside the extended set.
        if !records.iter().any(|r| r.id == provider_str) {
            records.push(ProviderRecord {
                id: provider_str.clone(),
                addresses: addr_strings.clone(),
                metadata: self.metadata.clone(),
                signature: Vec::new(),
            });
        }

        let mut ad = Advertisement {
            provider: provider_str,
            addresses: addr_strings,
            entries: None,
            context_id: self.context_id,
            metadata: self.metadata,
            is_rm: false,
            previous_id: self.last_ad_cid,
            extended_provider: Some(ExtendedProvider {
                override_previous: self.override_previous,
                providers: records,
            }),
            signature: Vec::new(),
        };

        let keys: Vec<(String, Keypair)> = self
            .providers
            .iter()
            .map(|info| (info.id.to_string(), info.key.clone()))
            .collect();
        ad.sign_with_extended_providers(&self.key, |id| {
            keys.iter()
                .find(|(known, _)| known == id)
                .map(|(_, key)| key.clone())
        })?;
        Ok(ad)
    }
}

impl std::fmt::Debug for AdBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdBuilder")
            .field("provider", &self.provider)
            .field("providers", &self.providers.len())
            .field("override_previous", &self.override_previous)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::AdError;

    fn identity() -> (PeerId, Keypair) {
        let key = Keypair::generate_ed25519();
        (PeerId::from(key.public()), key)
    }

    fn addrs() -> Vec<Multiaddr> {
        vec![
            "/ip4/0.0.0.0/tcp/3090".parse().unwrap(),
            "/ip4/0.0.0.0/tcp/3091".parse().unwrap(),
        ]
    }

    #[test]
    fn test_build_and_sign_includes_main_provider() {
        let (provider, key) = identity();
        let (xp1_id, xp1_key) = identity();
        let (xp2_id, xp2_key) = identity();

        let ad = AdBuilder::new(provider, key, addrs())
            .with_extended_providers(vec![
                Info::new(xp1_id, xp1_key, b"m1".to_vec(), Vec::new()),
                Info::new(xp2_id, xp2_key, b"m2".to_vec(), Vec::new()),
            ])
            .with_override(true)
            .with_context_id(b"test-context".to_vec())
            .with_metadata(b"metadata".to_vec())
            .build_and_sign()
            .unwrap();

        let signer = ad.verify_signature().unwrap();
        assert_eq!(signer, provider);
        assert_eq!(ad.entries, None);
        assert!(!ad.is_rm);

        let xp = ad.extended_provider.as_ref().unwrap();
        assert!(xp.override_previous);
        assert_eq!(xp.providers.len(), 3);
        assert!(xp.providers.iter().any(|p| p.id == provider.to_string()));
        assert!(xp.providers.iter().any(|p| p.id == xp1_id.to_string()));
        assert!(xp.providers.iter().any(|p| p.id == xp2_id.to_string()));
    }

    #[test]
    fn test_override_without_context_fails_before_publication() {
        let (provider, key) = identity();
        let (xp_id, xp_key) = identity();

        let result = AdBuilder::new(provider, key, addrs())
            .with_extended_providers(vec![Info::new(xp_id, xp_key, Vec::new(), Vec::new())])
            .with_override(true)
            .with_metadata(b"metadata".to_vec())
            .build_and_sign();

        assert!(matches!(result, Err(AdError::OverrideWithoutContext)));
    }

    #[test]
    fn test_chains_onto_previous_head() {
        let (provider, key) = identity();
        let prev = crate::link::node_cid(crate::link::AD_CODEC, b"prev").unwrap();

        let ad = AdBuilder::new(provider, key, addrs())
            .with_context_id(b"ctx".to_vec())
            .with_last_ad_cid(prev)
            .build_and_sign()
            .unwrap();

        assert_eq!(ad.previous_id, Some(prev));
        ad.verify_signature().unwrap();
    }
}
