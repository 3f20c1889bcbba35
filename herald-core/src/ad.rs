//! Advertisement and entries-chunk records.
//!
//! Advertisements form a signed, append-only chain: each one points at its
//! predecessor through `previous_id` and at a back-linked list of
//! entries chunks through `entries`. Wire encoding is protobuf via prost
//! derive macros, the same convention the rest of the node uses for its
//! protocols.

use cid::Cid;
use libp2p::identity::{Keypair, PeerId, PublicKey};
use libp2p::Multiaddr;
use multihash::Multihash;
use prost::Message as ProstMessage;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum length of a caller-supplied context ID.
pub const MAX_CONTEXT_ID_LEN: usize = 64;

/// Domain separation tag mixed into the advertisement signature payload.
const AD_SIGNATURE_DOMAIN: &[u8] = b"/herald/ad-signature";

/// Domain separation tag for per-extended-provider signatures.
const XP_SIGNATURE_DOMAIN: &[u8] = b"/herald/xp-signature";

/// Transport metadata for plain block retrieval: the multicodec varint for
/// `transport-bitswap` (0x0900).
pub const BITSWAP_METADATA: &[u8] = &[0x80, 0x12];

#[derive(Debug, Error)]
pub enum AdError {
    #[error("advertisement has no addresses")]
    NoAddresses,

    #[error("bad multiaddr: {0}")]
    BadMultiaddr(String),

    #[error("context id too long: {0} bytes")]
    ContextTooLong(usize),

    #[error("override requires context id")]
    OverrideWithoutContext,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("signature does not verify")]
    BadSignature,

    #[error("signer {signer} does not match provider {provider}")]
    SignerMismatch { signer: String, provider: String },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid cid: {0}")]
    InvalidCid(String),

    #[error("invalid multihash: {0}")]
    InvalidMultihash(String),
}

pub type Result<T> = std::result::Result<T, AdError>;

/// One auxiliary provider record inside an extended-provider announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    /// Peer ID string of the provider.
    pub id: String,
    /// Multiaddr strings where this provider serves content.
    pub addresses: Vec<String>,
    /// Opaque retrieval metadata for this provider.
    pub metadata: Vec<u8>,
    /// Signature by this provider's own key over its sub-record.
    pub signature: Vec<u8>,
}

/// Extended-provider section: additional parties announcing under one
/// logical provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedProvider {
    /// When true, these providers replace any previously announced set for
    /// the same context. Requires a non-empty context ID.
    pub override_previous: bool,
    pub providers: Vec<ProviderRecord>,
}

/// A signed advertisement: one link in the provider's ad chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Peer ID string of the logical provider.
    pub provider: String,
    /// Multiaddr strings where the provider serves content. Never empty.
    pub addresses: Vec<String>,
    /// CID of the newest entries chunk, or `None` for the NoEntries
    /// sentinel (removals and extended-providers-only ads).
    pub entries: Option<Cid>,
    /// Caller-chosen opaque batch identifier, at most 64 bytes.
    pub context_id: Vec<u8>,
    /// Opaque retrieval metadata; leading varint identifies the transport.
    pub metadata: Vec<u8>,
    /// True iff this ad retracts the multihashes announced under the same
    /// (provider, context) pair.
    pub is_rm: bool,
    /// CID of the prior ad in the chain; `None` for the genesis ad.
    pub previous_id: Option<Cid>,
    pub extended_provider: Option<ExtendedProvider>,
    /// Signed envelope binding all of the above under the provider key.
    pub signature: Vec<u8>,
}

/// A page of multihashes, back-linked from newest to oldest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntriesChunk {
    pub entries: Vec<Multihash<64>>,
    pub next: Option<Cid>,
}

// Wire messages. Hand-derived, no protoc involved.

#[derive(Clone, PartialEq, prost::Message)]
struct ProviderMessage {
    #[prost(string, tag = "1")]
    id: String,

    #[prost(string, repeated, tag = "2")]
    addresses: Vec<String>,

    #[prost(bytes = "vec", tag = "3")]
    metadata: Vec<u8>,

    #[prost(bytes = "vec", tag = "4")]
    signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ExtendedProviderMessage {
    #[prost(bool, tag = "1")]
    override_previous: bool,

    #[prost(message, repeated, tag = "2")]
    providers: Vec<ProviderMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct AdMessage {
    #[prost(string, tag = "1")]
    provider: String,

    #[prost(string, repeated, tag = "2")]
    addresses: Vec<String>,

    #[prost(bytes = "vec", optional, tag = "3")]
    entries: Option<Vec<u8>>,

    #[prost(bytes = "vec", tag = "4")]
    context_id: Vec<u8>,

    #[prost(bytes = "vec", tag = "5")]
    metadata: Vec<u8>,

    #[prost(bool, tag = "6")]
    is_rm: bool,

    #[prost(bytes = "vec", optional, tag = "7")]
    previous_id: Option<Vec<u8>>,

    #[prost(message, optional, tag = "8")]
    extended_provider: Option<ExtendedProviderMessage>,

    #[prost(bytes = "vec", tag = "9")]
    signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct EntriesChunkMessage {
    #[prost(bytes = "vec", repeated, tag = "1")]
    entries: Vec<Vec<u8>>,

    #[prost(bytes = "vec", optional, tag = "2")]
    next: Option<Vec<u8>>,
}

/// Per-provider signable sub-view: the record fields plus the enclosing
/// ad's context and override flag, so a sub-signature cannot be replayed
/// into a different context.
#[derive(Clone, PartialEq, prost::Message)]
struct XpSignableMessage {
    #[prost(string, tag = "1")]
    id: String,

    #[prost(string, repeated, tag = "2")]
    addresses: Vec<String>,

    #[prost(bytes = "vec", tag = "3")]
    metadata: Vec<u8>,

    #[prost(bytes = "vec", tag = "4")]
    context_id: Vec<u8>,

    #[prost(bool, tag = "5")]
    override_previous: bool,
}

/// Signature envelope: the signer's protobuf-encoded public key plus the
/// raw signature, so verification can recompute the signer's peer ID.
#[derive(Clone, PartialEq, prost::Message)]
struct SignatureEnvelope {
    #[prost(bytes = "vec", tag = "1")]
    public_key: Vec<u8>,

    #[prost(bytes = "vec", tag = "2")]
    signature: Vec<u8>,
}

fn cid_from_bytes(bytes: &[u8]) -> Result<Cid> {
    Cid::try_from(bytes).map_err(|e| AdError::InvalidCid(e.to_string()))
}

fn sign_payload(key: &Keypair, domain: &[u8], encoded: &[u8]) -> Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(encoded);
    let digest = hasher.finalize();

    let sig = key
        .sign(&digest)
        .map_err(|e| AdError::Signing(e.to_string()))?;
    let envelope = SignatureEnvelope {
        public_key: key.public().encode_protobuf(),
        signature: sig,
    };
    Ok(envelope.encode_to_vec())
}

/// Verify an envelope over `domain || encoded` and return the signer's
/// peer ID recomputed from the embedded public key.
fn verify_payload(envelope_bytes: &[u8], domain: &[u8], encoded: &[u8]) -> Result<PeerId> {
    let envelope = SignatureEnvelope::decode(envelope_bytes)?;
    let public_key = PublicKey::try_decode_protobuf(&envelope.public_key)
        .map_err(|_| AdError::BadSignature)?;

    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(encoded);
    let digest = hasher.finalize();

    if !public_key.verify(&digest, &envelope.signature) {
        return Err(AdError::BadSignature);
    }
    Ok(PeerId::from_public_key(&public_key))
}

impl Advertisement {
    /// Structural checks that hold for every valid ad, signed or not.
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(AdError::NoAddresses);
        }
        for addr in &self.addresses {
            addr.parse::<Multiaddr>()
                .map_err(|_| AdError::BadMultiaddr(addr.clone()))?;
        }
        if self.context_id.len() > MAX_CONTEXT_ID_LEN {
            return Err(AdError::ContextTooLong(self.context_id.len()));
        }
        if let Some(xp) = &self.extended_provider {
            if xp.override_previous && self.context_id.is_empty() {
                return Err(AdError::OverrideWithoutContext);
            }
            for p in &xp.providers {
                for addr in &p.addresses {
                    addr.parse::<Multiaddr>()
                        .map_err(|_| AdError::BadMultiaddr(addr.clone()))?;
                }
            }
        }
        Ok(())
    }

    fn to_message(&self) -> AdMessage {
        AdMessage {
            provider: self.provider.clone(),
            addresses: self.addresses.clone(),
            entries: self.entries.map(|c| c.to_bytes()),
            context_id: self.context_id.clone(),
            metadata: self.metadata.clone(),
            is_rm: self.is_rm,
            previous_id: self.previous_id.map(|c| c.to_bytes()),
            extended_provider: self.extended_provider.as_ref().map(|xp| {
                ExtendedProviderMessage {
                    override_previous: xp.override_previous,
                    providers: xp
                        .providers
                        .iter()
                        .map(|p| ProviderMessage {
                            id: p.id.clone(),
                            addresses: p.addresses.clone(),
                            metadata: p.metadata.clone(),
                            signature: p.signature.clone(),
                        })
                        .collect(),
                }
            }),
            signature: self.signature.clone(),
        }
    }

    /// The byte view covered by the ad signature: everything except the ad
    /// signature itself and the per-provider sub-signatures.
    fn signable_bytes(&self) -> Vec<u8> {
        let mut msg = self.to_message();
        msg.signature.clear();
        if let Some(xp) = &mut msg.extended_provider {
            for p in &mut xp.providers {
                p.signature.clear();
            }
        }
        msg.encode_to_vec()
    }

    fn xp_signable_bytes(&self, record: &ProviderRecord) -> Vec<u8> {
        let override_previous = self
            .extended_provider
            .as_ref()
            .map(|xp| xp.override_previous)
            .unwrap_or(false);
        XpSignableMessage {
            id: record.id.clone(),
            addresses: record.addresses.clone(),
            metadata: record.metadata.clone(),
            context_id: self.context_id.clone(),
            override_previous,
        }
        .encode_to_vec()
    }

    /// Sign a plain (non-extended) advertisement with the provider key.
    pub fn sign(&mut self, key: &Keypair) -> Result<()> {
        self.validate()?;
        let payload = self.signable_bytes();
        self.signature = sign_payload(key, AD_SIGNATURE_DOMAIN, &payload)?;
        Ok(())
    }

    /// Sign an extended-providers advertisement.
    ///
    /// Every provider record is signed with its own key: the main provider
    /// with `key`, every other with whatever `key_lookup` returns for its
    /// peer ID string. A missing key fails the whole signing.
    pub fn sign_with_extended_providers<F>(&mut self, key: &Keypair, key_lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<Keypair>,
    {
        self.validate()?;

        let records: Vec<ProviderRecord> = match &self.extended_provider {
            Some(xp) => xp.providers.clone(),
            None => Vec::new(),
        };
        let mut signed = Vec::with_capacity(records.len());
        for mut record in records {
            let payload = self.xp_signable_bytes(&record);
            let signer = if record.id == self.provider {
                key.clone()
            } else {
                key_lookup(&record.id)
                    .ok_or_else(|| AdError::UnknownProvider(record.id.clone()))?
            };
            record.signature = sign_payload(&signer, XP_SIGNATURE_DOMAIN, &payload)?;
            signed.push(record);
        }
        if let Some(xp) = &mut self.extended_provider {
            xp.providers = signed;
        }

        let payload = self.signable_bytes();
        self.signature = sign_payload(key, AD_SIGNATURE_DOMAIN, &payload)?;
        Ok(())
    }

    /// Verify the ad signature and every extended-provider sub-signature.
    ///
    /// Returns the provider's peer ID recomputed from the signing key.
    pub fn verify_signature(&self) -> Result<PeerId> {
        self.validate()?;

        let payload = self.signable_bytes();
        let signer = verify_payload(&self.signature, AD_SIGNATURE_DOMAIN, &payload)?;
        if signer.to_string() != self.provider {
            return Err(AdError::SignerMismatch {
                signer: signer.to_string(),
                provider: self.provider.clone(),
            });
        }

        if let Some(xp) = &self.extended_provider {
            for record in &xp.providers {
                let payload = self.xp_signable_bytes(record);
                let sub_signer =
                    verify_payload(&record.signature, XP_SIGNATURE_DOMAIN, &payload)?;
                if sub_signer.to_string() != record.id {
                    return Err(AdError::SignerMismatch {
                        signer: sub_signer.to_string(),
                        provider: record.id.clone(),
                    });
                }
            }
        }

        Ok(signer)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_message().encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let msg = AdMessage::decode(bytes)?;
        Ok(Self {
            provider: msg.provider,
            addresses: msg.addresses,
            entries: msg.entries.as_deref().map(cid_from_bytes).transpose()?,
            context_id: msg.context_id,
            metadata: msg.metadata,
            is_rm: msg.is_rm,
            previous_id: msg.previous_id.as_deref().map(cid_from_bytes).transpose()?,
            extended_provider: msg.extended_provider.map(|xp| ExtendedProvider {
                override_previous: xp.override_previous,
                providers: xp
                    .providers
                    .into_iter()
                    .map(|p| ProviderRecord {
                        id: p.id,
                        addresses: p.addresses,
                        metadata: p.metadata,
                        signature: p.signature,
                    })
                    .collect(),
            }),
            signature: msg.signature,
        })
    }
}

impl EntriesChunk {
    pub fn encode(&self) -> Vec<u8> {
        EntriesChunkMessage {
            entries: self.entries.iter().map(|mh| mh.to_bytes()).collect(),
            next: self.next.map(|c| c.to_bytes()),
        }
        .encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let msg = EntriesChunkMessage::decode(bytes)?;
        let mut entries = Vec::with_capacity(msg.entries.len());
        for mh_bytes in &msg.entries {
            let mh = Multihash::from_bytes(mh_bytes)
                .map_err(|e| AdError::InvalidMultihash(e.to_string()))?;
            entries.push(mh);
        }
        Ok(Self {
            entries,
            next: msg.next.as_deref().map(cid_from_bytes).transpose()?,
        })
    }
}
