//! Herald Core
//!
//! The advertisement engine of the herald index provider: a signed,
//! append-only chain of content-addressed advertisements, the publication
//! transports that let indexers pull it, and the reframe listener that
//! turns streaming provide calls into advertisements.

pub mod ad;
pub mod announce;
pub mod config;
pub mod datastore;
pub mod dtsync_publisher;
pub mod engine;
pub mod entries;
pub mod head;
pub mod http_publisher;
pub mod link;
pub mod lister;
pub mod metrics;
pub mod publisher;
pub mod reframe;
pub mod xproviders;

pub use ad::{Advertisement, EntriesChunk, ExtendedProvider, ProviderRecord};
pub use config::Config;
pub use datastore::{Datastore, MemDatastore};
pub use engine::{Engine, EngineBuilder, EngineError, Provider, ProviderInfo};
pub use head::SignedHead;
pub use lister::{MhStore, MultihashIterator, MultihashLister};
pub use metrics::Metrics;
pub use publisher::{Publisher, PublisherKind};
pub use reframe::ReframeListener;
