//! Real-time data synchronization primitives.
//!
//! - [`registry`]: resources and the relationships between them.
//! - [`loader`]: batching loaders that turn many single-key loads issued together into one
//!   bulk fetch, and relationship dispatch on top of them.
//! - [`rpc`]: path-addressed queries, mutations and subscriptions, with field selection and
//!   minimal update encodings for subscription emissions.
//! - [`cache`]: a client cache with optimistic updates.
//! - [`channel`]: named pub/sub channels that subscribers can replay from a cursor.
//! - [`stream`]: the orchestrator turning AI provider streams into replayable, persisted
//!   session state.
//!
//! Nothing in this crate performs network or storage I/O itself. Transports, relationship
//! storage, channel persistence, AI providers and session storage are traits implemented by
//! the embedding application.
#![deny(missing_docs)]
#![cfg_attr(syncwire_docsrs, feature(doc_auto_cfg))]

pub mod cache;
pub mod channel;
pub mod config;
pub mod loader;
pub mod metrics;
pub mod registry;
pub mod rpc;
pub mod stream;

pub use self::{
    cache::OptimisticCache,
    channel::{Cursor, EventChannel, PubSubEvent},
    config::Config,
    loader::{BatchLoader, RelationLoader},
    registry::{Registry, ResourceDefinition},
    rpc::{CallRequest, CallType, Client, Router},
    stream::Orchestrator,
};
