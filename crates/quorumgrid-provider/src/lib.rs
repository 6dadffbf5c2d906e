//! quorumgrid-provider — per-namespace cache of cloud provider handles.
//!
//! Workers that need to talk to the cloud ask a [`ProviderTracker`] for
//! a provider instead of building one themselves. The tracker builds at
//! most one provider per namespace at a time, caches successes, retries
//! failures on the next request, and can be killed to fail every waiter
//! fast during shutdown.

pub mod error;
pub mod tracker;

pub use error::{TrackerError, TrackerResult};
pub use tracker::{ConfigSource, ProviderBuilder, ProviderConfig, ProviderTracker, TrackerMode};
