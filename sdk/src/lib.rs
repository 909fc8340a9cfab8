//! Server-side Switchboard SDK for Rust.
//!
//! The entry point is [`Client`], constructed from a [`Config`]. The client
//! keeps a local copy of flag and segment definitions synchronized with the
//! control plane, evaluates flags against user contexts entirely in process,
//! and ships analytics events describing those evaluations in the background.
//!
//! # Examples
//! ```no_run
//! use switchboard::{Client, Config, User};
//!
//! let client = Client::build(Config::from_sdk_key("sdk-key")).unwrap();
//! let user = User::with_key("user-key").country("SE");
//! if client.bool_variation(&user, "new-checkout", false) {
//!     // serve the new checkout
//! }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

mod all_flags;
mod client;
mod config;

pub use all_flags::{AllFlagsOptions, FeatureFlagsState};
pub use client::{Client, Detail};
pub use config::Config;

// Re-exported core types that appear in the public API.
pub use switchboard_core::bigseg::{BigSegmentStore, BigSegmentsConfig};
pub use switchboard_core::datasource::{
    DataSourceState, DataSourceStatus, FeatureRequester, StreamSource,
};
pub use switchboard_core::eval::{BigSegmentsStatus, ErrorKind, EvaluationDetail, Reason};
pub use switchboard_core::events::{EventSender, EventsConfig};
pub use switchboard_core::store::{CacheConfig, CachingStoreWrapper, DataStore};
pub use switchboard_core::User;
