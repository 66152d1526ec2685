//! Outbound side of the device bridge.
//!
//! Everything that leaves the device goes through [`RetryingHttpClient`]:
//! alerts to the notification topic ([`Notifier`]) and rows to the state
//! store ([`StateStore`]). Both are reached by the rest of the daemon through
//! the [`AlertSink`] and [`StateSink`] traits so tests can swap in fakes.

#![forbid(unsafe_code)]

pub mod notify;
pub mod retry;
pub mod store;

pub use notify::{AlertSink, DisabledNotifier, Notifier};
pub use retry::{Delivered, PushError, PushResult, RetryPolicy, RetryingHttpClient};
pub use store::{StateSink, StateStore, StoreTables};
