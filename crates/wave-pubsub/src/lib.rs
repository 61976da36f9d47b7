//! Scoped publish/subscribe broker for the Wave backend.
//!
//! Routes subscribe to event names and to ORef-shaped scopes
//! (`block:<oid>`, `tab:<oid>`, `block:*`). Published events are fanned out
//! to every matching route through an [`EventSink`], and the most recent
//! events per name are kept in a bounded ring for late joiners.

pub mod broker;
pub mod error;
pub mod event;

pub use broker::{BrokerConfig, EventBroker, EventSink};
pub use error::{BrokerError, BrokerResult};
pub use event::{events, SubscriptionRequest, WaveEvent};
