//! Event distribution for the state machine, engine, and rollback manager.
//!
//! Provides a generic `EventBus<E>` that delivers events synchronously to
//! every registered listener.

pub mod bus;

pub use bus::{EventBus, SubscriptionId};
