//! Subscriber framework: registration, per-subscriber coalescing, teardown
//! (spec.md §4.3, design note §9).

use async_trait::async_trait;

use crate::domain::error::BuildError;
use crate::store::actions::ChangeSummary;
use crate::store::engine::StoreHandle;

pub type SubscriberId = u64;

/// A component notified after every reduced batch. Implementors perform side
/// effects and feed results back in as further `Action`s via the handle.
///
/// Mutable interior state belongs to the implementor (e.g. behind its own
/// `Mutex`) rather than `&mut self`, since the engine calls `on_change`
/// through a shared `Arc<dyn Subscriber>` — this is the idiomatic stand-in
/// for identity-by-pointer registration (design note §9).
///
/// An `Err` return is reported as an `Action::Error` on the next cycle; it
/// does not halt fan-out to other subscribers (spec.md §4.3).
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn set_up(&self, _store: &StoreHandle) {}

    async fn on_change(&self, store: &StoreHandle, summary: &ChangeSummary) -> Result<(), BuildError>;

    async fn tear_down(&self, _store: &StoreHandle) {}
}
