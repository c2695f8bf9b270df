//! Render subscriptions.
//!
//! Renderers observe every action as it enters or leaves the canonical
//! chain. They are registered on the engine as subscribers, so the chain
//! never holds a reference back into the code observing it.
//!
//! Delivery contract: each action is rendered at most once per residency
//! in the canonical chain; leaving the chain during a swap triggers an
//! unrender, and re-entering later triggers a fresh render. Renderer
//! failures never roll back the chain.

use crate::action::{Action, ActionEvaluation};
use crate::error::ActionError;

/// Observer for actions entering and leaving the canonical chain.
///
/// All methods default to no-ops so implementations can subscribe to just
/// the events they care about.
pub trait ActionRenderer<A: Action>: Send + Sync {
    /// A successfully evaluated action entered the canonical chain.
    fn render(&self, _evaluation: &ActionEvaluation<A>) {}

    /// A previously rendered action left the canonical chain.
    fn unrender(&self, _evaluation: &ActionEvaluation<A>) {}

    /// A failed action entered the canonical chain.
    fn render_error(&self, _evaluation: &ActionEvaluation<A>, _error: &ActionError) {}

    /// A previously rendered failed action left the canonical chain.
    fn unrender_error(&self, _evaluation: &ActionEvaluation<A>, _error: &ActionError) {}
}

/// Renderer that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullRenderer;

impl<A: Action> ActionRenderer<A> for NullRenderer {}
