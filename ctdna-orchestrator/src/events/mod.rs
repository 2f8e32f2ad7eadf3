//! Event bus and lifecycle emission.
//!
//! Every message this service produces leaves through an [`EventBus`]:
//! lifecycle transitions via the [`LifecycleEmitter`], engine submissions
//! from the submission step.

mod bus;
mod emitter;

pub use bus::{CollectingEventBus, EventBus, LoggingEventBus, NoOpEventBus};
pub use emitter::{LifecycleEmitter, PublishFormat};
