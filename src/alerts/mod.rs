//! Streaming alert evaluation
//!
//! Every metric frame accepted by the core is fed through the
//! [`AlertEvaluator`], which checks it against the enabled rules and
//! produces firing/resolving alert instances with dwell and cooldown.

pub mod evaluator;
pub mod notify;

pub use evaluator::AlertEvaluator;
pub use notify::{Notifier, WebhookNotifier};
