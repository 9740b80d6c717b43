//! HTTP handlers for booking-service.
//!
//! Only the payment entry points are exposed over HTTP; everything else is
//! driven through the services directly.

mod actor;
pub mod health;
pub mod payments;
pub mod webhooks;

pub use actor::ActorContext;
