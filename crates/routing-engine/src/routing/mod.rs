//! # Task Routing
//!
//! Event plumbing, the reservation gateway seam and the per-queue router.

pub mod events;
pub mod gateway;
pub mod router;

pub use events::{EventBus, RouterEvent, RoutingOutcome};
pub use gateway::{LocalReservationGateway, ReservationGateway};
pub use router::TaskRouter;
