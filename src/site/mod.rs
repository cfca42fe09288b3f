//! Site adapters: the site-specific half of login, checking, and booking.

pub mod base;
pub mod json_api;
pub mod registry;

pub use base::{Availability, Credentials, ReservationOutcome, ReservationRequest, SiteAdapter};
pub use json_api::JsonApiAdapter;
pub use registry::SiteRegistry;
