//! Interfaces implemented by external collaborators.

pub mod delivery;

pub use delivery::DeliveryChannel;
