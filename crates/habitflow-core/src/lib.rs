//! # Habitflow Core
//! Configuration, errors, shared types and collaborator traits.

pub mod clock;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, DayWindow, ManualClock, SystemClock};
pub use config::HabitflowConfig;
pub use error::{HabitflowError, Result};
pub use traits::DeliveryChannel;
pub use types::{MessageId, Notification, OverdueAt, Recipient};
