pub mod contribution;
pub mod error;
pub mod event;
pub mod memo;

pub use contribution::ContributionId;
pub use error::{Error, Result};
pub use event::{BlockSummary, ConfirmationEvent};
