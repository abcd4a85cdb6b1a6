//! Protocol types for mirror-bot
//!
//! Types that cross the boundary between the mirror core, the engine
//! adapters and the command surface.

mod types;

pub use types::{StatusType, TransferId, Uid};
