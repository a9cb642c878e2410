pub mod phase;
pub mod slot;

pub use phase::ConnectionPhase;
pub use slot::{CommandSlot, PendingCommand};
