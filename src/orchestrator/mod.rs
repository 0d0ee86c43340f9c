//! Run-time coordination of the two children.
//!
//! The tick driver keeps the engine advancing in the background while the
//! supervisor loop watches both processes and owns their shutdown.

mod supervisor;
mod ticker;

pub(crate) use supervisor::Supervisor;
pub(crate) use ticker::{spawn as spawn_ticker, TickConfig};
