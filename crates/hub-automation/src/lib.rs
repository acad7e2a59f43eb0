//! Automation supervisor
//!
//! [`Automation`] owns every engine component (variable store, action
//! executor and dispatcher, source manager, rule engine) and drives them
//! through the lifecycle:
//!
//! ```text
//! UNINITIALIZED --init--> INITIALIZED --start--> RUNNING <--pause/resume--> PAUSED
//!                                                   |                         |
//!                                                   +--------stop------> STOPPED --start--> RUNNING
//! ```
//!
//! A failed `init` leaves the engine in `ERROR`, from which `init` may be
//! retried.

mod state;
mod supervisor;

pub use state::{AutomationStatus, EngineState, ReloadSummary};
pub use supervisor::{Automation, STOP_GRACE};
