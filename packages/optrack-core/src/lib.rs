//! Operation type codes, scheduler parameter records, and
//! diagnostic dump trees shared with the dispatcher, scheduler, and
//! diagnostic sink.

pub mod dump;
pub mod sched;
pub mod types;

pub use dump::{BlockerDump, OperationDump};
pub use sched::{PriorityClass, ScheduleParams};
pub use types::OpKind;
