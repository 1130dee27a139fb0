pub mod logging;
pub mod time;
pub mod validation;

pub use logging::{initialize_logging, log_auth_event};
pub use time::{Clock, ManualClock, SystemClock};
