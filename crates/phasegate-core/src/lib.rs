pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod gate;
pub mod metrics;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{PhasegateError, Result};
pub use event::EventBus;
pub use gate::*;
pub use metrics::Metrics;
pub use traits::Executor;
pub use types::*;
