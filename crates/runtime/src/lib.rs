pub mod budget;
pub mod debounce;
pub mod metrics;
pub mod work_queue;

pub use budget::*;
pub use debounce::*;
pub use metrics::*;
pub use work_queue::*;
