pub mod camera;
pub mod cancel;
pub mod controller;
pub mod machine;
pub mod mode;
pub mod settle;
pub mod state;

pub use camera::*;
pub use cancel::*;
pub use controller::*;
pub use machine::*;
pub use mode::*;
pub use settle::*;
pub use state::*;
