pub mod cache;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod queue;
pub mod request;
pub mod residency;
pub mod sink;
pub mod store;
pub mod tile;
pub mod tiles;
pub mod viewport;

pub use cache::*;
pub use config::*;
pub use coordinator::*;
pub use entity::*;
pub use error::*;
pub use fetch::*;
pub use pipeline::*;
pub use queue::*;
pub use request::*;
pub use residency::*;
pub use sink::*;
pub use store::*;
pub use tile::*;
pub use tiles::*;
pub use viewport::*;
