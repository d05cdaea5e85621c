//! Built-in dispatch layers.

pub mod invoke;
pub mod parallelize;
pub mod retry;

pub use invoke::Invoke;
pub use parallelize::Parallelize;
pub use retry::Retry;
