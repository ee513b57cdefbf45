pub mod dispatch;
pub mod signal;
pub mod vehicle;

pub use dispatch::*;
pub use signal::*;
pub use vehicle::*;
