pub mod detection;
pub mod event;

pub use detection::*;
pub use event::*;
