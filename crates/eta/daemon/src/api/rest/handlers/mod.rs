//! API request handlers

mod eta;
mod rides;
mod system;

pub use eta::*;
pub use rides::*;
pub use system::*;
