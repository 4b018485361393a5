//! Slot directories: the three ways a page body indexes the records it holds.

mod fixed;
mod stable;
mod variadic;

pub use fixed::FixedDirectory;
pub use stable::{StableDirectory, StableDirectoryView};
pub use variadic::{VariadicDirectory, VariadicDirectoryView};
