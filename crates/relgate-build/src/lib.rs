pub mod builder;
pub mod digest;

pub use builder::*;
pub use digest::*;
