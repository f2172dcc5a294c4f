pub mod compare;
pub mod generator;

pub use compare::*;
pub use generator::*;
