pub mod fixture;
pub mod git;
pub mod store;
pub mod verifier;

pub use git::*;
pub use store::*;
pub use verifier::*;
