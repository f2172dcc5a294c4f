pub mod cancel;
pub mod fake;
pub mod invocation;
pub mod process;

pub use cancel::*;
pub use fake::*;
pub use invocation::*;
pub use process::*;
