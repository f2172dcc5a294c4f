pub mod error;
pub mod ids;
pub mod model;
pub mod plan;
pub mod report;

pub use error::*;
pub use ids::*;
pub use model::*;
pub use plan::*;
pub use report::*;
