pub mod engine;
pub mod report;
pub mod route;

pub use engine::*;
pub use report::*;
pub use route::*;
