pub mod comparison;
pub mod enums;
pub mod report;

pub use comparison::*;
pub use enums::*;
pub use report::*;
