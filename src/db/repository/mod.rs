//! Repository layer: entity-scoped database operations over a borrowed connection.

mod comparison;
mod patient_context;
mod report;

pub use comparison::*;
pub use patient_context::*;
pub use report::*;
