// Re-export the Database struct and other public items
pub mod core;
mod runs;
mod schema;

pub use self::core::Database;
pub use self::runs::{FindingsRecord, RunRecord};
