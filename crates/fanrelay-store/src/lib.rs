pub mod commands;
pub mod database;
pub mod error;
pub mod readings;
pub mod row_helpers;
pub mod schema;

pub use commands::{CommandRepo, CommandStore};
pub use database::Database;
pub use error::StoreError;
pub use readings::ReadingRepo;
