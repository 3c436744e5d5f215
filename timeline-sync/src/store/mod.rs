pub mod memory;
pub mod postgres;

pub use memory::{MemoryPostStore, MemoryUserStore};
pub use postgres::{PgPostStore, PgUserStore};
