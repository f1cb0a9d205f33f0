pub mod admin;
pub mod dirs;
pub mod error;
pub mod row;
pub mod store;

pub use admin::DuplicateCheckAdmin;
pub use dirs::DuplicateCheckDirs;
pub use error::DedupError;
pub use row::{canonical_bytes, decode_canonical, row_hash, DedupColumn};
pub use store::{DuplicateCheckStore, RowPage, StoredRow};
