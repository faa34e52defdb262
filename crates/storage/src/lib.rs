pub mod db;
pub mod error;
pub mod store;

pub use db::{
    create_db, find_category_id, insert_account, insert_transaction, save_category_rule,
    save_recurring_rule, seed_default_categories, DbPool,
};
pub use error::StorageError;
pub use store::SqliteStore;
