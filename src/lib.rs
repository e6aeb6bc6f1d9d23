pub mod config;
pub mod error;
pub mod keys;
pub mod migration;
pub mod script;
pub mod signing;
pub mod storage;
pub mod sweep;
pub mod transaction;
pub mod types;

pub use error::{AppError, Result};
pub use keys::{ResolvedKey, XPublicKey};
pub use migration::repository::{MemoryRepository, WalletRepository};
pub use migration::MigrationLadder;
pub use storage::WalletStorage;
pub use transaction::Transaction;
pub use types::{ScriptKind, TxInput, TxOut};
