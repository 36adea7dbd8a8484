//! Storage module
//!
//! Piece bookkeeping, verification and the byte storage behind it.

pub mod backend;
pub mod file;
pub mod manager;
pub mod piece;
pub mod store;

pub use backend::{MemoryStorage, StorageBackend, StorageType};
pub use file::FileStorage;
pub use manager::{BlockRequest, PieceManager, VerifyResult};
pub use piece::{PieceState, PieceStatus};
pub use store::PieceStore;
