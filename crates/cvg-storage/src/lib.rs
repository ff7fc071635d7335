pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;
pub mod types;

pub use crate::fjall::{FjallEngine, FjallStore};
pub use crate::mem::{EngineOp, MemEngine};
pub use crate::traits::StorageEngine;
