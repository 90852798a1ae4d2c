pub mod bitmap;
pub mod manager;

pub use bitmap::Pool;
pub use manager::{AddressPoolManager, PoolHandle, NO_POOL_HANDLE};
