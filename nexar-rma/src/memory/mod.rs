//! Memory handles, multi-domain registration and the registration cache.

mod bcopy_pool;
mod handle;
mod keys;
mod rcache;
pub mod registrar;

pub use bcopy_pool::{BcopyPool, BounceBuf};
pub use handle::{HandleId, HandleOrigin, MemHandle, MemHandleFlags, MemMapping, MemRef};
pub use keys::MdKeyArray;
pub use rcache::{MapParams, Registry};
