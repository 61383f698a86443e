pub mod config;
pub mod endpoint;
pub mod error;
pub mod lane;
pub mod md;
pub mod memory;
pub mod rkey;
pub mod rma;
pub mod types;
pub mod worker;

pub use config::{ContextParams, Features, RmaConfig};
pub use endpoint::{EndpointId, EndpointParams, Rkey};
pub use error::{Result, RmaError};
pub use lane::{LaneAttributes, LoopbackLane, RmaLane, Threshold};
pub use md::{HostMd, MdKey, MdSet, MemoryDomain, RegFlags};
pub use memory::{MapParams, MemHandle, MemMapping, MemRef, Registry};
pub use rkey::RemoteKey;
pub use rma::{RequestId, RequestParams, RmaStatus};
pub use types::{Datatype, MdIndex, MdMap, MemoryType};
pub use worker::{Context, MemInfo, Worker};
