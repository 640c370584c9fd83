//! Protobuf models generated from the `proto` directory.

mod drpc;
mod storage;

pub use drpc::{Call, DaosResp, Response};
pub use storage::Superblock;
