use thiserror::Error;

use crate::krpc::RpcError;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("invalid node id length")]
    InvalidNodeId,
}
