//! Protobuf definitions for the driftlog record format and gRPC surface.
//!
//! The `Record` message doubles as the on-disk codec: segments store
//! prost-encoded records behind a length prefix, so the wire format and the
//! storage format are the same stable encoding.

/// Generated types for the `driftlog.v1` package.
pub mod v1 {
    tonic::include_proto!("driftlog.v1");
}

pub use v1::{
    log_client::LogClient, log_server, ConsumeRequest, ConsumeResponse, GetServersRequest,
    GetServersResponse, ProduceRequest, ProduceResponse, Record, Server,
};
