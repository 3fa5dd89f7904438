pub mod builders;
pub mod client;
pub mod info;

pub use builders::{
    block_id_for, commit_block_list_request, get_range_request, probe_request, put_block_request,
    ProbeResult,
};
pub use client::{ByteStream, ReqwestTransport, ResponsePayload, StreamingResponse};
pub use info::{RequestBody, RequestInfo};
