//! Request records: capture-side builders, read-side leases, and the
//! length-prefixed frame codec that puts them on disk.

pub mod codec;
pub mod pool;
pub mod request;

pub use codec::{
    get_next_request, read_full, save_request, ReadOutcome, LENGTH_PREFIX_LEN,
    TAIL_FOLLOW_MAX_RETRIES,
};
pub use pool::BytePool;
pub use request::{
    raw_header_block, MarshalledRequest, RequestFrame, UnmarshalledRequest, ORIGINAL_URI_HEADER,
    REQUEST_ID_HEADER,
};
