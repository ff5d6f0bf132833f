//! Protocol types: wire format and frames.

mod frame;
mod wire_format;

pub use frame::{build_request_frame, build_response_frame};
pub use wire_format::{flags, status, Header, HEADER_SIZE, MAGIC};
