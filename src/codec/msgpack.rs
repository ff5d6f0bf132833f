//! MsgPack body codec using `rmp-serde`.
//!
//! Always uses `to_vec_named` so structs serialize as maps with field
//! names; positional arrays are not portable across the language boundary.

use bytes::Bytes;
use serde_json::Value;

use super::{BodyCodec, Invocation};
use crate::error::Result;

/// Self-describing MessagePack codec for invocation bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackBodyCodec;

impl BodyCodec for MsgPackBodyCodec {
    fn encode_invocation(&self, invocation: &Invocation) -> Result<Bytes> {
        // to_vec_named, not to_vec: struct-as-map format.
        let bytes = rmp_serde::to_vec_named(invocation)?;
        Ok(Bytes::from(bytes))
    }

    fn decode_value(&self, body: &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_slice(body)?)
    }
}
