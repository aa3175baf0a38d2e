//! Payload codec used for arguments, results and exception bodies.
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::{error::WireError, RpcError};

pub type Value = serde_json::Value;
pub type Args = Vec<Value>;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected {expected} argument(s), got {got}")]
    ArgCount { expected: usize, got: usize },
}

impl From<CodecError> for RpcError {
    fn from(value: CodecError) -> Self {
        RpcError::invalid_arguments(value.to_string())
    }
}

/// Turns invocation arguments and results into payload bytes and back.
pub trait Codec: Send + Sync + 'static {
    fn encode_args(&self, args: &[Value]) -> Result<Bytes, CodecError>;
    /// Decode a request payload holding exactly `expected` arguments.
    fn decode_args(&self, payload: &[u8], expected: usize) -> Result<Args, CodecError>;
    fn encode_value(&self, value: &Value) -> Result<Bytes, CodecError>;
    fn decode_value(&self, payload: &[u8]) -> Result<Value, CodecError>;

    fn encode_error(&self, error: &WireError) -> Result<Bytes, CodecError> {
        let value = serde_json::to_value(error)?;
        self.encode_value(&value)
    }

    fn decode_error(&self, payload: &[u8]) -> Result<WireError, CodecError> {
        let value = self.decode_value(payload)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Arguments travel as one JSON array, a result as a single JSON value.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_args(&self, args: &[Value]) -> Result<Bytes, CodecError> {
        Ok(serde_json::to_vec(args)?.into())
    }

    fn decode_args(&self, payload: &[u8], expected: usize) -> Result<Args, CodecError> {
        // an empty payload is an empty argument list
        let args: Args = if payload.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(payload)?
        };
        if args.len() != expected {
            return Err(CodecError::ArgCount {
                expected,
                got: args.len(),
            });
        }
        Ok(args)
    }

    fn encode_value(&self, value: &Value) -> Result<Bytes, CodecError> {
        Ok(serde_json::to_vec(value)?.into())
    }

    fn decode_value(&self, payload: &[u8]) -> Result<Value, CodecError> {
        if payload.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Convert a handler argument into a typed value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::invalid_arguments(e.to_string()))
}

/// Convert a handler result into a [`Value`]. Failure here is a server bug.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}
