//! Wire messages and the frame codec.
//!
//! Wire format: 4 bytes big-endian length, then that many bytes of JSON.
//! Requests are `{v, name, args, kwargs}`; replies are `{v, rv, msgbody,
//! ...fields}` with handler-specific fields flattened into the top level.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RpcError;


pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

pub const RV_OK: i64 = 0;
pub const RV_FAILED: i64 = 1;
pub const RV_BAD_REQUEST: i64 = 2;
/// Default return code, left in place when no handler ran.
pub const RV_UNSET: i64 = 9;


fn protocol_version() -> u32 {
    PROTOCOL_VERSION
}


// ---------------------------------------------------------------------------
// RpcMessage
// ---------------------------------------------------------------------------

/// A named remote call with positional and keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default = "protocol_version")]
    pub v: u32,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}


impl RpcMessage {
    pub fn new(name: &str) -> RpcMessage {
        RpcMessage {
            v: PROTOCOL_VERSION,
            name: name.to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> RpcMessage {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> RpcMessage {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    /// Keyword argument as a string, if present and a string.
    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }

    /// Decode a keyword argument into a typed value.
    pub fn kwarg_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, String> {
        match self.kwargs.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| format!("bad '{}' argument: {}", key, e)),
        }
    }
}


// ---------------------------------------------------------------------------
// RpcReply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default = "protocol_version")]
    pub v: u32,
    pub rv: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msgbody: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}


impl Default for RpcReply {
    fn default() -> Self {
        RpcReply::unset()
    }
}


impl RpcReply {
    /// A reply no handler has touched yet.
    pub fn unset() -> RpcReply {
        RpcReply {
            v: PROTOCOL_VERSION,
            rv: RV_UNSET,
            msgbody: None,
            fields: Map::new(),
        }
    }

    pub fn ok() -> RpcReply {
        RpcReply {
            rv: RV_OK,
            ..RpcReply::unset()
        }
    }

    pub fn with_code(rv: i64, msgbody: &str) -> RpcReply {
        RpcReply {
            rv,
            msgbody: Some(msgbody.to_string()),
            ..RpcReply::unset()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.rv == RV_OK
    }

    /// Mark the reply successful with a message body.
    pub fn succeed(&mut self, msgbody: impl Into<String>) {
        self.rv = RV_OK;
        self.msgbody = Some(msgbody.into());
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.fields
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}


// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Write one length-prefixed JSON frame.
pub fn write_frame<W: Write, T: Serialize>(stream: &mut W, value: &T) -> Result<(), RpcError> {
    let json = serde_json::to_vec(value)?;
    if json.len() > MAX_FRAME {
        return Err(RpcError::Frame(format!("frame too large: {} bytes", json.len())));
    }
    let len = json.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&json)?;
    stream.flush()?;
    Ok(())
}


/// Read one length-prefixed frame and return its raw payload.
pub fn read_frame_bytes<R: Read>(stream: &mut R) -> Result<Vec<u8>, RpcError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(RpcError::Frame("empty frame".into()));
    }
    if len > MAX_FRAME {
        return Err(RpcError::Frame(format!("frame too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}


/// Read one length-prefixed frame and decode it.
pub fn read_frame<R: Read, T: DeserializeOwned>(stream: &mut R) -> Result<T, RpcError> {
    let payload = read_frame_bytes(stream)?;
    Ok(serde_json::from_slice(&payload)?)
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
