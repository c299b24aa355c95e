//! Request/reply query protocol layered on a daemon's listening socket.

pub mod client;
pub mod message;
pub mod query;
pub mod service;

pub use client::QueryInterface;
pub use message::{RpcMessage, RpcReply};
pub use query::{QueryStats, QueryTable, Session};
