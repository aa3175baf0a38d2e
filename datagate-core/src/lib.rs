mod error;
pub use error::{AnyError, AnyResult, ErrorKind, RpcError, WireError, COMPONENT_FAILURE};

pub mod auth;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod listener;
pub mod orchestrator;
pub mod service;
pub mod session;
pub mod util;
