//! Connection-level services of the datagate transport: the wire protocol and handshake, request
//! dispatch onto the worker pool, the logon service and role based authorization.
pub mod authz;
pub mod common;
pub mod dispatch;
pub mod logon;
pub mod pending;
pub mod registry;
pub mod transport;
