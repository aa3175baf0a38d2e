//! Preconstructed factories.

use std::fmt::Debug;

use datagate_core::listener::{AcceptedAddr, AcceptedStream};
use datagate_services::{
    common::CatchPanicService, dispatch::Dispatcher, transport::ConnectionService,
};
use service_async::{stack::FactoryStack, MakeService, Service};

use crate::config::ServerConfig;

/// Create the per-connection service factory every I/O thread builds its stack from.
pub fn connection_factory(
    config: ServerConfig,
    dispatcher: Dispatcher,
) -> impl MakeService<
    Service = impl Service<(AcceptedStream, AcceptedAddr), Error = impl Debug>,
    Error = impl Debug,
> {
    FactoryStack::new(config)
        .replace(dispatcher)
        .push(ConnectionService::layer())
        .push(CatchPanicService::layer())
        .into_inner()
}
