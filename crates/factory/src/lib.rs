//! Container lifecycle management for disposable browser sessions.
//!
//! The [`ContainerFactory`] is the only component allowed to create and
//! destroy containers on the runtime. Every container it starts carries a
//! fixed identification label pair so that [`factory::scrub_containers`] can
//! clean up after crashed processes without consulting any in-memory state.
//!
//! Readiness is deliberately separate from creation: [`ContainerFactory::create`]
//! returns as soon as the runtime reports the container running, and
//! [`ContainerFactory::await_ready`] polls a caller-supplied [`ReadyProbe`]
//! until the service inside is actually reachable. This lets callers overlap
//! container boot time with other setup and use different readiness semantics
//! per service type.

pub mod engine;
pub mod error;
pub mod factory;
pub mod probe;
pub mod record;

pub use {
    engine::EngineEndpoint,
    error::FactoryError,
    factory::ContainerFactory,
    probe::{ReadyProbe, TcpProbe},
    record::{ContainerRecord, ContainerRole, ContainerSpec, ContainerStatus, Endpoint},
};
