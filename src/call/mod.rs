//! Call lifecycle: the one place that knows whether a call is up

pub mod manager;

pub use manager::{
    CallDirection, CallInfo, CallManager, CallStatus, DeviceSessionFactory, MemorySessionFactory,
    SessionFactory,
};
