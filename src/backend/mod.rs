pub mod backend;
pub mod buffer;
pub mod registry;

#[cfg(feature = "cpu")]
pub mod cpu;

pub use backend::{Backend, BackendImpl, Device, DeviceImpl, DeviceType, Event, EventImpl};
pub use buffer::{Buffer, BufferImpl, BufferType, BufferTypeImpl, BufferUsage};
