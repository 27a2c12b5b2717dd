//! Backend, device and event interfaces.
//!
//! A device describes a piece of hardware and answers capability queries; a
//! backend is an initialized device with a command queue that can execute
//! subgraphs. Both are trait objects behind cheap cloneable handles, with
//! identity equality.

use crate::backend::buffer::{self, BufferType};
use crate::tensor::{Graph, Tensor};
use crate::types::Status;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accel,
}

pub trait DeviceImpl: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> String;

    fn device_type(&self) -> DeviceType;

    /// (free, total) memory in bytes.
    fn memory(&self) -> (usize, usize);

    /// The device's preferred buffer type.
    fn buffer_type(&self) -> BufferType;

    /// Pinned host memory addressable by the device, if any.
    fn host_buffer_type(&self) -> Option<BufferType> {
        None
    }

    fn init_backend(&self, device: &Device) -> Backend;

    fn supports_op(&self, op: &Tensor) -> bool;

    fn supports_buft(&self, buft: &BufferType) -> bool;

    /// Whether running `op` here is worth the transfer cost even though its
    /// weights live on another device.
    fn offload_op(&self, _op: &Tensor) -> bool {
        false
    }

    /// Synchronisation primitive; `None` if the device has none (callers
    /// fall back to full backend synchronisation).
    fn event_new(&self, _device: &Device) -> Option<Event> {
        None
    }
}

#[derive(Clone)]
pub struct Device(Arc<dyn DeviceImpl>);

impl Device {
    pub fn new(iface: Arc<dyn DeviceImpl>) -> Device {
        Device(iface)
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn description(&self) -> String {
        self.0.description()
    }

    pub fn device_type(&self) -> DeviceType {
        self.0.device_type()
    }

    pub fn memory(&self) -> (usize, usize) {
        self.0.memory()
    }

    pub fn buffer_type(&self) -> BufferType {
        self.0.buffer_type()
    }

    pub fn host_buffer_type(&self) -> Option<BufferType> {
        self.0.host_buffer_type()
    }

    pub fn init_backend(&self) -> Backend {
        self.0.init_backend(self)
    }

    pub fn supports_op(&self, op: &Tensor) -> bool {
        self.0.supports_op(op)
    }

    pub fn supports_buft(&self, buft: &BufferType) -> bool {
        self.0.supports_buft(buft)
    }

    pub fn offload_op(&self, op: &Tensor) -> bool {
        self.0.offload_op(op)
    }

    pub fn event_new(&self) -> Option<Event> {
        self.0.event_new(self)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({}, {:?})", self.name(), self.device_type())
    }
}

/// A synchronisation point that can be recorded on one backend's queue and
/// waited on by another.
pub trait EventImpl {
    /// Records the event on the backend's queue.
    fn record(&self, backend: &Backend);

    /// Makes the backend's future work wait for the event; does not block
    /// the host.
    fn wait(&self, backend: &Backend);

    /// Blocks the host until the event is signalled.
    fn synchronize(&self);
}

#[derive(Clone)]
pub struct Event(Rc<dyn EventImpl>);

impl Event {
    pub fn new(iface: Rc<dyn EventImpl>) -> Event {
        Event(iface)
    }

    pub fn record(&self, backend: &Backend) {
        self.0.record(backend);
    }

    pub fn wait(&self, backend: &Backend) {
        self.0.wait(backend);
    }

    pub fn synchronize(&self) {
        self.0.synchronize();
    }
}

pub trait BackendImpl {
    fn name(&self) -> &'static str;

    fn device(&self) -> Device;

    /// Asynchronous tensor data access; the defaults degrade to the
    /// blocking buffer paths.
    fn set_tensor_async(&self, tensor: &Tensor, data: &[u8], offset: usize) {
        buffer::tensor_set(tensor, data, offset);
    }

    fn get_tensor_async(&self, tensor: &Tensor, data: &mut [u8], offset: usize) {
        buffer::tensor_get(tensor, data, offset);
    }

    /// Asynchronous copy with `dst` on this backend and `src` on
    /// `backend_src`; returns false when unsupported.
    fn cpy_tensor_async(&self, _backend_src: &Backend, _src: &Tensor, _dst: &Tensor) -> bool {
        false
    }

    /// Completes all pending operations.
    fn synchronize(&self) {}

    /// Submits a subgraph for execution. May return before the work
    /// retires; callers that need the results must synchronize.
    fn graph_compute(&self, graph: &Graph) -> Status;

    /// Optional reorder of a node range to improve concurrency.
    fn graph_optimize(&self, _nodes: &mut [Tensor]) {}
}

#[derive(Clone)]
pub struct Backend(Rc<dyn BackendImpl>);

impl Backend {
    pub fn new(iface: Rc<dyn BackendImpl>) -> Backend {
        Backend(iface)
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn device(&self) -> Device {
        self.0.device()
    }

    pub fn buffer_type(&self) -> BufferType {
        self.device().buffer_type()
    }

    pub fn supports_op(&self, op: &Tensor) -> bool {
        self.device().supports_op(op)
    }

    pub fn supports_buft(&self, buft: &BufferType) -> bool {
        self.device().supports_buft(buft)
    }

    pub fn offload_op(&self, op: &Tensor) -> bool {
        self.device().offload_op(op)
    }

    pub fn set_tensor_async(&self, tensor: &Tensor, data: &[u8], offset: usize) {
        self.0.set_tensor_async(tensor, data, offset);
    }

    pub fn get_tensor_async(&self, tensor: &Tensor, data: &mut [u8], offset: usize) {
        self.0.get_tensor_async(tensor, data, offset);
    }

    /// Tries to copy `src` (on `backend_src`) into `dst` (on this backend)
    /// without blocking; returns false when no async path exists.
    pub fn cpy_tensor_async_from(&self, backend_src: &Backend, src: &Tensor, dst: &Tensor) -> bool {
        self.0.cpy_tensor_async(backend_src, src, dst)
    }

    pub fn synchronize(&self) {
        self.0.synchronize();
    }

    pub fn graph_compute(&self, graph: &Graph) -> Status {
        self.0.graph_compute(graph)
    }

    pub fn graph_optimize(&self, nodes: &mut [Tensor]) {
        self.0.graph_optimize(nodes);
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Backend {}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend({})", self.name())
    }
}
