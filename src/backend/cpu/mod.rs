//! CPU device, backend and buffers.
//!
//! The CPU backend executes subgraphs synchronously with the reference
//! kernels in [`ops`]. Its buffers are plain aligned heap allocations, so
//! `is_host` is true and every other backend can read them directly.

pub(crate) mod ops;

use crate::backend::backend::{Backend, BackendImpl, Device, DeviceImpl, DeviceType};
use crate::backend::buffer::{Buffer, BufferImpl, BufferType, BufferTypeImpl};
use crate::error::{Error, Result};
use crate::tensor::{Graph, Tensor, TENSOR_ALIGNMENT};
use crate::types::Status;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

const CPU_MEM_ALIGN: usize = 64;

struct CpuBuffer {
    ptr: *mut u8,
    size: usize,
}

impl CpuBuffer {
    fn alloc(size: usize) -> Result<CpuBuffer> {
        let layout = Layout::from_size_align(size.max(1), CPU_MEM_ALIGN)
            .map_err(|_| Error::msg("invalid buffer layout"))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::msg(format!("failed to allocate CPU buffer of {size} bytes")));
        }
        Ok(CpuBuffer { ptr, size: size.max(1) })
    }
}

impl Drop for CpuBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, CPU_MEM_ALIGN).unwrap();
        unsafe { dealloc(self.ptr, layout) };
    }
}

impl BufferImpl for CpuBuffer {
    fn base(&self) -> *mut u8 {
        self.ptr
    }

    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) {
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), tensor.data().add(offset), data.len());
        }
    }

    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) {
        unsafe {
            std::ptr::copy_nonoverlapping(tensor.data().add(offset), data.as_mut_ptr(), data.len());
        }
    }

    fn memset_tensor(&self, tensor: &Tensor, value: u8, offset: usize, size: usize) -> bool {
        unsafe {
            std::ptr::write_bytes(tensor.data().add(offset), value, size);
        }
        true
    }

    fn cpy_tensor(&self, src: &Tensor, dst: &Tensor) -> bool {
        // dst is in this buffer; supported whenever src bytes are host-visible
        match src.buffer() {
            Some(buf) if buf.is_host() => {
                unsafe {
                    std::ptr::copy_nonoverlapping(src.data(), dst.data(), src.nbytes());
                }
                true
            }
            _ => false,
        }
    }

    fn clear(&self, size: usize, value: u8) {
        unsafe {
            std::ptr::write_bytes(self.ptr, value, size);
        }
    }
}

struct CpuBufferType;

impl BufferTypeImpl for CpuBufferType {
    fn name(&self) -> &'static str {
        "CPU"
    }

    fn alloc_buffer(&self, buft: &BufferType, size: usize) -> Result<Buffer> {
        let inner = CpuBuffer::alloc(size)?;
        Ok(Buffer::new(buft.clone(), Box::new(inner), size))
    }

    fn alignment(&self) -> usize {
        TENSOR_ALIGNMENT
    }

    fn is_host(&self) -> bool {
        true
    }
}

/// The CPU buffer type singleton.
pub fn cpu_buffer_type() -> BufferType {
    static BUFT: OnceLock<BufferType> = OnceLock::new();
    BUFT.get_or_init(|| BufferType::new(Arc::new(CpuBufferType))).clone()
}

struct CpuDevice;

impl DeviceImpl for CpuDevice {
    fn name(&self) -> &'static str {
        "CPU"
    }

    fn description(&self) -> String {
        "CPU reference backend".to_string()
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn memory(&self) -> (usize, usize) {
        // host memory is not tracked
        (0, 0)
    }

    fn buffer_type(&self) -> BufferType {
        cpu_buffer_type()
    }

    fn init_backend(&self, device: &Device) -> Backend {
        Backend::new(Rc::new(CpuBackend { device: device.clone() }))
    }

    fn supports_op(&self, _op: &Tensor) -> bool {
        // the CPU is the universal fallback; type coverage is checked at
        // compute time by the reference kernels
        true
    }

    fn supports_buft(&self, buft: &BufferType) -> bool {
        buft.is_host()
    }
}

/// The CPU device singleton.
pub fn cpu_device() -> Device {
    static DEVICE: OnceLock<Device> = OnceLock::new();
    DEVICE.get_or_init(|| Device::new(Arc::new(CpuDevice))).clone()
}

/// Initializes a fresh CPU backend instance.
pub fn cpu_backend() -> Backend {
    cpu_device().init_backend()
}

struct CpuBackend {
    device: Device,
}

impl BackendImpl for CpuBackend {
    fn name(&self) -> &'static str {
        "CPU"
    }

    fn device(&self) -> Device {
        self.device.clone()
    }

    fn graph_compute(&self, graph: &Graph) -> Status {
        ops::compute_graph(graph)
    }

    fn graph_optimize(&self, nodes: &mut [Tensor]) {
        crate::optimize::graph_optimize(nodes);
    }
}
