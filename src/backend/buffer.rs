//! Backend buffers and buffer types.
//!
//! A buffer type describes a memory domain and can allocate buffers; a
//! buffer owns a contiguous region of device memory and exposes per-tensor
//! data access through a capability record. Two buffers of the same buffer
//! type can host each other's tensors.

use crate::error::Result;
use crate::tensor::Tensor;
use crate::types::Status;
use std::cell::Cell;
use std::fmt;
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;

/// What the contents of a buffer are used for. The scheduler keys the
/// weight-driven split and the expert-selective copy on `Weights`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Any,
    Weights,
    Compute,
}

/// Factory and capability object for one memory domain.
pub trait BufferTypeImpl: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocates a buffer of this type.
    fn alloc_buffer(&self, buft: &BufferType, size: usize) -> Result<Buffer>;

    /// Tensor alignment, a power of two.
    fn alignment(&self) -> usize;

    /// Max buffer size that can be allocated.
    fn max_size(&self) -> usize {
        usize::MAX
    }

    /// Data size needed to allocate the tensor, including device padding.
    fn alloc_size(&self, tensor: &Tensor) -> usize {
        tensor.nbytes()
    }

    /// Whether tensor data is in host memory.
    fn is_host(&self) -> bool;
}

/// Cheap handle to a buffer type. Equality is pointer equality: it is the
/// unit of "same memory domain".
#[derive(Clone)]
pub struct BufferType(Arc<dyn BufferTypeImpl>);

impl BufferType {
    pub fn new(iface: Arc<dyn BufferTypeImpl>) -> BufferType {
        BufferType(iface)
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn alloc_buffer(&self, size: usize) -> Result<Buffer> {
        self.0.alloc_buffer(self, size)
    }

    pub fn alignment(&self) -> usize {
        let align = self.0.alignment();
        debug_assert!(align.is_power_of_two());
        align
    }

    pub fn max_size(&self) -> usize {
        self.0.max_size()
    }

    pub fn alloc_size(&self, tensor: &Tensor) -> usize {
        let size = self.0.alloc_size(tensor);
        debug_assert!(size >= tensor.nbytes());
        size
    }

    pub fn is_host(&self) -> bool {
        self.0.is_host()
    }
}

impl PartialEq for BufferType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for BufferType {}

impl fmt::Debug for BufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferType({})", self.name())
    }
}

/// Device-specific operations of one buffer.
pub trait BufferImpl {
    /// Base address; valid for the lifetime of the buffer. Null only for
    /// size-zero and composite buffers.
    fn base(&self) -> *mut u8;

    /// Optional per-tensor hook, e.g. to register side data.
    fn init_tensor(&self, _tensor: &Tensor) -> Status {
        Status::Success
    }

    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize);

    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize);

    /// Optional; returns false when unsupported.
    fn memset_tensor(&self, _tensor: &Tensor, _value: u8, _offset: usize, _size: usize) -> bool {
        false
    }

    /// Optional fast path: dst is in this buffer, src may be anywhere.
    /// Returns false when unsupported.
    fn cpy_tensor(&self, _src: &Tensor, _dst: &Tensor) -> bool {
        false
    }

    fn clear(&self, size: usize, value: u8);

    /// Optional: drop any state built up by `init_tensor`.
    fn reset(&self) {}

    /// Sub-buffers of a composite buffer.
    fn parts(&self) -> Option<&[Buffer]> {
        None
    }
}

struct BufferInner {
    buft: BufferType,
    iface: Box<dyn BufferImpl>,
    size: usize,
    usage: Cell<BufferUsage>,
}

/// Cheap handle to a backend buffer; equality is identity.
#[derive(Clone)]
pub struct Buffer(Rc<BufferInner>);

impl Buffer {
    pub fn new(buft: BufferType, iface: Box<dyn BufferImpl>, size: usize) -> Buffer {
        Buffer(Rc::new(BufferInner { buft, iface, size, usage: Cell::new(BufferUsage::Any) }))
    }

    /// Composite buffer wrapping several sub-buffers. It has no base pointer
    /// and no per-tensor operations; `clear` broadcasts.
    pub fn multi(buffers: Vec<Buffer>) -> Buffer {
        let size = buffers.iter().map(|b| b.size()).sum();
        let buft = buffers
            .first()
            .map(|b| b.buft())
            .expect("multi buffer requires at least one sub-buffer");
        Buffer::new(buft, Box::new(MultiBuffer { buffers }), size)
    }

    pub fn name(&self) -> &'static str {
        self.0.buft.name()
    }

    pub fn buft(&self) -> BufferType {
        self.0.buft.clone()
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn base(&self) -> *mut u8 {
        if self.0.size == 0 {
            return ptr::null_mut();
        }
        let base = self.0.iface.base();
        debug_assert!(!base.is_null());
        base
    }

    pub fn usage(&self) -> BufferUsage {
        self.0.usage.get()
    }

    pub fn set_usage(&self, usage: BufferUsage) {
        self.0.usage.set(usage);
        // composite buffers push the usage down to their parts
        if let Some(parts) = self.0.iface.parts() {
            for part in parts {
                part.set_usage(usage);
            }
        }
    }

    pub fn is_host(&self) -> bool {
        self.0.buft.is_host()
    }

    pub fn alloc_size(&self, tensor: &Tensor) -> usize {
        self.0.buft.alloc_size(tensor)
    }

    pub fn init_tensor(&self, tensor: &Tensor) -> Status {
        self.0.iface.init_tensor(tensor)
    }

    pub fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) {
        assert!(offset + data.len() <= tensor.nbytes(), "tensor write out of bounds");
        self.0.iface.set_tensor(tensor, data, offset);
    }

    pub fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) {
        assert!(offset + data.len() <= tensor.nbytes(), "tensor read out of bounds");
        self.0.iface.get_tensor(tensor, data, offset);
    }

    pub fn memset_tensor(&self, tensor: &Tensor, value: u8, offset: usize, size: usize) -> bool {
        assert!(offset + size <= tensor.nbytes(), "tensor memset out of bounds");
        self.0.iface.memset_tensor(tensor, value, offset, size)
    }

    pub fn cpy_tensor(&self, src: &Tensor, dst: &Tensor) -> bool {
        self.0.iface.cpy_tensor(src, dst)
    }

    pub fn clear(&self, value: u8) {
        self.0.iface.clear(self.0.size, value);
    }

    pub fn reset(&self) {
        self.0.iface.reset();
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({}, {} bytes, {:?})", self.name(), self.size(), self.usage())
    }
}

struct MultiBuffer {
    buffers: Vec<Buffer>,
}

impl BufferImpl for MultiBuffer {
    fn base(&self) -> *mut u8 {
        panic!("multi buffer has no base pointer");
    }

    fn set_tensor(&self, _tensor: &Tensor, _data: &[u8], _offset: usize) {
        panic!("multi buffer has no tensor operations");
    }

    fn get_tensor(&self, _tensor: &Tensor, _data: &mut [u8], _offset: usize) {
        panic!("multi buffer has no tensor operations");
    }

    fn clear(&self, _size: usize, value: u8) {
        for b in &self.buffers {
            b.clear(value);
        }
    }

    fn parts(&self) -> Option<&[Buffer]> {
        Some(&self.buffers)
    }
}

// ---------------------------------------------------------------------------
// tensor data utilities
// ---------------------------------------------------------------------------

/// Writes `data.len()` bytes into `tensor` starting at byte `offset`.
pub fn tensor_set(tensor: &Tensor, data: &[u8], offset: usize) {
    let buffer = tensor.buffer().expect("tensor is not allocated");
    assert!(!tensor.data().is_null(), "tensor is not allocated");
    buffer.set_tensor(tensor, data, offset);
}

/// Reads `data.len()` bytes from `tensor` starting at byte `offset`.
pub fn tensor_get(tensor: &Tensor, data: &mut [u8], offset: usize) {
    let buffer = tensor.buffer().expect("tensor is not allocated");
    assert!(!tensor.data().is_null(), "tensor is not allocated");
    buffer.get_tensor(tensor, data, offset);
}

/// Blocking copy between two allocated tensors with the same layout. Tries
/// the destination buffer's fast path, then host paths, then a bounce
/// buffer.
pub fn tensor_copy(src: &Tensor, dst: &Tensor) {
    if src == dst {
        return;
    }
    assert!(
        crate::tensor::are_same_layout(src, dst),
        "cannot copy tensors with different layouts"
    );

    let src_buf = src.buffer().expect("src is not allocated");
    let dst_buf = dst.buffer().expect("dst is not allocated");

    let nbytes = src.nbytes();
    if src_buf.is_host() {
        let bytes = unsafe { std::slice::from_raw_parts(src.data(), nbytes) };
        tensor_set(dst, bytes, 0);
    } else if dst_buf.is_host() {
        let out = unsafe { std::slice::from_raw_parts_mut(dst.data(), nbytes) };
        tensor_get(src, out, 0);
    } else if !dst_buf.cpy_tensor(src, dst) {
        let mut bounce = vec![0u8; nbytes];
        tensor_get(src, &mut bounce, 0);
        tensor_set(dst, &bounce, 0);
    }
}

/// Places an unallocated non-view tensor at `addr` inside `buffer` and runs
/// the buffer's init hook.
pub fn tensor_alloc(buffer: &Buffer, tensor: &Tensor, addr: *mut u8) -> Status {
    assert!(tensor.buffer().is_none() && tensor.data().is_null());
    assert!(tensor.view_src().is_none());
    let base = buffer.base() as usize;
    assert!(addr as usize >= base);
    assert!(addr as usize + buffer.alloc_size(tensor) <= base + buffer.size());

    tensor.set_buffer(Some(buffer.clone()));
    tensor.set_data(addr);
    buffer.init_tensor(tensor)
}

/// Initializes a view tensor from its (already allocated) view source.
pub fn view_init(tensor: &Tensor) -> Status {
    let vs = tensor.view_src().expect("tensor is not a view");
    let buffer = vs.buffer().expect("view source is not allocated");
    assert!(!vs.data().is_null());

    tensor.set_buffer(Some(buffer.clone()));
    tensor.set_data(unsafe { vs.data().add(tensor.view_offs()) });
    buffer.init_tensor(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::cpu_buffer_type;
    use crate::tensor::Tensor;
    use crate::types::TensorType;

    #[test]
    fn test_buffer_type_identity() {
        let a = cpu_buffer_type();
        let b = cpu_buffer_type();
        assert_eq!(a, b);
        assert!(a.is_host());
        assert!(a.alignment().is_power_of_two());
    }

    #[test]
    fn test_set_get_roundtrip() {
        let buft = cpu_buffer_type();
        let buffer = buft.alloc_buffer(1024).unwrap();
        let t = Tensor::new(TensorType::F32, &[8]);
        assert_eq!(tensor_alloc(&buffer, &t, buffer.base()), Status::Success);

        let values: Vec<u8> = (0..32).collect();
        tensor_set(&t, &values, 0);
        let mut out = vec![0u8; 32];
        tensor_get(&t, &mut out, 0);
        assert_eq!(values, out);
    }

    #[test]
    fn test_tensor_copy_host_to_host() {
        let buft = cpu_buffer_type();
        let buffer = buft.alloc_buffer(1024).unwrap();
        let a = Tensor::new(TensorType::F32, &[8]);
        let b = Tensor::new(TensorType::F32, &[8]);
        tensor_alloc(&buffer, &a, buffer.base());
        tensor_alloc(&buffer, &b, unsafe { buffer.base().add(64) });

        let values: Vec<u8> = (100..132).collect();
        tensor_set(&a, &values, 0);
        tensor_copy(&a, &b);
        let mut out = vec![0u8; 32];
        tensor_get(&b, &mut out, 0);
        assert_eq!(values, out);
    }

    #[test]
    fn test_view_init() {
        let buft = cpu_buffer_type();
        let buffer = buft.alloc_buffer(1024).unwrap();
        let base = Tensor::new(TensorType::F32, &[16]);
        tensor_alloc(&buffer, &base, buffer.base());

        let v = crate::tensor::view_1d(&base, 8, 32);
        assert_eq!(view_init(&v), Status::Success);
        assert_eq!(v.buffer().unwrap(), buffer);
        assert_eq!(v.data() as usize, base.data() as usize + 32);
    }

    #[test]
    fn test_multi_buffer_clear_broadcasts() {
        let buft = cpu_buffer_type();
        let b1 = buft.alloc_buffer(64).unwrap();
        let b2 = buft.alloc_buffer(64).unwrap();
        let multi = Buffer::multi(vec![b1.clone(), b2.clone()]);
        assert_eq!(multi.size(), 128);

        multi.clear(0xAB);
        unsafe {
            assert_eq!(*b1.base(), 0xAB);
            assert_eq!(*b2.base(), 0xAB);
        }
    }

    #[test]
    fn test_usage_tag() {
        let buft = cpu_buffer_type();
        let b = buft.alloc_buffer(64).unwrap();
        assert_eq!(b.usage(), BufferUsage::Any);
        b.set_usage(BufferUsage::Weights);
        assert_eq!(b.usage(), BufferUsage::Weights);
    }
}
