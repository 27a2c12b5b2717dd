//! Tensor handles and computation graphs.
//!
//! A [`Tensor`] is a cheap cloneable handle (`Rc<RefCell<..>>`) with a
//! process-unique identity; graphs link tensors through `src` and `view_src`
//! handles. Storage (`buffer` + `data`) stays unset until an allocator
//! places the tensor inside a backend buffer.

use crate::backend::buffer::Buffer;
use crate::types::{self, Op, TensorType, UnaryOp};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::fmt;
use std::ptr;
use std::rc::Rc;

pub const MAX_DIMS: usize = 4;
pub const MAX_SRC: usize = 10;
pub const MAX_OP_PARAMS: usize = 16;
pub const TENSOR_ALIGNMENT: usize = 32;

/// User-settable tensor flags.
pub mod flags {
    /// Graph input: assigned to the lowest-priority backend and never
    /// overwritten by storage reuse.
    pub const INPUT: u32 = 1 << 0;
    /// Graph output: its storage is never recycled.
    pub const OUTPUT: u32 = 1 << 1;
}

/// Unique identifier for tensors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn new() -> Self {
        use std::sync::atomic;
        static COUNTER: atomic::AtomicU64 = atomic::AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, atomic::Ordering::Relaxed))
    }
}

pub struct TensorData {
    pub ttype: TensorType,
    pub ne: [i64; MAX_DIMS],
    pub nb: [usize; MAX_DIMS],
    pub op: Op,
    pub op_params: [i32; MAX_OP_PARAMS],
    pub flags: u32,
    pub src: [Option<Tensor>; MAX_SRC],
    pub view_src: Option<Tensor>,
    pub view_offs: usize,
    pub buffer: Option<Buffer>,
    pub data: *mut u8,
    pub name: String,
}

/// Shared tensor handle. Equality and hashing go through the tensor id, so a
/// clone is the same tensor.
#[derive(Clone)]
pub struct Tensor {
    id: TensorId,
    inner: Rc<RefCell<TensorData>>,
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Tensor {}

impl std::hash::Hash for Tensor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.inner.borrow();
        write!(f, "Tensor({:?} '{}' {:?} ne={:?})", self.id, d.name, d.op, d.ne)
    }
}

impl Tensor {
    /// Creates a new contiguous tensor with no storage and `Op::None`.
    pub fn new(ttype: TensorType, ne: &[i64]) -> Tensor {
        assert!(!ne.is_empty() && ne.len() <= MAX_DIMS);

        let mut ne4 = [1i64; MAX_DIMS];
        ne4[..ne.len()].copy_from_slice(ne);

        let mut nb = [0usize; MAX_DIMS];
        nb[0] = types::type_size(ttype);
        nb[1] = nb[0] * (ne4[0] as usize / types::block_size(ttype));
        for i in 2..MAX_DIMS {
            nb[i] = nb[i - 1] * ne4[i - 1] as usize;
        }

        Tensor {
            id: TensorId::new(),
            inner: Rc::new(RefCell::new(TensorData {
                ttype,
                ne: ne4,
                nb,
                op: Op::None,
                op_params: [0; MAX_OP_PARAMS],
                flags: 0,
                src: std::array::from_fn(|_| None),
                view_src: None,
                view_offs: 0,
                buffer: None,
                data: ptr::null_mut(),
                name: String::new(),
            })),
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub(crate) fn borrow(&self) -> Ref<'_, TensorData> {
        self.inner.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, TensorData> {
        self.inner.borrow_mut()
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) -> &Tensor {
        self.inner.borrow_mut().name = name.into();
        self
    }

    pub fn ttype(&self) -> TensorType {
        self.inner.borrow().ttype
    }

    pub fn ne(&self) -> [i64; MAX_DIMS] {
        self.inner.borrow().ne
    }

    pub fn nb(&self) -> [usize; MAX_DIMS] {
        self.inner.borrow().nb
    }

    pub fn op(&self) -> Op {
        self.inner.borrow().op
    }

    pub fn op_param_i32(&self, i: usize) -> i32 {
        self.inner.borrow().op_params[i]
    }

    pub fn op_param_f32(&self, i: usize) -> f32 {
        f32::from_bits(self.inner.borrow().op_params[i] as u32)
    }

    pub fn flags(&self) -> u32 {
        self.inner.borrow().flags
    }

    /// Marks the tensor as a graph input.
    pub fn set_input(&self) -> &Tensor {
        self.inner.borrow_mut().flags |= flags::INPUT;
        self
    }

    /// Marks the tensor as a graph output, exempting it from storage reuse.
    pub fn set_output(&self) -> &Tensor {
        self.inner.borrow_mut().flags |= flags::OUTPUT;
        self
    }

    pub fn src(&self, i: usize) -> Option<Tensor> {
        self.inner.borrow().src[i].clone()
    }

    pub fn set_src(&self, i: usize, src: Option<Tensor>) {
        self.inner.borrow_mut().src[i] = src;
    }

    /// Source handles in slot order, stopping at the first empty slot.
    pub fn srcs(&self) -> Vec<Tensor> {
        let d = self.inner.borrow();
        let mut out = Vec::new();
        for s in d.src.iter() {
            match s {
                Some(t) => out.push(t.clone()),
                None => break,
            }
        }
        out
    }

    pub fn view_src(&self) -> Option<Tensor> {
        self.inner.borrow().view_src.clone()
    }

    pub fn view_offs(&self) -> usize {
        self.inner.borrow().view_offs
    }

    pub fn is_view(&self) -> bool {
        self.inner.borrow().view_src.is_some()
    }

    pub fn buffer(&self) -> Option<Buffer> {
        self.inner.borrow().buffer.clone()
    }

    pub(crate) fn set_buffer(&self, buffer: Option<Buffer>) {
        self.inner.borrow_mut().buffer = buffer;
    }

    pub fn data(&self) -> *mut u8 {
        self.inner.borrow().data
    }

    pub(crate) fn set_data(&self, data: *mut u8) {
        self.inner.borrow_mut().data = data;
    }

    pub fn nelements(&self) -> i64 {
        let d = self.inner.borrow();
        d.ne.iter().product()
    }

    pub fn nrows(&self) -> i64 {
        let d = self.inner.borrow();
        d.ne[1] * d.ne[2] * d.ne[3]
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().ne.iter().any(|&n| n == 0)
    }

    pub fn is_contiguous(&self) -> bool {
        let d = self.inner.borrow();
        let ts = types::type_size(d.ttype);
        let bs = types::block_size(d.ttype);
        if d.nb[0] != ts {
            return false;
        }
        if d.nb[1] != d.nb[0] * d.ne[0] as usize / bs {
            return false;
        }
        for i in 2..MAX_DIMS {
            if d.nb[i] != d.nb[i - 1] * d.ne[i - 1] as usize {
                return false;
            }
        }
        true
    }

    /// Total bytes of the tensor's storage, honouring strides.
    pub fn nbytes(&self) -> usize {
        let d = self.inner.borrow();
        if d.ne.iter().any(|&n| n <= 0) {
            return 0;
        }
        let blck = types::block_size(d.ttype);
        if blck == 1 {
            let mut nbytes = types::type_size(d.ttype);
            for i in 0..MAX_DIMS {
                nbytes += (d.ne[i] as usize - 1) * d.nb[i];
            }
            nbytes
        } else {
            let mut nbytes = d.ne[0] as usize * d.nb[0] / blck;
            for i in 1..MAX_DIMS {
                nbytes += (d.ne[i] as usize - 1) * d.nb[i];
            }
            nbytes
        }
    }
}

/// Same type, extents and strides.
pub fn are_same_layout(a: &Tensor, b: &Tensor) -> bool {
    let (da, db) = (a.borrow(), b.borrow());
    da.ttype == db.ttype && da.ne == db.ne && da.nb == db.nb
}

pub fn are_same_shape(a: &Tensor, b: &Tensor) -> bool {
    a.ne() == b.ne()
}

/// New unallocated tensor with the same type, extents and strides as `src`.
pub fn dup_tensor_layout(src: &Tensor) -> Tensor {
    let t = Tensor::new(src.ttype(), &src.ne());
    t.borrow_mut().nb = src.nb();
    t
}

// ---------------------------------------------------------------------------
// op constructors
// ---------------------------------------------------------------------------

fn new_op_tensor(op: Op, ttype: TensorType, ne: &[i64], srcs: &[&Tensor]) -> Tensor {
    assert!(srcs.len() <= MAX_SRC);
    let t = Tensor::new(ttype, ne);
    {
        let mut d = t.borrow_mut();
        d.op = op;
        for (i, s) in srcs.iter().enumerate() {
            d.src[i] = Some((*s).clone());
        }
    }
    t
}

fn binary_op(op: Op, a: &Tensor, b: &Tensor) -> Tensor {
    assert!(are_same_shape(a, b) || can_repeat(b, a), "operand shapes not broadcastable");
    new_op_tensor(op, a.ttype(), &a.ne(), &[a, b])
}

fn can_repeat(small: &Tensor, big: &Tensor) -> bool {
    let (s, b) = (small.ne(), big.ne());
    (0..MAX_DIMS).all(|i| s[i] != 0 && b[i] % s[i] == 0)
}

pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    binary_op(Op::Add, a, b)
}

/// Adds the first element of `b` to every element of `a`.
pub fn add1(a: &Tensor, b: &Tensor) -> Tensor {
    new_op_tensor(Op::Add1, a.ttype(), &a.ne(), &[a, b])
}

pub fn sub(a: &Tensor, b: &Tensor) -> Tensor {
    binary_op(Op::Sub, a, b)
}

pub fn mul(a: &Tensor, b: &Tensor) -> Tensor {
    binary_op(Op::Mul, a, b)
}

pub fn div(a: &Tensor, b: &Tensor) -> Tensor {
    binary_op(Op::Div, a, b)
}

pub fn sqr(a: &Tensor) -> Tensor {
    new_op_tensor(Op::Sqr, a.ttype(), &a.ne(), &[a])
}

pub fn sqrt(a: &Tensor) -> Tensor {
    new_op_tensor(Op::Sqrt, a.ttype(), &a.ne(), &[a])
}

pub fn log(a: &Tensor) -> Tensor {
    new_op_tensor(Op::Log, a.ttype(), &a.ne(), &[a])
}

pub fn scale(a: &Tensor, s: f32) -> Tensor {
    let t = new_op_tensor(Op::Scale, a.ttype(), &a.ne(), &[a]);
    t.borrow_mut().op_params[0] = s.to_bits() as i32;
    t
}

pub fn unary(a: &Tensor, op: UnaryOp) -> Tensor {
    let t = new_op_tensor(Op::Unary, a.ttype(), &a.ne(), &[a]);
    t.borrow_mut().op_params[0] = op as i32;
    t
}

pub fn abs(a: &Tensor) -> Tensor {
    unary(a, UnaryOp::Abs)
}

pub fn relu(a: &Tensor) -> Tensor {
    unary(a, UnaryOp::Relu)
}

pub fn norm(a: &Tensor, eps: f32) -> Tensor {
    let t = new_op_tensor(Op::Norm, a.ttype(), &a.ne(), &[a]);
    t.borrow_mut().op_params[0] = eps.to_bits() as i32;
    t
}

pub fn rms_norm(a: &Tensor, eps: f32) -> Tensor {
    let t = new_op_tensor(Op::RmsNorm, a.ttype(), &a.ne(), &[a]);
    t.borrow_mut().op_params[0] = eps.to_bits() as i32;
    t
}

pub fn soft_max(a: &Tensor) -> Tensor {
    let t = new_op_tensor(Op::SoftMax, a.ttype(), &a.ne(), &[a]);
    t.borrow_mut().op_params[0] = 1.0f32.to_bits() as i32;
    t
}

pub fn diag_mask_inf(a: &Tensor, n_past: i32) -> Tensor {
    let t = new_op_tensor(Op::DiagMaskInf, a.ttype(), &a.ne(), &[a]);
    t.borrow_mut().op_params[0] = n_past;
    t
}

pub fn diag_mask_zero(a: &Tensor, n_past: i32) -> Tensor {
    let t = new_op_tensor(Op::DiagMaskZero, a.ttype(), &a.ne(), &[a]);
    t.borrow_mut().op_params[0] = n_past;
    t
}

/// Rotary position embedding over the first `n_dims` of each row.
/// `pos` holds one `i32` position per index along dim 2.
pub fn rope(a: &Tensor, pos: &Tensor, n_dims: i32, mode: i32, freq_base: f32) -> Tensor {
    assert_eq!(pos.ttype(), TensorType::I32);
    assert!(pos.nelements() >= a.ne()[2]);
    let t = new_op_tensor(Op::Rope, a.ttype(), &a.ne(), &[a, pos]);
    {
        let mut d = t.borrow_mut();
        d.op_params[0] = n_dims;
        d.op_params[1] = mode;
        d.op_params[2] = freq_base.to_bits() as i32;
    }
    t
}

/// Matrix product. `a` is `[k, n, ..]`, `b` is `[k, m, ..]`; the result is
/// `[n, m, ..]` in f32.
pub fn mul_mat(a: &Tensor, b: &Tensor) -> Tensor {
    let (nea, neb) = (a.ne(), b.ne());
    assert_eq!(nea[0], neb[0], "mul_mat inner dimensions must match");
    assert!(neb[2] % nea[2] == 0 && neb[3] % nea[3] == 0);
    new_op_tensor(Op::MulMat, TensorType::F32, &[nea[1], neb[1], neb[2], neb[3]], &[a, b])
}

/// Indirect (mixture-of-experts) matrix product. `as_` is `[k, n, n_expert]`,
/// `b` is `[k, n_expert_used, n_tokens]` and `ids` is
/// `[n_expert_used, n_tokens]` in i32.
pub fn mul_mat_id(as_: &Tensor, b: &Tensor, ids: &Tensor) -> Tensor {
    assert_eq!(ids.ttype(), TensorType::I32);
    let (nea, neb, nei) = (as_.ne(), b.ne(), ids.ne());
    assert_eq!(nea[0], neb[0], "mul_mat_id inner dimensions must match");
    assert_eq!(neb[1], nei[0]);
    assert_eq!(neb[2], nei[1]);
    new_op_tensor(Op::MulMatId, TensorType::F32, &[nea[1], neb[1], neb[2], 1], &[as_, b, ids])
}

// ---------------------------------------------------------------------------
// views
// ---------------------------------------------------------------------------

fn new_view_impl(op: Op, src: &Tensor, ne: [i64; MAX_DIMS], nb: [usize; MAX_DIMS], offs: usize) -> Tensor {
    // collapse chains so that view_src always points at the storage root
    let (root, offs) = match src.view_src() {
        Some(vs) => (vs, offs + src.view_offs()),
        None => (src.clone(), offs),
    };
    let t = Tensor::new(src.ttype(), &[1]);
    {
        let mut d = t.borrow_mut();
        d.op = op;
        d.ne = ne;
        d.nb = nb;
        d.src[0] = Some(src.clone());
        d.view_src = Some(root);
        d.view_offs = offs;
    }
    t
}

/// Full-shape view of `src`.
pub fn view_tensor(src: &Tensor) -> Tensor {
    let t = new_view_impl(Op::View, src, src.ne(), src.nb(), 0);
    t.set_name(format!("{} (view)", src.name()));
    t
}

pub fn view_1d(src: &Tensor, ne0: i64, offset: usize) -> Tensor {
    let ts = types::type_size(src.ttype());
    let mut nb = [0usize; MAX_DIMS];
    nb[0] = ts;
    nb[1] = ts * ne0 as usize;
    nb[2] = nb[1];
    nb[3] = nb[1];
    new_view_impl(Op::View, src, [ne0, 1, 1, 1], nb, offset)
}

pub fn view_2d(src: &Tensor, ne0: i64, ne1: i64, nb1: usize, offset: usize) -> Tensor {
    let ts = types::type_size(src.ttype());
    let mut nb = [0usize; MAX_DIMS];
    nb[0] = ts;
    nb[1] = nb1;
    nb[2] = nb1 * ne1 as usize;
    nb[3] = nb[2];
    new_view_impl(Op::View, src, [ne0, ne1, 1, 1], nb, offset)
}

/// Contiguous reinterpretation of `src` with new extents.
pub fn reshape(src: &Tensor, ne: &[i64]) -> Tensor {
    assert!(src.is_contiguous(), "reshape requires a contiguous tensor");
    let mut ne4 = [1i64; MAX_DIMS];
    ne4[..ne.len()].copy_from_slice(ne);
    assert_eq!(src.nelements(), ne4.iter().product::<i64>());

    let ts = types::type_size(src.ttype());
    let bs = types::block_size(src.ttype());
    let mut nb = [0usize; MAX_DIMS];
    nb[0] = ts;
    nb[1] = nb[0] * ne4[0] as usize / bs;
    for i in 2..MAX_DIMS {
        nb[i] = nb[i - 1] * ne4[i - 1] as usize;
    }
    new_view_impl(Op::Reshape, src, ne4, nb, 0)
}

pub fn permute(src: &Tensor, axes: [usize; MAX_DIMS]) -> Tensor {
    {
        let mut seen = [false; MAX_DIMS];
        for &ax in axes.iter() {
            assert!(ax < MAX_DIMS && !seen[ax], "invalid permutation");
            seen[ax] = true;
        }
    }
    let (ne, nb) = (src.ne(), src.nb());
    let mut pne = [0i64; MAX_DIMS];
    let mut pnb = [0usize; MAX_DIMS];
    for i in 0..MAX_DIMS {
        pne[axes[i]] = ne[i];
        pnb[axes[i]] = nb[i];
    }
    new_view_impl(Op::Permute, src, pne, pnb, 0)
}

pub fn transpose(src: &Tensor) -> Tensor {
    let (ne, nb) = (src.ne(), src.nb());
    new_view_impl(
        Op::Transpose,
        src,
        [ne[1], ne[0], ne[2], ne[3]],
        [nb[1], nb[0], nb[2], nb[3]],
        0,
    )
}

// ---------------------------------------------------------------------------
// graph
// ---------------------------------------------------------------------------

/// A computation graph: nodes in evaluation order plus leafs (weights,
/// inputs). Built once, then handed to the scheduler.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Tensor>,
    leafs: Vec<Tensor>,
    visited: HashSet<TensorId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Adds `tensor` and everything it depends on, parents first.
    pub fn build_forward_expand(&mut self, tensor: &Tensor) {
        self.visit(tensor);
    }

    fn visit(&mut self, tensor: &Tensor) {
        if self.visited.contains(&tensor.id()) {
            return;
        }
        self.visited.insert(tensor.id());

        if let Some(vs) = tensor.view_src() {
            self.visit(&vs);
        }
        for src in tensor.srcs() {
            self.visit(&src);
        }

        if tensor.op() == Op::None {
            self.leafs.push(tensor.clone());
        } else {
            self.nodes.push(tensor.clone());
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_leafs(&self) -> usize {
        self.leafs.len()
    }

    pub fn nodes(&self) -> &[Tensor] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Tensor] {
        &mut self.nodes
    }

    pub fn leafs(&self) -> &[Tensor] {
        &self.leafs
    }

    pub fn node(&self, i: usize) -> &Tensor {
        &self.nodes[i]
    }

    pub(crate) fn push_node(&mut self, t: Tensor) {
        self.nodes.push(t);
    }

    pub(crate) fn push_leaf(&mut self, t: Tensor) {
        self.leafs.push(t);
    }

    pub(crate) fn from_nodes(nodes: Vec<Tensor>) -> Graph {
        Graph { nodes, leafs: Vec::new(), visited: HashSet::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tensor_strides() {
        let t = Tensor::new(TensorType::F32, &[8, 4]);
        assert_eq!(t.ne(), [8, 4, 1, 1]);
        assert_eq!(t.nb(), [4, 32, 128, 128]);
        assert_eq!(t.nbytes(), 128);
        assert!(t.is_contiguous());
        assert!(t.data().is_null());
        assert!(t.buffer().is_none());
    }

    #[test]
    fn test_quantized_strides() {
        let t = Tensor::new(TensorType::Q8_0, &[64, 2]);
        // two blocks of 34 bytes per row
        assert_eq!(t.nb()[1], 68);
        assert_eq!(t.nbytes(), 136);
    }

    #[test]
    fn test_view_collapses_to_root() {
        let base = Tensor::new(TensorType::F32, &[16]);
        let v1 = view_1d(&base, 8, 16);
        let v2 = view_1d(&v1, 4, 8);
        assert_eq!(v2.view_src().unwrap(), base);
        assert_eq!(v2.view_offs(), 24);
    }

    #[test]
    fn test_transpose_swaps_strides() {
        let t = Tensor::new(TensorType::F32, &[8, 4]);
        let tt = transpose(&t);
        assert_eq!(tt.ne(), [4, 8, 1, 1]);
        assert_eq!(tt.nb()[0], t.nb()[1]);
        assert_eq!(tt.nb()[1], t.nb()[0]);
        assert!(!tt.is_contiguous());
        assert!(types::is_view_op(tt.op()));
    }

    #[test]
    fn test_build_forward_expand_orders_parents_first() {
        let a = Tensor::new(TensorType::F32, &[4]);
        let b = Tensor::new(TensorType::F32, &[4]);
        let c = add(&a, &b);
        let d = mul(&c, &a);

        let mut g = Graph::new();
        g.build_forward_expand(&d);

        assert_eq!(g.n_leafs(), 2);
        assert_eq!(g.n_nodes(), 2);
        assert_eq!(g.node(0), &c);
        assert_eq!(g.node(1), &d);

        // adding the same tensor again is a no-op
        g.build_forward_expand(&d);
        assert_eq!(g.n_nodes(), 2);
    }

    #[test]
    fn test_mul_mat_shape() {
        let w = Tensor::new(TensorType::F32, &[64, 16]);
        let x = Tensor::new(TensorType::F32, &[64, 3]);
        let y = mul_mat(&w, &x);
        assert_eq!(y.ne(), [16, 3, 1, 1]);
        assert_eq!(y.op(), Op::MulMat);
    }

    #[test]
    fn test_same_layout() {
        let a = Tensor::new(TensorType::F32, &[8, 4]);
        let b = Tensor::new(TensorType::F32, &[8, 4]);
        let c = Tensor::new(TensorType::F32, &[4, 8]);
        assert!(are_same_layout(&a, &b));
        assert!(!are_same_layout(&a, &c));
    }
}
