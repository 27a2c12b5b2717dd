//! Graph allocator: reference-counted DAG traversal over one tensor
//! allocator per buffer type.
//!
//! `reserve` runs the traversal with measure allocators to size the backing
//! buffers; `alloc_graph` re-runs the identical traversal into the reserved
//! buffers. Placement decisions read the *effective address* of a tensor
//! (its real data pointer, or the shadow address recorded during a measure
//! pass), so reserving never mutates the caller's graph.

use crate::backend::buffer::{self, BufferType, BufferUsage};
use crate::backend::Buffer;
use crate::error::{Error, Result};
use crate::talloc::TensorAlloc;
use crate::tensor::{are_same_layout, flags, Graph, Tensor, TensorId};
use crate::types::op_can_inplace;
use std::collections::HashMap;
use tracing::{debug, trace};

#[derive(Default)]
struct HashNode {
    n_children: i32,
    n_views: i32,
    buffer_id: usize,
    /// Effective address once placed (shadow during measure).
    addr: Option<usize>,
    /// True when this pass allocated the storage through a tensor allocator.
    allocated: bool,
    /// Storage root adopted by in-place reuse.
    inplace_src: Option<Tensor>,
}

pub struct GraphAlloc {
    bufts: Vec<BufferType>,
    buffers: Vec<Option<Buffer>>,
    tallocs: Vec<TensorAlloc>,
    hash: HashMap<TensorId, HashNode>,
    node_buffer_ids: Vec<usize>,
    leaf_buffer_ids: Vec<usize>,
}

impl GraphAlloc {
    pub fn new(buft: BufferType) -> GraphAlloc {
        GraphAlloc::new_n(vec![buft])
    }

    pub fn new_n(bufts: Vec<BufferType>) -> GraphAlloc {
        assert!(!bufts.is_empty());
        let n = bufts.len();
        GraphAlloc {
            bufts,
            buffers: (0..n).map(|_| None).collect(),
            tallocs: Vec::new(),
            hash: HashMap::new(),
            node_buffer_ids: Vec::new(),
            leaf_buffer_ids: Vec::new(),
        }
    }

    pub fn n_buffers(&self) -> usize {
        self.bufts.len()
    }

    pub fn buffer_size(&self, buffer_id: usize) -> usize {
        self.buffers[buffer_id].as_ref().map_or(0, |b| b.size())
    }

    pub fn buffer(&self, buffer_id: usize) -> Option<&Buffer> {
        self.buffers[buffer_id].as_ref()
    }

    /// Measures the peak memory of `graph` and (re)allocates any backing
    /// buffer that is too small. Per-tensor placement is routed by the
    /// parallel buffer-id arrays.
    pub fn reserve(
        &mut self,
        graph: &Graph,
        node_buffer_ids: &[usize],
        leaf_buffer_ids: &[usize],
    ) -> Result<()> {
        assert_eq!(node_buffer_ids.len(), graph.n_nodes());
        assert_eq!(leaf_buffer_ids.len(), graph.n_leafs());
        for &id in node_buffer_ids.iter().chain(leaf_buffer_ids.iter()) {
            assert!(id < self.bufts.len(), "buffer id out of range");
        }

        self.node_buffer_ids = node_buffer_ids.to_vec();
        self.leaf_buffer_ids = leaf_buffer_ids.to_vec();

        self.alloc_graph_impl(graph, true)?;
        let sizes: Vec<usize> = self.tallocs.iter().map(|t| t.max_size()).collect();

        // a measure pass must be reproducible for the real pass to land on
        // the same layout
        #[cfg(debug_assertions)]
        {
            self.alloc_graph_impl(graph, true)?;
            let again: Vec<usize> = self.tallocs.iter().map(|t| t.max_size()).collect();
            debug_assert_eq!(sizes, again, "measure pass is not reproducible");
        }

        for i in 0..self.bufts.len() {
            let needed = sizes[i];
            let cur = self.buffers[i].as_ref().map(|b| b.size());
            if cur.is_none_or(|c| needed > c) {
                if let Some(c) = cur {
                    debug!(
                        buft = self.bufts[i].name(),
                        from = c,
                        to = needed,
                        "galloc: reallocating buffer"
                    );
                }
                // free the old buffer before allocating the replacement
                self.buffers[i] = None;
                let buffer = self.bufts[i].alloc_buffer(needed)?;
                buffer.set_usage(BufferUsage::Compute);
                self.buffers[i] = Some(buffer);
            }
        }

        Ok(())
    }

    /// `reserve` for a single-buffer graph: every tensor goes to buffer 0.
    pub fn reserve_single(&mut self, graph: &Graph) -> Result<()> {
        assert_eq!(self.bufts.len(), 1);
        let node_ids = vec![0usize; graph.n_nodes()];
        let leaf_ids = vec![0usize; graph.n_leafs()];
        self.reserve(graph, &node_ids, &leaf_ids)
    }

    /// Lays `graph` out in the reserved buffers. Fails with a
    /// `NeedsReserve` error when the reservation is missing, stale, or too
    /// small for this graph.
    pub fn alloc_graph(&mut self, graph: &Graph) -> Result<()> {
        if graph.n_nodes() != self.node_buffer_ids.len()
            || graph.n_leafs() != self.leaf_buffer_ids.len()
        {
            return Err(Error::needs_reserve().context("graph topology changed since reserve"));
        }
        if self.buffers.iter().any(Option::is_none) {
            return Err(Error::needs_reserve().context("buffers have not been reserved"));
        }
        self.alloc_graph_impl(graph, false)
    }

    fn alloc_graph_impl(&mut self, graph: &Graph, measure: bool) -> Result<()> {
        self.hash.clear();

        if measure {
            self.tallocs = self.bufts.iter().map(TensorAlloc::new_measure).collect();
        } else {
            self.tallocs = self
                .buffers
                .iter()
                .map(|b| TensorAlloc::new_from_buffer(b.as_ref().expect("buffer reserved")))
                .collect();
        }

        self.count_refs(graph);

        // leafs first, so tensors the scheduler appends as leafs (input
        // copies) land at stable, non-overlapping addresses
        for i in 0..graph.n_leafs() {
            let leaf = graph.leafs()[i].clone();
            self.allocate_node(&leaf, self.leaf_buffer_ids[i], measure)?;
        }

        for i in 0..graph.n_nodes() {
            let node = graph.node(i).clone();
            let buffer_id = self.node_buffer_ids[i];

            // allocate dangling parents first
            for src in node.srcs() {
                self.allocate_node(&src, buffer_id, measure)?;
            }

            self.allocate_node(&node, buffer_id, measure)?;
            self.free_refs(&node, measure)?;
        }

        Ok(())
    }

    fn count_refs(&mut self, graph: &Graph) {
        for node in graph.nodes() {
            if let Some(vs) = node.view_src() {
                self.hn(&vs).n_views += 1;
            }
            for src in node.srcs() {
                self.hn(&src).n_children += 1;
            }
        }
    }

    fn hn(&mut self, t: &Tensor) -> &mut HashNode {
        self.hash.entry(t.id()).or_default()
    }

    /// Real data pointer, or the shadow address placed by this pass.
    fn effective_addr(&self, t: &Tensor) -> Option<usize> {
        let data = t.data();
        if !data.is_null() {
            return Some(data as usize);
        }
        self.hash.get(&t.id()).and_then(|h| h.addr)
    }

    /// The tensor whose storage `t` aliases: a static view source, or the
    /// parent adopted by in-place reuse.
    fn storage_root(&self, t: &Tensor) -> Option<Tensor> {
        if let Some(vs) = t.view_src() {
            return Some(vs);
        }
        self.hash.get(&t.id()).and_then(|h| h.inplace_src.clone())
    }

    fn allocate_node(&mut self, t: &Tensor, buffer_id: usize, measure: bool) -> Result<()> {
        if self.effective_addr(t).is_some() {
            // pre-allocated, or already placed by this pass
            return Ok(());
        }

        if let Some(vs) = t.view_src() {
            let vaddr = self
                .effective_addr(&vs)
                .ok_or_else(|| Error::msg(format!("view source of {} is not allocated", t.name())))?;
            let addr = vaddr + t.view_offs();
            let root_buffer_id =
                self.hash.get(&vs.id()).map_or(buffer_id, |h| h.buffer_id);
            let hn = self.hn(t);
            hn.addr = Some(addr);
            hn.buffer_id = root_buffer_id;
            if !measure {
                buffer::view_init(t);
            }
            return Ok(());
        }

        // see if we can reuse a parent's storage (in-place); inputs and
        // outputs always get their own storage
        if op_can_inplace(t.op()) && t.flags() & (flags::INPUT | flags::OUTPUT) == 0 {
            for parent in t.srcs() {
                if parent.flags() & (flags::INPUT | flags::OUTPUT) != 0 {
                    // inputs are never overwritten, outputs never recycled
                    continue;
                }
                let Some(paddr) = self.effective_addr(&parent) else { continue };
                let (p_children, p_views) = {
                    let h = self.hn(&parent);
                    (h.n_children, h.n_views)
                };
                if p_children != 1 || p_views != 0 || !are_same_layout(t, &parent) {
                    continue;
                }

                match self.storage_root(&parent) {
                    Some(root) => {
                        if root.flags() & (flags::INPUT | flags::OUTPUT) != 0 {
                            continue;
                        }
                        // reuse the viewed storage only when the parent is
                        // its sole user and sits at offset zero
                        let (r_children, r_views, r_alloc, r_bid, raddr) = {
                            let h = self.hn(&root);
                            (h.n_children, h.n_views, h.allocated, h.buffer_id, h.addr)
                        };
                        let raddr = match raddr {
                            Some(a) => a,
                            None => match self.effective_addr(&root) {
                                Some(a) => a,
                                None => continue,
                            },
                        };
                        if r_views == 1
                            && r_children == 0
                            && raddr == paddr
                            && r_alloc
                            && r_bid == buffer_id
                        {
                            trace!(
                                node = %t.name(),
                                parent = %parent.name(),
                                root = %root.name(),
                                "galloc: reusing view parent"
                            );
                            self.adopt_storage(t, &root, buffer_id, measure);
                            return Ok(());
                        }
                    }
                    None => {
                        let (p_alloc, p_bid) = {
                            let h = self.hn(&parent);
                            (h.allocated, h.buffer_id)
                        };
                        if p_alloc && p_bid == buffer_id {
                            trace!(node = %t.name(), parent = %parent.name(), "galloc: reusing parent");
                            self.adopt_storage(t, &parent, buffer_id, measure);
                            return Ok(());
                        }
                    }
                }
            }
        }

        let addr = self.tallocs[buffer_id].alloc(t)?;
        let hn = self.hn(t);
        hn.addr = Some(addr);
        hn.buffer_id = buffer_id;
        hn.allocated = true;
        Ok(())
    }

    fn adopt_storage(&mut self, t: &Tensor, root: &Tensor, buffer_id: usize, measure: bool) {
        let addr = self.effective_addr(root).expect("storage root is allocated");
        self.hn(root).n_views += 1;
        let hn = self.hn(t);
        hn.inplace_src = Some(root.clone());
        hn.addr = Some(addr);
        hn.buffer_id = buffer_id;
        if !measure {
            t.set_buffer(root.buffer());
            t.set_data(addr as *mut u8);
            if let Some(buffer) = root.buffer() {
                buffer.init_tensor(t);
            }
        }
    }

    fn free_refs(&mut self, node: &Tensor, measure: bool) -> Result<()> {
        for parent in node.srcs() {
            self.hn(&parent).n_children -= 1;
            let (p_children, p_views) = {
                let h = self.hn(&parent);
                (h.n_children, h.n_views)
            };
            if p_children == 0 && p_views == 0 {
                match self.storage_root(&parent) {
                    Some(root) => {
                        self.hn(&root).n_views -= 1;
                        let (r_children, r_views) = {
                            let h = self.hn(&root);
                            (h.n_children, h.n_views)
                        };
                        if r_children == 0 && r_views == 0 {
                            self.free_tensor_shadow(&root, measure)?;
                        }
                    }
                    None => self.free_tensor_shadow(&parent, measure)?,
                }
            }
        }
        Ok(())
    }

    fn free_tensor_shadow(&mut self, t: &Tensor, measure: bool) -> Result<()> {
        let Some(h) = self.hash.get(&t.id()) else { return Ok(()) };
        if !h.allocated {
            // not placed by this pass (weights, user-placed tensors)
            return Ok(());
        }
        if t.flags() & (flags::OUTPUT | flags::INPUT) != 0 {
            return Ok(());
        }
        let addr = h.addr.expect("allocated tensor has an address");
        let buffer_id = h.buffer_id;
        let size = self.tallocs[buffer_id].tensor_size(t);
        trace!(tensor = %t.name(), size, measure, "galloc: recycling");
        self.tallocs[buffer_id].free_raw(addr, size)?;
        self.hash.get_mut(&t.id()).unwrap().allocated = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::cpu_buffer_type;
    use crate::tensor;
    use crate::types::TensorType;

    fn f32_leaf(n: i64) -> Tensor {
        Tensor::new(TensorType::F32, &[n])
    }

    #[test]
    fn test_reserve_then_alloc_places_everything() {
        let x = f32_leaf(64);
        let y = f32_leaf(64);
        let a = tensor::add(&x, &y);
        let b = tensor::norm(&a, 1e-5);

        let mut g = Graph::new();
        g.build_forward_expand(&b);

        let mut galloc = GraphAlloc::new(cpu_buffer_type());
        galloc.reserve_single(&g).unwrap();
        galloc.alloc_graph(&g).unwrap();

        // closure: every tensor has storage inside the reserved buffer
        let buffer = galloc.buffer(0).unwrap().clone();
        let base = buffer.base() as usize;
        for t in [&x, &y, &a, &b] {
            assert!(!t.data().is_null(), "{t:?} was not allocated");
            let addr = t.data() as usize;
            assert!(addr >= base && addr + t.nbytes() <= base + buffer.size());
            assert_eq!((addr - base) % buffer.buft().alignment(), 0);
        }

        // add has a single consumer of x, so it runs in x's storage
        assert_eq!(a.data(), x.data());
        assert_eq!(a.buffer(), x.buffer());
        // norm is not in the in-place set
        assert_ne!(b.data(), a.data());

        // peak: x, y live together, b replaces y's slot
        assert_eq!(galloc.buffer_size(0), 512);
    }

    #[test]
    fn test_inplace_blocked_by_pending_consumers() {
        let x = f32_leaf(64);
        let r = tensor::relu(&x);
        let s = tensor::abs(&x);

        let mut g = Graph::new();
        g.build_forward_expand(&r);
        g.build_forward_expand(&s);

        let mut galloc = GraphAlloc::new(cpu_buffer_type());
        galloc.reserve_single(&g).unwrap();
        galloc.alloc_graph(&g).unwrap();

        // x still has a pending consumer when r is placed, so r cannot run
        // in x's storage
        assert_ne!(r.data(), x.data());
        // by the time s is placed it is x's last consumer, so it can
        assert_eq!(s.data(), x.data());
        assert_ne!(r.data(), s.data());
    }

    #[test]
    fn test_output_storage_is_not_recycled() {
        let x = f32_leaf(64);
        let y = f32_leaf(64);
        let a = tensor::add(&x, &y);
        a.set_output();
        let b = tensor::scale(&a, 2.0);
        let c = tensor::sqr(&b);

        let mut g = Graph::new();
        g.build_forward_expand(&c);

        let mut galloc = GraphAlloc::new(cpu_buffer_type());
        galloc.reserve_single(&g).unwrap();
        galloc.alloc_graph(&g).unwrap();

        // the output tensor neither donates its storage nor gets recycled
        assert_ne!(b.data(), a.data());
        assert_ne!(c.data(), a.data());
    }

    #[test]
    fn test_views_alias_their_source() {
        let x = f32_leaf(64);
        let v = tensor::view_1d(&x, 32, 64);
        let r = tensor::norm(&v, 1e-5);

        let mut g = Graph::new();
        g.build_forward_expand(&r);

        let mut galloc = GraphAlloc::new(cpu_buffer_type());
        galloc.reserve_single(&g).unwrap();
        galloc.alloc_graph(&g).unwrap();

        assert_eq!(v.buffer(), x.buffer());
        assert_eq!(v.data() as usize, x.data() as usize + 64);
    }

    #[test]
    fn test_multi_buffer_routing() {
        let x = f32_leaf(64);
        let n = tensor::scale(&x, 0.5);

        let mut g = Graph::new();
        g.build_forward_expand(&n);

        let buft = cpu_buffer_type();
        let mut galloc = GraphAlloc::new_n(vec![buft.clone(), buft.clone()]);
        // leaf in buffer 0, node in buffer 1
        galloc.reserve(&g, &[1], &[0]).unwrap();
        galloc.alloc_graph(&g).unwrap();

        assert!(galloc.buffer_size(0) >= 256);
        assert!(galloc.buffer_size(1) >= 256);
        // different buffers, so in-place reuse across them is impossible
        assert_ne!(x.buffer(), n.buffer());
        assert_eq!(x.buffer().as_ref(), galloc.buffer(0));
        assert_eq!(n.buffer().as_ref(), galloc.buffer(1));
    }

    #[test]
    fn test_alloc_needs_reserve_on_topology_change() {
        let x = f32_leaf(64);
        let n = tensor::scale(&x, 0.5);
        let mut g = Graph::new();
        g.build_forward_expand(&n);

        let mut galloc = GraphAlloc::new(cpu_buffer_type());
        galloc.reserve_single(&g).unwrap();

        let x2 = f32_leaf(64);
        let n2 = tensor::scale(&x2, 0.5);
        let m2 = tensor::sqr(&n2);
        let mut g2 = Graph::new();
        g2.build_forward_expand(&m2);

        let err = galloc.alloc_graph(&g2).unwrap_err();
        assert!(err.is_needs_reserve());
    }

    #[test]
    fn test_reserve_is_reproducible_and_keeps_buffer() {
        let x = f32_leaf(256);
        let a = tensor::relu(&x);
        let mut g = Graph::new();
        g.build_forward_expand(&a);

        let mut galloc = GraphAlloc::new(cpu_buffer_type());
        galloc.reserve_single(&g).unwrap();
        let first = galloc.buffer(0).unwrap().clone();

        // same graph: same peak, the buffer must not be reallocated
        galloc.reserve_single(&g).unwrap();
        assert_eq!(galloc.buffer(0).unwrap(), &first);
    }

    #[test]
    fn test_measure_matches_real_layout() {
        // same decisions with and without real memory: build two identical
        // graphs and compare relative offsets
        fn build() -> (Vec<Tensor>, Graph) {
            let x = f32_leaf(64);
            let y = f32_leaf(64);
            let a = tensor::add(&x, &y);
            let b = tensor::norm(&a, 1e-5);
            let c = tensor::mul(&b, &a);
            let mut g = Graph::new();
            g.build_forward_expand(&c);
            (vec![x, y, a, b, c], g)
        }

        let (t1, g1) = build();
        let (t2, g2) = build();

        let mut galloc1 = GraphAlloc::new(cpu_buffer_type());
        galloc1.reserve_single(&g1).unwrap();
        galloc1.alloc_graph(&g1).unwrap();

        let mut galloc2 = GraphAlloc::new(cpu_buffer_type());
        galloc2.reserve_single(&g2).unwrap();
        galloc2.alloc_graph(&g2).unwrap();

        let base1 = galloc1.buffer(0).unwrap().base() as usize;
        let base2 = galloc2.buffer(0).unwrap().base() as usize;
        for (a, b) in t1.iter().zip(t2.iter()) {
            assert_eq!(a.data() as usize - base1, b.data() as usize - base2);
        }
        assert_eq!(galloc1.buffer_size(0), galloc2.buffer_size(0));
    }
}
