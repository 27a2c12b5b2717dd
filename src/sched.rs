//! Multi-backend graph scheduler.
//!
//! Assigns every node of a graph to one of N ranked backends, splits the
//! graph into maximal per-backend runs, materialises cross-backend input
//! copies at split boundaries, reserves per-backend memory through the
//! graph allocator and drives execution with optional pipelining over an
//! event ring.

use crate::backend::backend::{Backend, DeviceType, Event};
use crate::backend::buffer::{self, BufferType, BufferUsage};
use crate::error::{Error, ErrorKind, Result};
use crate::galloc::GraphAlloc;
use crate::tensor::{dup_tensor_layout, flags, view_tensor, Graph, Tensor, TensorId, MAX_SRC};
use crate::types::{is_view_op, Op, Status};
use std::collections::HashMap;
use tracing::{debug, error};

pub const SCHED_MAX_BACKENDS: usize = 16;
pub const SCHED_MAX_SPLIT_INPUTS: usize = 30;
pub const SCHED_MAX_COPIES: usize = 4;

const INITIAL_SPLITS_CAPACITY: usize = 16;

/// Tail padding for the expert-selective copy, so vectorised kernels never
/// read uninitialised bytes past the last copied expert.
const EXPERT_COPY_PAD: usize = 512;

struct SchedSplit {
    backend_id: usize,
    i_start: usize,
    i_end: usize,
    inputs: Vec<Tensor>,
    graph: Graph,
}

pub type EvalCallback = Box<dyn FnMut(&Tensor, bool) -> bool>;

pub struct Sched {
    backends: Vec<Backend>,
    bufts: Vec<BufferType>,
    galloc: GraphAlloc,

    // per-tensor assignment and copy shadows
    hv_backend_ids: HashMap<TensorId, usize>,
    hv_copies: HashMap<(TensorId, usize, usize), Tensor>,
    causes: HashMap<TensorId, &'static str>,

    // parallel to the composed graph, for change detection
    node_backend_ids: Vec<usize>,
    leaf_backend_ids: Vec<usize>,
    prev_node_backend_ids: Vec<usize>,
    prev_leaf_backend_ids: Vec<usize>,

    // copy of the graph with split boundaries and input copies spliced in
    graph: Graph,
    splits: Vec<SchedSplit>,

    // pipeline parallelism
    n_copies: usize,
    cur_copy: usize,
    next_copy: usize,
    events: Vec<Vec<Option<Event>>>,
    graph_inputs: Vec<Tensor>,

    callback_eval: Option<EvalCallback>,

    op_offload: bool,
    debug: u8,

    is_reset: bool,
    is_alloc: bool,
}

impl Sched {
    /// Creates a scheduler over `backends`, ordered by descending priority;
    /// the last backend must be the CPU fallback. `parallel` enables
    /// pipelined input copies; `op_offload` allows promoting weight ops to
    /// a faster backend.
    pub fn new(
        backends: Vec<Backend>,
        bufts: Option<Vec<BufferType>>,
        graph_size: usize,
        parallel: bool,
        op_offload: bool,
    ) -> Sched {
        assert!(!backends.is_empty() && backends.len() <= SCHED_MAX_BACKENDS);
        assert!(
            backends.last().unwrap().device().device_type() == DeviceType::Cpu,
            "the last backend must be a CPU device"
        );

        let debug = std::env::var("FEML_SCHED_DEBUG")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .unwrap_or(0);

        let n_copies = if parallel { SCHED_MAX_COPIES } else { 1 };

        let bufts = match bufts {
            Some(b) => {
                assert_eq!(b.len(), backends.len());
                b
            }
            None => backends.iter().map(|b| b.buffer_type()).collect(),
        };
        for (backend, buft) in backends.iter().zip(bufts.iter()) {
            assert!(
                backend.supports_buft(buft),
                "backend {} does not support its buffer type {}",
                backend.name(),
                buft.name()
            );
        }

        let events = backends
            .iter()
            .map(|b| {
                (0..n_copies)
                    .map(|_| if n_copies > 1 { b.device().event_new() } else { None })
                    .collect()
            })
            .collect();

        let galloc = GraphAlloc::new_n(bufts.clone());

        let mut sched = Sched {
            backends,
            bufts,
            galloc,
            hv_backend_ids: HashMap::with_capacity(graph_size),
            hv_copies: HashMap::new(),
            causes: HashMap::new(),
            node_backend_ids: Vec::new(),
            leaf_backend_ids: Vec::new(),
            prev_node_backend_ids: Vec::new(),
            prev_leaf_backend_ids: Vec::new(),
            graph: Graph::default(),
            splits: Vec::with_capacity(INITIAL_SPLITS_CAPACITY),
            n_copies,
            cur_copy: 0,
            next_copy: 0,
            events,
            graph_inputs: Vec::new(),
            callback_eval: None,
            op_offload,
            debug,
            is_reset: false,
            is_alloc: false,
        };
        sched.reset();
        sched
    }

    /// Clears all per-graph state. Idempotent; must run between graphs with
    /// different tensors.
    pub fn reset(&mut self) {
        if !self.is_reset {
            self.hv_backend_ids.clear();
            self.hv_copies.clear();
            self.causes.clear();
            self.is_reset = true;
        }
        self.is_alloc = false;
    }

    pub fn n_backends(&self) -> usize {
        self.backends.len()
    }

    pub fn n_splits(&self) -> usize {
        self.splits.len()
    }

    pub fn n_copies(&self) -> usize {
        self.n_copies
    }

    pub fn get_backend(&self, i: usize) -> Backend {
        self.backends[i].clone()
    }

    pub fn get_buffer_type(&self, backend: &Backend) -> BufferType {
        let i = self.backend_index(backend).expect("backend not in scheduler");
        self.bufts[i].clone()
    }

    pub fn get_buffer_size(&self, backend: &Backend) -> usize {
        let i = self.backend_index(backend).expect("backend not in scheduler");
        self.galloc.buffer_size(i)
    }

    /// The `ask == true` phase requests permission to compute up to a
    /// tensor; a later `ask == false` call delivers it and may stop the
    /// current split by returning false.
    pub fn set_eval_callback(&mut self, callback: Option<EvalCallback>) {
        self.callback_eval = callback;
    }

    /// Pins a tensor to a backend; survives the assignment passes.
    pub fn set_tensor_backend(&mut self, tensor: &Tensor, backend: &Backend) {
        let id = self.backend_index(backend).expect("backend not in scheduler");
        self.hv_backend_ids.insert(tensor.id(), id);
        if self.debug >= 3 {
            self.causes.insert(tensor.id(), "usr");
        }
        self.is_reset = false;
    }

    pub fn get_tensor_backend(&self, tensor: &Tensor) -> Option<Backend> {
        self.tensor_backend_id(tensor).map(|i| self.backends[i].clone())
    }

    /// Runs the assignment passes and a measure allocation for a worst-case
    /// graph, sizing every backend buffer to its peak.
    pub fn reserve(&mut self, graph: &mut Graph) -> Result<()> {
        self.synchronize();
        self.split_graph(graph)?;
        self.galloc.reserve(&self.graph, &self.node_backend_ids, &self.leaf_backend_ids)?;
        self.reset();
        Ok(())
    }

    /// Splits `graph` and lays it out in the reserved buffers, growing them
    /// if required.
    pub fn alloc_graph(&mut self, graph: &mut Graph) -> Result<()> {
        assert!(!self.is_alloc, "graph already allocated; call reset between graphs");

        self.cur_copy = self.next_copy;
        self.next_copy = (self.next_copy + 1) % self.n_copies;

        self.split_graph(graph)?;
        self.alloc_splits()?;
        self.is_alloc = true;
        Ok(())
    }

    /// Blocking compute of `graph`.
    pub fn graph_compute(&mut self, graph: &mut Graph) -> Status {
        let status = self.graph_compute_async(graph);
        self.synchronize();
        status
    }

    /// Submits `graph`; the caller must `synchronize` before reading the
    /// outputs.
    pub fn graph_compute_async(&mut self, graph: &mut Graph) -> Status {
        if !self.is_reset && !self.is_alloc {
            self.reset();
        }
        if !self.is_alloc {
            if let Err(err) = self.alloc_graph(graph) {
                error!("sched: failed to allocate graph: {err}");
                return match err.kind() {
                    ErrorKind::NoBackendForOp { .. } | ErrorKind::IncompatiblePreAllocation { .. } => {
                        Status::Failed
                    }
                    _ => Status::AllocFailed,
                };
            }
        }
        self.compute_splits()
    }

    /// Waits for every backend; after this all outputs are readable.
    pub fn synchronize(&mut self) {
        for b in &self.backends {
            b.synchronize();
        }
        if !self.is_alloc {
            // always restart at copy 0 when no graph is in flight, so
            // autoregressive decode reuses the same copy index every step
            self.next_copy = 0;
        }
    }

    // -----------------------------------------------------------------
    // assignment
    // -----------------------------------------------------------------

    fn backend_index(&self, backend: &Backend) -> Option<usize> {
        self.backends.iter().position(|b| b == backend)
    }

    fn tensor_backend_id(&self, t: &Tensor) -> Option<usize> {
        self.hv_backend_ids.get(&t.id()).copied()
    }

    fn effective_backend_id(&self, t: &Tensor) -> Option<usize> {
        self.tensor_backend_id(t)
            .or_else(|| t.view_src().and_then(|vs| self.tensor_backend_id(&vs)))
    }

    fn set_backend_id(&mut self, t: &Tensor, id: usize, cause: &'static str) {
        self.hv_backend_ids.insert(t.id(), id);
        if self.debug >= 3 {
            self.causes.insert(t.id(), cause);
        }
    }

    fn copy_of(&self, t: &Tensor, backend_id: usize, copy: usize) -> Option<Tensor> {
        self.hv_copies.get(&(t.id(), backend_id, copy)).cloned()
    }

    /// Highest-priority backend that can address the tensor's buffer and
    /// run `op`.
    fn backend_from_buffer(&self, tensor: &Tensor, op: &Tensor) -> Option<usize> {
        let buffer = match tensor.view_src() {
            Some(vs) => vs.buffer(),
            None => tensor.buffer(),
        };
        let buffer = buffer?;
        let buft = buffer.buft();
        for (i, b) in self.backends.iter().enumerate() {
            if b.supports_buft(&buft) && b.supports_op(op) {
                return Some(i);
            }
        }
        debug!(
            tensor = %tensor.name(),
            buffer = buffer.name(),
            "no backend supports this op with a weight in this buffer type; it will be copied"
        );
        None
    }

    /// The preferred backend for a tensor, from its current placement:
    /// pre-allocated buffer, view source, graph input, then weights.
    fn backend_id_from_cur(&mut self, tensor: &Tensor) -> Result<Option<usize>> {
        if let Some(id) = self.backend_from_buffer(tensor, tensor) {
            self.set_backend_id(tensor, id, "1.dst");
            return Ok(Some(id));
        }

        if let Some(vs) = tensor.view_src() {
            if let Some(id) = self.backend_from_buffer(&vs, tensor) {
                self.set_backend_id(tensor, id, "1.vsrc");
                return Ok(Some(id));
            }
        }

        let pre_allocated =
            tensor.buffer().is_some() || tensor.view_src().is_some_and(|vs| vs.buffer().is_some());
        if pre_allocated {
            // the tensor cannot be moved to another backend
            let buffer = match tensor.view_src() {
                Some(vs) => vs.buffer(),
                None => tensor.buffer(),
            };
            return Err(Error::new(ErrorKind::IncompatiblePreAllocation {
                tensor: tensor.name(),
                buffer: buffer.map_or("?", |b| b.name()),
            }));
        }

        if tensor.flags() & flags::INPUT != 0 {
            // graph inputs start on the lowest-priority backend
            let id = self.backends.len() - 1;
            self.set_backend_id(tensor, id, "1.inp");
            return Ok(Some(id));
        }

        // ops reading weights prefer the weights' backend; skip ROPE, its
        // frequency tensor is too small to matter
        for i in 0..MAX_SRC {
            let Some(src) = tensor.src(i) else { continue };
            let is_weight =
                src.buffer().is_some_and(|b| b.usage() == BufferUsage::Weights);
            if tensor.op() != Op::Rope && is_weight {
                let src_backend_id = self.backend_from_buffer(&src, tensor);
                // a higher-priority backend may want to offload the op
                if self.op_offload
                    && src_backend_id == Some(self.backends.len() - 1)
                    && src.buffer().is_some_and(|b| b.is_host())
                {
                    for b in 0..self.backends.len() - 1 {
                        if self.backends[b].supports_op(tensor)
                            && self.backends[b].offload_op(tensor)
                        {
                            self.set_backend_id(tensor, b, "1.off");
                            return Ok(Some(b));
                        }
                    }
                }
                if let Some(id) = src_backend_id {
                    self.set_backend_id(tensor, id, "1.wgt");
                }
                return Ok(src_backend_id);
            }
        }

        Ok(None)
    }

    /// Whether `backend_id` can address the buffer type `t` lives in (or
    /// will live in, judging by its assignment).
    fn buffer_supported(&self, t: &Tensor, backend_id: usize) -> bool {
        let buf = match t.view_src() {
            Some(vs) => vs.buffer(),
            None => t.buffer(),
        };
        let buft = match buf {
            Some(b) => Some(b.buft()),
            None => self.effective_backend_id(t).map(|id| self.bufts[id].clone()),
        };
        buft.is_some_and(|buft| self.backends[backend_id].supports_buft(&buft))
    }

    fn set_if_supported(&mut self, node: &Tensor, cur_backend_id: usize) {
        if self.backends[cur_backend_id].supports_op(node) {
            self.set_backend_id(node, cur_backend_id, "2.sup");
        }
    }

    /// Pass 2: propagate assignments to adjacent unassigned nodes. With
    /// `skip_cpu`, the lowest-priority backend does not propagate, so it
    /// cannot colonise regions a faster backend could run.
    fn expand_pass(&mut self, graph: &Graph, forward: bool, skip_cpu: bool) {
        let n = graph.n_nodes();
        let indices: Vec<usize> = if forward { (0..n).collect() } else { (0..n).rev().collect() };
        let mut cur_backend_id: Option<usize> = None;
        for i in indices {
            let node = graph.node(i).clone();
            if is_view_op(node.op()) {
                continue;
            }
            match self.tensor_backend_id(&node) {
                Some(id) => {
                    cur_backend_id = if skip_cpu && id == self.backends.len() - 1 {
                        None
                    } else {
                        Some(id)
                    };
                }
                None => {
                    if let Some(cur) = cur_backend_id {
                        self.set_if_supported(&node, cur);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // splitting
    // -----------------------------------------------------------------

    /// Assigns backends to every tensor and cuts the graph into splits with
    /// their input copies. Mutates `graph`: foreign sources are rewritten
    /// to their local copies and split ranges may be reordered by the
    /// backend's optimize hook.
    fn split_graph(&mut self, graph: &mut Graph) -> Result<()> {
        self.splits.clear();
        self.graph_inputs.clear();
        self.is_reset = false;

        // pass 1: seed from current tensor placement
        for leaf in graph.leafs() {
            if self.tensor_backend_id(leaf).is_none() {
                self.backend_id_from_cur(&leaf.clone())?;
            }
        }
        for i in 0..graph.n_nodes() {
            let node = graph.node(i).clone();
            if self.tensor_backend_id(&node).is_none() {
                self.backend_id_from_cur(&node)?;
            }
        }

        // pass 2: expand assignments to neighbours; first the faster
        // backends in both directions, then the rest
        self.expand_pass(graph, true, true);
        self.expand_pass(graph, false, true);
        self.expand_pass(graph, true, false);
        self.expand_pass(graph, false, false);

        // pass 3: upgrade to a higher-priority backend with the same
        // buffer type; assign leftovers to the backend with most local srcs
        for i in 0..graph.n_nodes() {
            let node = graph.node(i).clone();
            if is_view_op(node.op()) {
                continue;
            }
            match self.tensor_backend_id(&node) {
                None => {
                    let mut n_supported_best: i32 = -1;
                    let mut best: Option<usize> = None;
                    for b in 0..self.backends.len() {
                        if self.backends[b].supports_op(&node) {
                            let mut n_supported = 0;
                            for src in node.srcs() {
                                if self.effective_backend_id(&src).is_some()
                                    && self.buffer_supported(&src, b)
                                {
                                    n_supported += 1;
                                }
                            }
                            if n_supported > n_supported_best {
                                n_supported_best = n_supported;
                                best = Some(b);
                            }
                        }
                    }
                    if let Some(b) = best {
                        self.set_backend_id(&node, b, "3.best");
                    }
                }
                Some(id) => {
                    for b in 0..id {
                        if self.bufts[b] == self.bufts[id]
                            && self.backends[b].supports_op(&node)
                        {
                            let all_supported =
                                node.srcs().iter().all(|s| self.buffer_supported(s, b));
                            if all_supported {
                                self.set_backend_id(&node, b, "3.upg");
                                break;
                            }
                        }
                    }
                }
            }
        }

        // pass 4: propagate to remaining sources, from view sources or the
        // consuming node
        for i in 0..graph.n_nodes() {
            let node = graph.node(i).clone();
            if self.tensor_backend_id(&node).is_none() {
                if let Some(vs) = node.view_src() {
                    if let Some(id) = self.tensor_backend_id(&vs) {
                        self.set_backend_id(&node, id, "4.vsrc");
                    }
                }
            }
            for src in node.srcs() {
                if self.tensor_backend_id(&src).is_none() {
                    if let Some(vs) = src.view_src() {
                        // views always live with their source
                        if let Some(id) = self.tensor_backend_id(&vs) {
                            self.set_backend_id(&src, id, "4.vsrc");
                        }
                    } else if let Some(id) = self.tensor_backend_id(&node) {
                        self.set_backend_id(&src, id, "4.cur");
                    }
                }
            }
            if self.tensor_backend_id(&node).is_none() {
                for b in 0..self.backends.len() {
                    if self.backends[b].supports_op(&node) {
                        self.set_backend_id(&node, b, "4.any");
                        break;
                    }
                }
            }
            if self.tensor_backend_id(&node).is_none() {
                return Err(Error::new(ErrorKind::NoBackendForOp {
                    op: node.op(),
                    tensor: node.name(),
                }));
            }
        }

        // pass 5: cut into splits and materialise input copies
        if graph.n_nodes() > 0 {
            self.build_splits(graph);
        }

        if self.debug > 0 {
            self.print_assignments(graph);
        }

        // track stability against the previous run
        std::mem::swap(&mut self.node_backend_ids, &mut self.prev_node_backend_ids);
        std::mem::swap(&mut self.leaf_backend_ids, &mut self.prev_leaf_backend_ids);
        self.build_composed_graph(graph);

        Ok(())
    }

    fn build_splits(&mut self, graph: &mut Graph) {
        let n = graph.n_nodes();

        let first_backend_id = (0..n)
            .map(|i| graph.node(i))
            .find(|node| !is_view_op(node.op()))
            .and_then(|node| self.tensor_backend_id(node))
            .unwrap_or(self.backends.len() - 1);

        let mut split = SchedSplit {
            backend_id: first_backend_id,
            i_start: 0,
            i_end: n,
            inputs: Vec::new(),
            graph: Graph::default(),
        };
        let mut cur_backend_id = first_backend_id;

        for i in 0..n {
            let node = graph.node(i).clone();
            if is_view_op(node.op()) {
                continue;
            }

            let node_backend_id =
                self.tensor_backend_id(&node).expect("all nodes assigned after pass 4");

            // a weight on a foreign, incompatible backend forces a new
            // split so the previous split's copy buffers can be recycled
            let mut need_new_split = false;
            if node_backend_id == cur_backend_id && !split.inputs.is_empty() {
                for src in node.srcs() {
                    let is_weight =
                        src.buffer().is_some_and(|b| b.usage() == BufferUsage::Weights);
                    if is_weight {
                        let src_backend_id = self.tensor_backend_id(&src);
                        if src_backend_id != Some(cur_backend_id)
                            && !self.buffer_supported(&src, cur_backend_id)
                        {
                            need_new_split = true;
                            break;
                        }
                    }
                    if split.inputs.len() == SCHED_MAX_SPLIT_INPUTS {
                        let src_backend_id = self.tensor_backend_id(&src);
                        if src_backend_id != Some(cur_backend_id)
                            && self.copy_of(&src, cur_backend_id, 0).is_none()
                            && !self.buffer_supported(&src, cur_backend_id)
                        {
                            need_new_split = true;
                            break;
                        }
                    }
                }
            }

            if node_backend_id != cur_backend_id || need_new_split {
                split.i_end = i;
                self.splits.push(split);
                split = SchedSplit {
                    backend_id: node_backend_id,
                    i_start: i,
                    i_end: n,
                    inputs: Vec::new(),
                    graph: Graph::default(),
                };
                cur_backend_id = node_backend_id;
            }

            // find inputs that are not on the split's backend
            for j in 0..MAX_SRC {
                let Some(src) = node.src(j) else { continue };
                let src_backend_id =
                    self.tensor_backend_id(&src).expect("all sources assigned after pass 4");

                if src.flags() & flags::INPUT != 0 && self.n_copies > 1 {
                    // user inputs get a full ring of copies on their own
                    // backend, with the current slot backed by the original
                    if self.copy_of(&src, src_backend_id, 0).is_none() {
                        let backend_name = self.backends[src_backend_id].name();
                        for c in 0..self.n_copies {
                            let tensor_copy = if c == self.cur_copy {
                                src.clone()
                            } else {
                                let cp = dup_tensor_layout(&src);
                                cp.set_name(format!("{}#{}#{}", backend_name, src.name(), c));
                                cp
                            };
                            // keep every copy out of the allocator's reuse
                            tensor_copy.set_input();
                            tensor_copy.set_output();
                            self.hv_copies.insert((src.id(), src_backend_id, c), tensor_copy);
                        }
                        self.graph_inputs.push(src.clone());
                        assert!(self.graph_inputs.len() <= SCHED_MAX_SPLIT_INPUTS);
                    }
                }

                if src_backend_id != cur_backend_id
                    && !self.buffer_supported(&src, cur_backend_id)
                {
                    if self.copy_of(&src, cur_backend_id, 0).is_none() {
                        let backend_name = self.backends[cur_backend_id].name();
                        for c in 0..self.n_copies {
                            let cp = dup_tensor_layout(&src);
                            cp.set_name(format!("{}#{}#{}", backend_name, src.name(), c));
                            if self.n_copies > 1 {
                                cp.set_input();
                                cp.set_output();
                            }
                            self.hv_copies.insert((src.id(), cur_backend_id, c), cp);
                        }
                        split.inputs.push(src.clone());
                        assert!(split.inputs.len() <= SCHED_MAX_SPLIT_INPUTS);
                    }
                    let cpy = self.copy_of(&src, cur_backend_id, self.cur_copy).unwrap();
                    node.set_src(j, Some(cpy));
                }
            }
        }

        split.i_end = n;
        self.splits.push(split);
    }

    /// Concatenates all splits into the composed graph the allocator sees:
    /// per split, an input-dependency view plus the input copy for every
    /// input, then the split's nodes. With pipelining, every copy is also
    /// appended as a leaf so it gets its own stable, non-overlapping slot.
    fn build_composed_graph(&mut self, graph: &mut Graph) {
        self.node_backend_ids.clear();
        self.leaf_backend_ids.clear();
        self.graph = Graph::default();

        for si in 0..self.splits.len() {
            let (i_start, i_end, backend_id) = {
                let s = &self.splits[si];
                (s.i_start, s.i_end, s.backend_id)
            };

            // reorder inside the split before anything records node order
            let backend = self.backends[backend_id].clone();
            backend.graph_optimize(&mut graph.nodes_mut()[i_start..i_end]);
            self.splits[si].graph = Graph::from_nodes(graph.nodes()[i_start..i_end].to_vec());

            let inputs = self.splits[si].inputs.clone();
            for input in inputs {
                let input_backend_id =
                    self.tensor_backend_id(&input).expect("split input assigned");
                let input_cpy = self
                    .copy_of(&input, backend_id, self.cur_copy)
                    .expect("split input has copies");

                // dependency on the producer, so it is not freed before the
                // copy is scheduled
                let input_dep = view_tensor(&input);
                input_dep.set_src(0, Some(input.clone()));
                self.node_backend_ids.push(input_backend_id);
                self.graph.push_node(input_dep);

                // the copy itself, allocated at the start of the split
                self.node_backend_ids.push(backend_id);
                self.graph.push_node(input_cpy);
            }

            for j in i_start..i_end {
                let node = graph.node(j).clone();
                let id = self.tensor_backend_id(&node).expect("node assigned");
                self.node_backend_ids.push(id);
                self.graph.push_node(node);
            }
        }

        if self.n_copies > 1 {
            for input in self.graph_inputs.clone() {
                let backend_id = self.tensor_backend_id(&input).expect("graph input assigned");
                for c in 0..self.n_copies {
                    let cp = self.copy_of(&input, backend_id, c).unwrap();
                    self.leaf_backend_ids.push(backend_id);
                    self.graph.push_leaf(cp);
                }
            }
            for si in 0..self.splits.len() {
                let backend_id = self.splits[si].backend_id;
                let inputs = self.splits[si].inputs.clone();
                for input in inputs {
                    for c in 0..self.n_copies {
                        let cp = self.copy_of(&input, backend_id, c).unwrap();
                        self.leaf_backend_ids.push(backend_id);
                        self.graph.push_leaf(cp);
                    }
                }
            }
        }

        for leaf in graph.leafs() {
            // a leaf only reachable through view ops can stay unassigned;
            // it defaults to the fallback backend
            let id = self.tensor_backend_id(leaf).unwrap_or(self.backends.len() - 1);
            self.leaf_backend_ids.push(id);
            self.graph.push_leaf(leaf.clone());
        }
    }

    fn print_assignments(&self, graph: &Graph) {
        let mut cur_split = 0;
        for i in 0..graph.n_nodes() {
            if cur_split < self.splits.len() && i == self.splits[cur_split].i_start {
                let split = &self.splits[cur_split];
                debug!(
                    "## SPLIT #{cur_split}: {} # {} inputs",
                    self.backends[split.backend_id].name(),
                    split.inputs.len()
                );
                for input in &split.inputs {
                    debug!("  input: {} ({} bytes)", input.name(), input.nbytes());
                }
                cur_split += 1;
            }
            let node = graph.node(i);
            if is_view_op(node.op()) {
                continue;
            }
            if self.debug >= 2 {
                let backend = self
                    .get_tensor_backend(node)
                    .map_or("NULL", |b| b.name());
                let cause = if self.debug >= 3 {
                    self.causes.get(&node.id()).copied().unwrap_or("")
                } else {
                    ""
                };
                debug!("node #{i:4} ({:?}) {}: [{} {}]", node.op(), node.name(), backend, cause);
                if self.debug >= 4 {
                    for src in node.srcs() {
                        let src_backend = self
                            .get_tensor_backend(&src)
                            .map_or("NULL", |b| b.name());
                        debug!("    src: {} [{}]", src.name(), src_backend);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // allocation
    // -----------------------------------------------------------------

    fn alloc_splits(&mut self) -> Result<()> {
        let mut backend_ids_changed = self.node_backend_ids.len()
            != self.prev_node_backend_ids.len()
            || self.leaf_backend_ids.len() != self.prev_leaf_backend_ids.len();
        if !backend_ids_changed {
            for (a, b) in self.node_backend_ids.iter().zip(self.prev_node_backend_ids.iter()) {
                if a != b && self.bufts[*a] != self.bufts[*b] {
                    backend_ids_changed = true;
                    break;
                }
            }
        }
        if !backend_ids_changed {
            for (a, b) in self.leaf_backend_ids.iter().zip(self.prev_leaf_backend_ids.iter()) {
                if a != b && self.bufts[*a] != self.bufts[*b] {
                    backend_ids_changed = true;
                    break;
                }
            }
        }

        if !backend_ids_changed {
            match self.galloc.alloc_graph(&self.graph) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_needs_reserve() => {}
                Err(e) => return Err(e),
            }
        }

        // the re-allocation may move split inputs; wait for in-flight work
        // without touching next_copy
        for b in &self.backends {
            b.synchronize();
        }
        debug!(backend_ids_changed, "sched: failed to allocate graph, reserving");

        self.galloc.reserve(&self.graph, &self.node_backend_ids, &self.leaf_backend_ids)?;
        self.galloc
            .alloc_graph(&self.graph)
            .map_err(|e| e.context("failed to allocate graph after reserving"))
    }

    // -----------------------------------------------------------------
    // execution
    // -----------------------------------------------------------------

    fn compute_splits(&mut self) -> Status {
        let mut prev_ids_tensor: Option<Tensor> = None;
        let mut used_ids: Vec<bool> = Vec::new();

        for si in 0..self.splits.len() {
            let split_backend_id = self.splits[si].backend_id;
            let split_backend = self.backends[split_backend_id].clone();
            let inputs = self.splits[si].inputs.clone();

            // copy the input tensors to the split backend
            for (input_id, input) in inputs.iter().enumerate() {
                let input_backend = self
                    .get_tensor_backend(input)
                    .unwrap_or_else(|| self.backends.last().unwrap().clone());
                let input_cpy = self
                    .copy_of(input, split_backend_id, self.cur_copy)
                    .expect("split input has copies");

                if input.flags() & flags::INPUT != 0 {
                    // user data must be safe to overwrite right after this
                    // call, so the copy is blocking
                    match &self.events[split_backend_id][self.cur_copy] {
                        Some(event) => event.synchronize(),
                        None => split_backend.synchronize(),
                    }
                    buffer::tensor_copy(input, &input_cpy);
                } else {
                    // wait until the backend is done with the previous value
                    // of this copy slot
                    match &self.events[split_backend_id][self.cur_copy] {
                        Some(event) => event.wait(&split_backend),
                        None => split_backend.synchronize(),
                    }

                    let applied = self.try_expert_selective_copy(
                        si,
                        input_id,
                        input,
                        &input_cpy,
                        &input_backend,
                        &split_backend,
                        &mut prev_ids_tensor,
                        &mut used_ids,
                    );

                    if !applied
                        && !split_backend.cpy_tensor_async_from(&input_backend, input, &input_cpy)
                    {
                        // no async path: fall back to a synchronised
                        // blocking copy
                        input_backend.synchronize();
                        match &self.events[split_backend_id][self.cur_copy] {
                            Some(event) => event.synchronize(),
                            None => split_backend.synchronize(),
                        }
                        buffer::tensor_copy(input, &input_cpy);
                    }
                }
            }

            if self.callback_eval.is_none() {
                let ec = split_backend.graph_compute(&self.splits[si].graph);
                if ec != Status::Success {
                    return ec;
                }
            } else {
                let nodes = self.splits[si].graph.nodes().to_vec();
                let mut j0 = 0;
                while j0 < nodes.len() {
                    // grow the range until the user wants to observe a node
                    let mut j1 = j0;
                    let mut need =
                        (self.callback_eval.as_mut().unwrap())(&nodes[j0], true);
                    while !need && j1 < nodes.len() - 1 {
                        j1 += 1;
                        need = (self.callback_eval.as_mut().unwrap())(&nodes[j1], true);
                    }

                    let gv = Graph::from_nodes(nodes[j0..=j1].to_vec());
                    let ec = split_backend.graph_compute(&gv);
                    if ec != Status::Success {
                        return ec;
                    }
                    split_backend.synchronize();

                    if need && !(self.callback_eval.as_mut().unwrap())(&nodes[j1], false) {
                        // user requested a stop for this split
                        break;
                    }
                    j0 = j1 + 1;
                }
            }

            // record so the next user of this copy slot can wait
            if !inputs.is_empty() {
                if let Some(event) = &self.events[split_backend_id][self.cur_copy] {
                    event.record(&split_backend);
                }
            }
        }

        Status::Success
    }

    /// When a split starts with MUL_MAT_ID over host-resident expert
    /// weights, copy only the experts its ids actually select, in
    /// contiguous runs. Returns false when the shape does not apply; the
    /// caller then copies the full tensor.
    #[allow(clippy::too_many_arguments)]
    fn try_expert_selective_copy(
        &self,
        si: usize,
        input_id: usize,
        input: &Tensor,
        input_cpy: &Tensor,
        input_backend: &Backend,
        split_backend: &Backend,
        prev_ids_tensor: &mut Option<Tensor>,
        used_ids: &mut Vec<bool>,
    ) -> bool {
        let split = &self.splits[si];
        let Some(node) = split.graph.nodes().first().cloned() else {
            return false;
        };

        let usage_is_weights =
            input.buffer().is_some_and(|b| b.usage() == BufferUsage::Weights && b.is_host());
        if !(node.op() == Op::MulMatId
            && node.src(0).as_ref() == Some(input_cpy)
            && usage_is_weights)
        {
            return false;
        }

        let n_expert = input.ne()[2];
        let expert_size = input.nb()[2];

        input_backend.synchronize();

        // the ids may themselves be a split input that has not been copied
        // yet; read them from wherever the freshest copy lives
        let mut ids_tensor = match node.src(2) {
            Some(t) => t,
            None => return false,
        };
        let mut ids_backend = split_backend.clone();
        for i in input_id + 1..split.inputs.len() {
            let other = &split.inputs[i];
            if self.copy_of(other, split.backend_id, self.cur_copy).as_ref() == Some(&ids_tensor) {
                ids_tensor = other.clone();
                ids_backend = self
                    .get_tensor_backend(other)
                    .unwrap_or_else(|| split_backend.clone());
                break;
            }
        }

        if prev_ids_tensor.as_ref() != Some(&ids_tensor) {
            let mut bytes = vec![0u8; ids_tensor.nbytes()];
            ids_backend.get_tensor_async(&ids_tensor, &mut bytes, 0);
            ids_backend.synchronize();

            used_ids.clear();
            used_ids.resize(n_expert as usize, false);
            let ine = ids_tensor.ne();
            let inb = ids_tensor.nb();
            for i1 in 0..ine[1] as usize {
                for i0 in 0..ine[0] as usize {
                    let off = i1 * inb[1] + i0 * inb[0];
                    let id = i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
                    assert!(id >= 0 && (id as i64) < n_expert, "expert id out of range");
                    used_ids[id as usize] = true;
                }
            }
            *prev_ids_tensor = Some(ids_tensor);
        }

        let src_bytes =
            unsafe { std::slice::from_raw_parts(input.data(), input.nbytes()) };
        let copy_experts = |first_id: usize, last_id: usize| {
            let expert_offset = first_id * expert_size;
            let copy_size = (last_id - first_id + 1) * expert_size;
            // copy a bit extra past the run, so padded kernel reads of the
            // last expert see initialised bytes
            let padding = expert_size.min(EXPERT_COPY_PAD);
            let padding_end = if (last_id as i64) < n_expert - 1 { padding } else { 0 };
            split_backend.set_tensor_async(
                input_cpy,
                &src_bytes[expert_offset..expert_offset + copy_size + padding_end],
                expert_offset,
            );
        };

        // group consecutive used experts and copy each run at once
        let Some(first_used) = used_ids.iter().position(|&u| u) else {
            return true;
        };
        let mut first_id = first_used;
        let mut last_id = first_id;
        for id in first_id + 1..n_expert as usize {
            if !used_ids[id] {
                continue;
            }
            if id == last_id + 1 {
                last_id = id;
                continue;
            }
            copy_experts(first_id, last_id);
            first_id = id;
            last_id = id;
        }
        copy_experts(first_id, last_id);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::backend::{BackendImpl, Device, DeviceImpl, EventImpl};
    use crate::backend::buffer::{Buffer, BufferImpl, BufferTypeImpl};
    use crate::backend::cpu::{cpu_backend, cpu_buffer_type};
    use crate::talloc::alloc_tensors;
    use crate::tensor;
    use crate::types::TensorType;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    // ---- a self-contained device with its own buffer type and events ----

    struct TestBuffer {
        ptr: *mut u8,
        size: usize,
    }

    impl TestBuffer {
        fn alloc(size: usize) -> TestBuffer {
            let layout = Layout::from_size_align(size.max(1), 64).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            TestBuffer { ptr, size: size.max(1) }
        }
    }

    impl Drop for TestBuffer {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.size, 64).unwrap();
            unsafe { dealloc(self.ptr, layout) };
        }
    }

    impl BufferImpl for TestBuffer {
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

        fn clear(&self, size: usize, value: u8) {
            unsafe { std::ptr::write_bytes(self.ptr, value, size) };
        }
    }

    struct TestBufferType {
        name: &'static str,
    }

    impl BufferTypeImpl for TestBufferType {
        fn name(&self) -> &'static str {
            self.name
        }

        fn alloc_buffer(&self, buft: &BufferType, size: usize) -> Result<Buffer> {
            Ok(Buffer::new(buft.clone(), Box::new(TestBuffer::alloc(size)), size))
        }

        fn alignment(&self) -> usize {
            32
        }

        fn is_host(&self) -> bool {
            false
        }
    }

    struct TestEvent {
        id: usize,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl EventImpl for TestEvent {
        fn record(&self, backend: &Backend) {
            self.log.lock().unwrap().push(format!("record e{} {}", self.id, backend.name()));
        }

        fn wait(&self, backend: &Backend) {
            self.log.lock().unwrap().push(format!("wait e{} {}", self.id, backend.name()));
        }

        fn synchronize(&self) {
            self.log.lock().unwrap().push(format!("sync e{}", self.id));
        }
    }

    type SupportsFn = Box<dyn Fn(&Tensor) -> bool + Send + Sync>;

    struct TestDevice {
        name: &'static str,
        buft: BufferType,
        supports: SupportsFn,
        with_events: bool,
        event_seq: Mutex<usize>,
        event_log: Arc<Mutex<Vec<String>>>,
    }

    impl DeviceImpl for TestDevice {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> String {
            format!("{} (test)", self.name)
        }

        fn device_type(&self) -> DeviceType {
            DeviceType::Gpu
        }

        fn memory(&self) -> (usize, usize) {
            (0, 0)
        }

        fn buffer_type(&self) -> BufferType {
            self.buft.clone()
        }

        fn init_backend(&self, device: &Device) -> Backend {
            Backend::new(Rc::new(TestBackend { device: device.clone(), name: self.name }))
        }

        fn supports_op(&self, op: &Tensor) -> bool {
            (self.supports)(op)
        }

        fn supports_buft(&self, buft: &BufferType) -> bool {
            *buft == self.buft
        }

        fn event_new(&self, _device: &Device) -> Option<Event> {
            if !self.with_events {
                return None;
            }
            let mut seq = self.event_seq.lock().unwrap();
            let id = *seq;
            *seq += 1;
            Some(Event::new(Rc::new(TestEvent { id, log: self.event_log.clone() })))
        }
    }

    struct TestBackend {
        device: Device,
        name: &'static str,
    }

    impl BackendImpl for TestBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn device(&self) -> Device {
            self.device.clone()
        }

        fn graph_compute(&self, graph: &Graph) -> Status {
            // test buffers are host-addressable, so the reference kernels
            // can execute directly
            crate::backend::cpu::ops::compute_graph(graph)
        }
    }

    struct TestGpu {
        backend: Backend,
        buft: BufferType,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn make_gpu(name: &'static str, with_events: bool, supports: SupportsFn) -> TestGpu {
        let buft = BufferType::new(Arc::new(TestBufferType { name }));
        let log = Arc::new(Mutex::new(Vec::new()));
        let device = Device::new(Arc::new(TestDevice {
            name,
            buft: buft.clone(),
            supports,
            with_events,
            event_seq: Mutex::new(0),
            event_log: log.clone(),
        }));
        TestGpu { backend: device.init_backend(), buft, log }
    }

    fn write_f32(t: &Tensor, values: &[f32]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        buffer::tensor_set(t, &bytes, 0);
    }

    fn read_f32(t: &Tensor) -> Vec<f32> {
        let mut bytes = vec![0u8; t.nbytes()];
        buffer::tensor_get(t, &mut bytes, 0);
        bytes.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn test_empty_graph_has_no_splits() {
        let mut sched = Sched::new(vec![cpu_backend()], None, 16, false, false);
        let mut g = Graph::new();
        sched.alloc_graph(&mut g).unwrap();
        assert_eq!(sched.n_splits(), 0);
        assert_eq!(sched.graph_compute(&mut g), Status::Success);
    }

    #[test]
    fn test_single_backend_single_split() {
        crate::init_logging();
        let mut sched = Sched::new(vec![cpu_backend()], None, 128, false, false);

        let x = Tensor::new(TensorType::F32, &[4]);
        x.set_name("x");
        let y = Tensor::new(TensorType::F32, &[4]);
        y.set_name("y");
        let a = tensor::add(&x, &y);
        let b = tensor::scale(&a, 2.0);
        b.set_output();

        let mut g = Graph::new();
        g.build_forward_expand(&b);

        sched.alloc_graph(&mut g).unwrap();
        assert_eq!(sched.n_splits(), 1);
        assert!(sched.splits[0].inputs.is_empty());
        assert_eq!(sched.n_copies(), 1);

        write_f32(&x, &[1.0, 2.0, 3.0, 4.0]);
        write_f32(&y, &[0.5, 0.5, 0.5, 0.5]);
        assert_eq!(sched.graph_compute(&mut g), Status::Success);
        assert_eq!(read_f32(&b), vec![3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_two_backend_handoff() {
        let gpu = make_gpu("GPU", false, Box::new(|_: &Tensor| true));
        let mut sched =
            Sched::new(vec![gpu.backend.clone(), cpu_backend()], None, 128, false, false);

        // weights live on the GPU
        let w = Tensor::new(TensorType::F32, &[4, 2]);
        w.set_name("W");
        let wbuf = alloc_tensors(&[w.clone()], &gpu.buft).unwrap();
        wbuf.set_usage(BufferUsage::Weights);
        write_f32(&w, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0, -1.0, 2.0]);

        let a = Tensor::new(TensorType::F32, &[4]);
        a.set_name("A");
        a.set_input();
        let b = tensor::mul_mat(&w, &a);
        b.set_name("B");
        b.set_output();

        let mut g = Graph::new();
        g.build_forward_expand(&b);

        sched.alloc_graph(&mut g).unwrap();

        // one split on the GPU, with the input copied across
        assert_eq!(sched.n_splits(), 1);
        assert_eq!(sched.splits[0].backend_id, 0);
        assert_eq!(sched.splits[0].inputs, vec![a.clone()]);
        let cpy = sched.copy_of(&a, 0, 0).unwrap();
        assert_eq!(cpy.name(), "GPU#A#0");
        assert_eq!(cpy.buffer().unwrap().buft(), gpu.buft);

        // the input itself stays on the CPU
        assert_eq!(sched.get_tensor_backend(&a).unwrap().name(), "CPU");
        assert_eq!(sched.get_tensor_backend(&b).unwrap().name(), "GPU");

        write_f32(&a, &[2.0, 3.0, 4.0, 5.0]);
        assert_eq!(sched.graph_compute(&mut g), Status::Success);
        // rows of w are [1,0,0,1] and [1,1,-1,2]
        assert_eq!(read_f32(&b), vec![7.0, 11.0]);

        assert!(sched.get_buffer_size(&gpu.backend) > 0);
    }

    #[test]
    fn test_parallel_copy_ring_and_stability() {
        let gpu = make_gpu("GPU", true, Box::new(|_: &Tensor| true));
        let mut sched =
            Sched::new(vec![gpu.backend.clone(), cpu_backend()], None, 128, true, false);
        assert_eq!(sched.n_copies(), SCHED_MAX_COPIES);

        let w = Tensor::new(TensorType::F32, &[2, 2]);
        w.set_name("W");
        let wbuf = alloc_tensors(&[w.clone()], &gpu.buft).unwrap();
        wbuf.set_usage(BufferUsage::Weights);
        write_f32(&w, &[1.0, 2.0, 3.0, 4.0]);

        let mut step = |sched: &mut Sched, input: &[f32]| -> (Vec<f32>, *mut u8, usize) {
            let a = Tensor::new(TensorType::F32, &[2]);
            a.set_name("A");
            a.set_input();
            let b = tensor::mul_mat(&w, &a);
            b.set_name("B");
            b.set_output();
            let mut g = Graph::new();
            g.build_forward_expand(&b);

            sched.reset();
            sched.alloc_graph(&mut g).unwrap();
            let cur = sched.cur_copy;
            write_f32(&a, input);
            assert_eq!(sched.graph_compute(&mut g), Status::Success);
            (read_f32(&b), b.data(), cur)
        };

        let (r1, b1, c1) = step(&mut sched, &[1.0, 0.0]);
        assert_eq!(r1, vec![1.0, 3.0]);
        assert_eq!(c1, 0);

        let (r2, b2, c2) = step(&mut sched, &[0.0, 1.0]);
        assert_eq!(r2, vec![2.0, 4.0]);
        // the copy ring advanced, the layout did not
        assert_eq!(c2, 1);
        assert_eq!(b1, b2);

        // every split with inputs records its event slot
        let log = gpu.log.lock().unwrap();
        assert_eq!(log.iter().filter(|e| e.starts_with("record")).count(), 2);
    }

    #[test]
    fn test_event_wait_precedes_record_for_intermediates() {
        // SoftMax runs on the CPU, forcing a CPU split whose result is an
        // intermediate input of the GPU split
        let gpu = make_gpu("GPU", true, Box::new(|t: &Tensor| t.op() != Op::SoftMax));
        let mut sched =
            Sched::new(vec![gpu.backend.clone(), cpu_backend()], None, 128, true, false);

        let w = Tensor::new(TensorType::F32, &[2, 2]);
        w.set_name("W");
        let wbuf = alloc_tensors(&[w.clone()], &gpu.buft).unwrap();
        wbuf.set_usage(BufferUsage::Weights);
        write_f32(&w, &[1.0, 0.0, 0.0, 1.0]);

        let x = Tensor::new(TensorType::F32, &[2]);
        x.set_name("x");
        x.set_input();
        let s = tensor::soft_max(&x);
        s.set_name("s");
        let m = tensor::mul_mat(&w, &s);
        m.set_name("m");
        m.set_output();

        let mut g = Graph::new();
        g.build_forward_expand(&m);

        sched.alloc_graph(&mut g).unwrap();
        assert_eq!(sched.n_splits(), 2);
        assert_eq!(sched.splits[0].backend_id, 1);
        assert_eq!(sched.splits[1].backend_id, 0);
        // the GPU split consumes the intermediate s from the CPU
        assert_eq!(sched.splits[1].inputs, vec![s.clone()]);

        write_f32(&x, &[0.0, 0.0]);
        assert_eq!(sched.graph_compute(&mut g), Status::Success);
        assert_eq!(read_f32(&m), vec![0.5, 0.5]);

        let log = gpu.log.lock().unwrap();
        let first_wait = log.iter().position(|e| e.starts_with("wait"));
        let first_record = log.iter().position(|e| e.starts_with("record"));
        assert!(first_wait.is_some() && first_record.is_some());
        // the wait guards the copy slot before the split that records it
        assert!(first_wait.unwrap() < first_record.unwrap());
    }

    #[test]
    fn test_weight_driven_split() {
        let gpu = make_gpu("GPU", false, Box::new(|_: &Tensor| true));
        let mut sched =
            Sched::new(vec![gpu.backend.clone(), cpu_backend()], None, 128, false, false);

        // both weights stay in host memory, tagged as weights
        let w1 = Tensor::new(TensorType::F32, &[2, 2]);
        w1.set_name("W1");
        let w2 = Tensor::new(TensorType::F32, &[2, 2]);
        w2.set_name("W2");
        let wbuf = alloc_tensors(&[w1.clone(), w2.clone()], &cpu_buffer_type()).unwrap();
        wbuf.set_usage(BufferUsage::Weights);
        write_f32(&w1, &[1.0, 0.0, 0.0, 1.0]);
        write_f32(&w2, &[2.0, 0.0, 0.0, 2.0]);

        let a = Tensor::new(TensorType::F32, &[2]);
        a.set_name("A");
        a.set_input();
        let h1 = tensor::mul_mat(&w1, &a);
        h1.set_name("H1");
        let h2 = tensor::mul_mat(&w2, &h1);
        h2.set_name("H2");
        h2.set_output();

        let mut g = Graph::new();
        g.build_forward_expand(&h2);

        // force both matmuls onto the GPU; the weights cannot follow
        sched.set_tensor_backend(&h1, &gpu.backend);
        sched.set_tensor_backend(&h2, &gpu.backend);
        sched.alloc_graph(&mut g).unwrap();

        // same backend on both sides, but W2's host buffer forces a split
        // so the first split's weight copy can be recycled
        assert_eq!(sched.n_splits(), 2);
        assert_eq!(sched.splits[0].backend_id, 0);
        assert_eq!(sched.splits[1].backend_id, 0);
        assert!(sched.splits[0].inputs.contains(&w1));
        assert!(sched.splits[0].inputs.contains(&a));
        assert_eq!(sched.splits[1].inputs, vec![w2.clone()]);

        write_f32(&a, &[3.0, 4.0]);
        assert_eq!(sched.graph_compute(&mut g), Status::Success);
        assert_eq!(read_f32(&h2), vec![6.0, 8.0]);
    }

    #[test]
    fn test_expert_selective_copy() {
        let gpu = make_gpu("GPU", false, Box::new(|_: &Tensor| true));
        let mut sched =
            Sched::new(vec![gpu.backend.clone(), cpu_backend()], None, 128, false, false);

        // 4 experts of [k=16, n=16]: each expert is 1024 bytes, above the
        // copy padding, so unused experts past the pad stay untouched
        let n_expert = 4i64;
        let experts = Tensor::new(TensorType::F32, &[16, 16, n_expert]);
        experts.set_name("experts");
        let ebuf = alloc_tensors(&[experts.clone()], &cpu_buffer_type()).unwrap();
        ebuf.set_usage(BufferUsage::Weights);
        let evals: Vec<f32> = (0..16 * 16 * n_expert).map(|i| (i % 7) as f32 - 3.0).collect();
        write_f32(&experts, &evals);

        let b = Tensor::new(TensorType::F32, &[16, 1, 1]);
        b.set_name("b");
        b.set_input();
        let ids = Tensor::new(TensorType::I32, &[1, 1]);
        ids.set_name("ids");
        ids.set_input();
        let out = tensor::mul_mat_id(&experts, &b, &ids);
        out.set_name("out");
        out.set_output();

        let mut g = Graph::new();
        g.build_forward_expand(&out);

        sched.set_tensor_backend(&out, &gpu.backend);
        sched.alloc_graph(&mut g).unwrap();
        assert_eq!(sched.n_splits(), 1);
        assert!(sched.splits[0].inputs.contains(&experts));

        write_f32(&b, &(0..16).map(|i| i as f32 * 0.25).collect::<Vec<_>>());
        buffer::tensor_set(&ids, &0i32.to_le_bytes(), 0);

        assert_eq!(sched.graph_compute(&mut g), Status::Success);

        // reference result for expert 0
        let expert_cpy = sched.copy_of(&experts, 0, 0).unwrap();
        let got = read_f32(&out);
        let bv = read_f32(&b);
        for i in 0..16 {
            let mut want = 0.0f64;
            for k in 0..16 {
                want += (evals[i * 16 + k] * bv[k]) as f64;
            }
            assert!((got[i] - want as f32).abs() < 1e-3, "lane {i}: {} vs {want}", got[i]);
        }

        // only expert 0 plus the 512-byte pad were copied; the tail of
        // expert 1 and everything after stays zero in the device copy
        let copied = read_f32(&expert_cpy);
        let floats_per_expert = 16 * 16;
        let pad_floats = EXPERT_COPY_PAD / 4;
        for i in 0..floats_per_expert {
            assert_eq!(copied[i], evals[i], "expert 0 must be copied");
        }
        for i in floats_per_expert + pad_floats..2 * floats_per_expert {
            assert_eq!(copied[i], 0.0, "tail of expert 1 must not be copied");
        }
        for i in 2 * floats_per_expert..copied.len() {
            assert_eq!(copied[i], 0.0, "unused experts must not be copied");
        }
    }

    #[test]
    fn test_eval_callback_ranges() {
        use std::cell::RefCell;

        let mut sched = Sched::new(vec![cpu_backend()], None, 128, false, false);

        let x = Tensor::new(TensorType::F32, &[4]);
        x.set_name("x");
        let y = Tensor::new(TensorType::F32, &[4]);
        y.set_name("y");
        let a = tensor::add(&x, &y);
        a.set_name("a");
        let b = tensor::scale(&a, 2.0);
        b.set_name("b");
        let c = tensor::sqr(&b);
        c.set_name("c");
        c.set_output();

        let mut g = Graph::new();
        g.build_forward_expand(&c);

        let calls: Rc<RefCell<Vec<(String, bool)>>> = Rc::new(RefCell::new(Vec::new()));
        let calls_cb = calls.clone();
        sched.set_eval_callback(Some(Box::new(move |t: &Tensor, ask: bool| {
            calls_cb.borrow_mut().push((t.name(), ask));
            // observe only b; never stop
            !ask || t.name() == "b"
        })));

        sched.alloc_graph(&mut g).unwrap();
        write_f32(&x, &[1.0; 4]);
        write_f32(&y, &[2.0; 4]);
        assert_eq!(sched.graph_compute(&mut g), Status::Success);
        assert_eq!(read_f32(&c), vec![36.0; 4]);

        let calls = calls.borrow();
        assert_eq!(
            calls.as_slice(),
            &[
                ("a".to_string(), true),
                ("b".to_string(), true),
                ("b".to_string(), false),
                ("c".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_reserve_avoids_reallocation() {
        let mut sched = Sched::new(vec![cpu_backend()], None, 128, false, false);

        fn build() -> Graph {
            let x = Tensor::new(TensorType::F32, &[64]);
            x.set_name("x");
            x.set_input();
            let a = tensor::relu(&x);
            let b = tensor::soft_max(&a);
            b.set_output();
            let mut g = Graph::new();
            g.build_forward_expand(&b);
            g
        }

        let mut measure = build();
        sched.reserve(&mut measure).unwrap();
        let reserved = sched.galloc.buffer(0).unwrap().clone();
        assert!(reserved.size() > 0);

        let mut g = build();
        sched.alloc_graph(&mut g).unwrap();
        // the reservation covered this graph, no new buffer was made
        assert_eq!(sched.galloc.buffer(0).unwrap(), &reserved);
    }

    #[test]
    fn test_alloc_twice_requires_reset() {
        let mut sched = Sched::new(vec![cpu_backend()], None, 128, false, false);
        let x = Tensor::new(TensorType::F32, &[4]);
        let a = tensor::relu(&x);
        let mut g = Graph::new();
        g.build_forward_expand(&a);

        sched.alloc_graph(&mut g).unwrap();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = sched.alloc_graph(&mut g);
        }));
        assert!(r.is_err(), "alloc_graph without reset must be rejected");
    }
}
