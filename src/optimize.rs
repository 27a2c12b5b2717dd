//! Node reordering to improve concurrency inside a split.
//!
//! Matmul-like ops that read the same activations (`src[1]`) are stacked
//! next to each other within a small forward window, so backends can batch
//! or interleave them. The pass moves whole fusion groups, never individual
//! nodes, and only when the move provably crosses no data dependency. It is
//! an optimisation: correctness never depends on it running.

use crate::tensor::{are_same_shape, Tensor, TensorId};
use crate::types::{self, Op};
use std::collections::HashSet;

/// Max nodes in one fusion group.
const FUSE_MAX_NODES: usize = 16;

/// How many nodes ahead a matmul-like group may be hoisted from.
const STACK_WINDOW: usize = 8;

fn is_matmul_like(op: Op) -> bool {
    matches!(op, Op::MulMat | Op::MulMatId)
}

fn starts_fusion(op: Op) -> bool {
    matches!(op, Op::Add | Op::Norm | Op::RmsNorm)
}

fn continues_fusion(op: Op) -> bool {
    matches!(op, Op::Add | Op::Mul | Op::Norm | Op::RmsNorm)
}

/// Consecutive nodes are fuseable when the second consumes the first
/// directly and elementwise.
fn fuseable_pair(prev: &Tensor, next: &Tensor) -> bool {
    next.src(0).as_ref() == Some(prev) && are_same_shape(prev, next)
}

pub fn graph_optimize(nodes: &mut [Tensor]) {
    let n = nodes.len();
    if n < 3 {
        return;
    }

    // partition into groups: fusion chains stay together, everything else
    // is a singleton
    let mut groups: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        if starts_fusion(nodes[i].op()) {
            while j < n
                && j - i < FUSE_MAX_NODES
                && continues_fusion(nodes[j].op())
                && fuseable_pair(&nodes[j - 1], &nodes[j])
            {
                j += 1;
            }
        }
        groups.push((i, j));
        i = j;
    }

    let n_groups = groups.len();
    let mut emitted = vec![false; n_groups];
    let mut order: Vec<usize> = Vec::with_capacity(n_groups);

    for g in 0..n_groups {
        if emitted[g] {
            continue;
        }
        emitted[g] = true;
        order.push(g);

        let head = &nodes[groups[g].0];
        if !is_matmul_like(head.op()) {
            continue;
        }
        let Some(shared) = head.src(1) else { continue };

        // outputs of the groups we jump over; a hoisted group may not read
        // any of them
        let mut skipped: HashSet<TensorId> = HashSet::new();
        let mut dist = 0usize;

        for h in g + 1..n_groups {
            if emitted[h] {
                continue;
            }
            let (hs, he) = groups[h];
            dist += he - hs;
            if dist > STACK_WINDOW {
                break;
            }

            let is_candidate = is_matmul_like(nodes[hs].op())
                && nodes[hs].src(1).is_some_and(|s| s == shared);

            if is_candidate && group_is_movable(&nodes[hs..he], &skipped) {
                emitted[h] = true;
                order.push(h);
            } else {
                for k in hs..he {
                    skipped.insert(nodes[k].id());
                }
            }
        }
    }

    let reordered: Vec<Tensor> = order
        .iter()
        .flat_map(|&g| nodes[groups[g].0..groups[g].1].iter().cloned())
        .collect();
    nodes.clone_from_slice(&reordered);
}

fn group_is_movable(group: &[Tensor], skipped: &HashSet<TensorId>) -> bool {
    for t in group {
        // aliased storage hides write hazards from the identity check
        if t.is_view() || types::is_view_op(t.op()) {
            return false;
        }
        for src in t.srcs() {
            if skipped.contains(&src.id()) {
                return false;
            }
            if let Some(vs) = src.view_src() {
                if skipped.contains(&vs.id()) {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{self, Tensor};
    use crate::types::TensorType;

    fn leaf(ne: &[i64]) -> Tensor {
        Tensor::new(TensorType::F32, ne)
    }

    #[test]
    fn test_stacks_matmuls_sharing_activations() {
        let x = leaf(&[16, 4]);
        let w1 = leaf(&[16, 8]);
        let w2 = leaf(&[16, 8]);
        let other = leaf(&[4]);

        let m1 = tensor::mul_mat(&w1, &x).set_name("m1").clone();
        let indep = tensor::relu(&other).set_name("indep").clone();
        let m2 = tensor::mul_mat(&w2, &x).set_name("m2").clone();

        let mut nodes = vec![m1.clone(), indep.clone(), m2.clone()];
        graph_optimize(&mut nodes);

        assert_eq!(nodes, vec![m1, m2, indep]);
    }

    #[test]
    fn test_does_not_cross_dependencies() {
        let x = leaf(&[16, 4]);
        let w1 = leaf(&[16, 16]);

        let m1 = tensor::mul_mat(&w1, &x);
        let h = tensor::relu(&m1);
        // reads h, so it may not jump over it
        let m2 = tensor::mul_mat(&h, &x);

        let mut nodes = vec![m1.clone(), h.clone(), m2.clone()];
        graph_optimize(&mut nodes);

        assert_eq!(nodes, vec![m1, h, m2]);
    }

    #[test]
    fn test_fusion_group_moves_as_a_unit() {
        let x = leaf(&[16, 4]);
        let w1 = leaf(&[16, 8]);
        let w2 = leaf(&[16, 8]);
        let p = leaf(&[4, 4]);
        let q = leaf(&[4, 4]);

        let m1 = tensor::mul_mat(&w1, &x);
        let a = tensor::add(&p, &q);
        let b = tensor::mul(&a, &q);
        let m2 = tensor::mul_mat(&w2, &x);

        let mut nodes = vec![m1.clone(), a.clone(), b.clone(), m2.clone()];
        graph_optimize(&mut nodes);

        // m2 is hoisted over the whole (a, b) fusion group
        assert_eq!(nodes, vec![m1, m2, a, b]);
    }

    #[test]
    fn test_window_limits_the_hoist() {
        let x = leaf(&[16, 4]);
        let w1 = leaf(&[16, 8]);
        let w2 = leaf(&[16, 8]);

        let m1 = tensor::mul_mat(&w1, &x);
        let mut nodes = vec![m1];
        // nine independent fillers push the second matmul out of the window
        for i in 0..9 {
            let t = leaf(&[4]);
            nodes.push(tensor::relu(&t).set_name(format!("f{i}")).clone());
        }
        let m2 = tensor::mul_mat(&w2, &x);
        nodes.push(m2.clone());

        let before = nodes.clone();
        graph_optimize(&mut nodes);
        assert_eq!(nodes, before);
    }
}
