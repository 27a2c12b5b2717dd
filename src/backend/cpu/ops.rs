//! Reference f32 kernels for the CPU backend.
//!
//! Every kernel walks the destination extents and indexes through the byte
//! strides, so views, permuted operands and in-place storage reuse all work.
//! Coverage is the op enum at f32 precision (ids in i32); anything else is
//! reported as a compute failure rather than silently ignored.

use crate::tensor::{Graph, Tensor};
use crate::types::{self, Op, Status, TensorType, UnaryOp};
use tracing::error;

pub(crate) fn compute_graph(graph: &Graph) -> Status {
    for node in graph.nodes() {
        if node.op() == Op::None || types::is_view_op(node.op()) {
            continue;
        }
        if node.is_empty() {
            continue;
        }
        if let Err(msg) = compute_node(node) {
            error!("cpu: failed to compute {:?}: {}", node, msg);
            return Status::Failed;
        }
    }
    Status::Success
}

fn compute_node(node: &Tensor) -> Result<(), String> {
    match node.op() {
        Op::Add => binary(node, |a, b| a + b),
        Op::Sub => binary(node, |a, b| a - b),
        Op::Mul => binary(node, |a, b| a * b),
        Op::Div => binary(node, |a, b| a / b),
        Op::Add1 => {
            let b = node.src(1).ok_or("missing src1")?;
            require_f32(&b)?;
            let v = unsafe { *(b.data() as *const f32) };
            unary_impl(node, |a| a + v)
        }
        Op::Sqr => unary_impl(node, |a| a * a),
        Op::Sqrt => unary_impl(node, f32::sqrt),
        Op::Log => unary_impl(node, f32::ln),
        Op::Scale => {
            let s = node.op_param_f32(0);
            unary_impl(node, move |a| a * s)
        }
        Op::Unary => {
            let u = UnaryOp::from_i32(node.op_param_i32(0)).ok_or("unknown unary op")?;
            match u {
                UnaryOp::Abs => unary_impl(node, f32::abs),
                UnaryOp::Sgn => unary_impl(node, f32::signum),
                UnaryOp::Neg => unary_impl(node, |a| -a),
                UnaryOp::Relu => unary_impl(node, |a| a.max(0.0)),
                UnaryOp::Gelu => unary_impl(node, |a| {
                    0.5 * a * (1.0 + ((2.0f32 / std::f32::consts::PI).sqrt() * (a + 0.044715 * a * a * a)).tanh())
                }),
                UnaryOp::Silu => unary_impl(node, |a| a / (1.0 + (-a).exp())),
            }
        }
        Op::DiagMaskInf => diag_mask(node, f32::NEG_INFINITY),
        Op::DiagMaskZero => diag_mask(node, 0.0),
        Op::Norm => norm(node, false),
        Op::RmsNorm => norm(node, true),
        Op::SoftMax => soft_max(node),
        Op::Rope => rope(node),
        Op::MulMat => mul_mat(node),
        Op::MulMatId => mul_mat_id(node),
        op => Err(format!("op {op:?} is not supported by the reference kernels")),
    }
}

fn require_f32(t: &Tensor) -> Result<(), String> {
    if t.ttype() != TensorType::F32 {
        return Err(format!(
            "reference kernels only support f32, got {}",
            types::type_name(t.ttype())
        ));
    }
    Ok(())
}

#[inline]
unsafe fn f32_at(data: *mut u8, nb: &[usize; 4], i0: usize, i1: usize, i2: usize, i3: usize) -> *mut f32 {
    unsafe { data.add(i0 * nb[0] + i1 * nb[1] + i2 * nb[2] + i3 * nb[3]) as *mut f32 }
}

#[inline]
unsafe fn i32_at(data: *mut u8, nb: &[usize; 4], i0: usize, i1: usize, i2: usize, i3: usize) -> *const i32 {
    unsafe { data.add(i0 * nb[0] + i1 * nb[1] + i2 * nb[2] + i3 * nb[3]) as *const i32 }
}

/// dst[i] = f(a[i], b[i mod b.ne]); b broadcasts over any divisor shape.
fn binary(node: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<(), String> {
    let a = node.src(0).ok_or("missing src0")?;
    let b = node.src(1).ok_or("missing src1")?;
    require_f32(node)?;
    require_f32(&a)?;
    require_f32(&b)?;

    let ne = node.ne();
    let (dnb, anb, bnb) = (node.nb(), a.nb(), b.nb());
    let bne = b.ne();
    let (dp, ap, bp) = (node.data(), a.data(), b.data());

    for i3 in 0..ne[3] as usize {
        for i2 in 0..ne[2] as usize {
            for i1 in 0..ne[1] as usize {
                for i0 in 0..ne[0] as usize {
                    unsafe {
                        let av = *f32_at(ap, &anb, i0, i1, i2, i3);
                        let bv = *f32_at(
                            bp,
                            &bnb,
                            i0 % bne[0] as usize,
                            i1 % bne[1] as usize,
                            i2 % bne[2] as usize,
                            i3 % bne[3] as usize,
                        );
                        *f32_at(dp, &dnb, i0, i1, i2, i3) = f(av, bv);
                    }
                }
            }
        }
    }
    Ok(())
}

fn unary_impl(node: &Tensor, f: impl Fn(f32) -> f32) -> Result<(), String> {
    let a = node.src(0).ok_or("missing src0")?;
    require_f32(node)?;
    require_f32(&a)?;

    let ne = node.ne();
    let (dnb, anb) = (node.nb(), a.nb());
    let (dp, ap) = (node.data(), a.data());

    for i3 in 0..ne[3] as usize {
        for i2 in 0..ne[2] as usize {
            for i1 in 0..ne[1] as usize {
                for i0 in 0..ne[0] as usize {
                    unsafe {
                        let av = *f32_at(ap, &anb, i0, i1, i2, i3);
                        *f32_at(dp, &dnb, i0, i1, i2, i3) = f(av);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Masks columns past the diagonal: dst[i0, i1] = value where i0 > n_past + i1.
fn diag_mask(node: &Tensor, value: f32) -> Result<(), String> {
    let a = node.src(0).ok_or("missing src0")?;
    require_f32(node)?;
    require_f32(&a)?;
    let n_past = node.op_param_i32(0) as usize;

    let ne = node.ne();
    let (dnb, anb) = (node.nb(), a.nb());
    let (dp, ap) = (node.data(), a.data());

    for i3 in 0..ne[3] as usize {
        for i2 in 0..ne[2] as usize {
            for i1 in 0..ne[1] as usize {
                for i0 in 0..ne[0] as usize {
                    unsafe {
                        let av = *f32_at(ap, &anb, i0, i1, i2, i3);
                        *f32_at(dp, &dnb, i0, i1, i2, i3) =
                            if i0 > n_past + i1 { value } else { av };
                    }
                }
            }
        }
    }
    Ok(())
}

fn norm(node: &Tensor, rms: bool) -> Result<(), String> {
    let a = node.src(0).ok_or("missing src0")?;
    require_f32(node)?;
    require_f32(&a)?;
    let eps = node.op_param_f32(0);

    let ne = node.ne();
    let (dnb, anb) = (node.nb(), a.nb());
    let (dp, ap) = (node.data(), a.data());
    let n = ne[0] as usize;

    for i3 in 0..ne[3] as usize {
        for i2 in 0..ne[2] as usize {
            for i1 in 0..ne[1] as usize {
                unsafe {
                    let mut mean = 0.0f64;
                    if !rms {
                        for i0 in 0..n {
                            mean += *f32_at(ap, &anb, i0, i1, i2, i3) as f64;
                        }
                        mean /= n as f64;
                    }
                    let mut sum2 = 0.0f64;
                    for i0 in 0..n {
                        let v = *f32_at(ap, &anb, i0, i1, i2, i3) as f64 - mean;
                        sum2 += v * v;
                    }
                    let scale = (1.0 / (sum2 / n as f64 + eps as f64).sqrt()) as f32;
                    for i0 in 0..n {
                        let v = *f32_at(ap, &anb, i0, i1, i2, i3) - mean as f32;
                        *f32_at(dp, &dnb, i0, i1, i2, i3) = v * scale;
                    }
                }
            }
        }
    }
    Ok(())
}

fn soft_max(node: &Tensor) -> Result<(), String> {
    let a = node.src(0).ok_or("missing src0")?;
    require_f32(node)?;
    require_f32(&a)?;
    let scale = node.op_param_f32(0);

    let ne = node.ne();
    let (dnb, anb) = (node.nb(), a.nb());
    let (dp, ap) = (node.data(), a.data());
    let n = ne[0] as usize;

    for i3 in 0..ne[3] as usize {
        for i2 in 0..ne[2] as usize {
            for i1 in 0..ne[1] as usize {
                unsafe {
                    let mut max = f32::NEG_INFINITY;
                    for i0 in 0..n {
                        max = max.max(*f32_at(ap, &anb, i0, i1, i2, i3) * scale);
                    }
                    let mut sum = 0.0f64;
                    for i0 in 0..n {
                        let e = (*f32_at(ap, &anb, i0, i1, i2, i3) * scale - max).exp();
                        *f32_at(dp, &dnb, i0, i1, i2, i3) = e;
                        sum += e as f64;
                    }
                    let inv = (1.0 / sum) as f32;
                    for i0 in 0..n {
                        *f32_at(dp, &dnb, i0, i1, i2, i3) *= inv;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Rotary embedding, adjacent-pair mode. `src1` holds one position per
/// index along dim 2.
fn rope(node: &Tensor) -> Result<(), String> {
    let a = node.src(0).ok_or("missing src0")?;
    let pos = node.src(1).ok_or("missing src1")?;
    require_f32(node)?;
    require_f32(&a)?;
    if pos.ttype() != TensorType::I32 {
        return Err("rope positions must be i32".to_string());
    }

    let n_dims = node.op_param_i32(0) as usize;
    let freq_base = node.op_param_f32(2);

    let ne = node.ne();
    let (dnb, anb, pnb) = (node.nb(), a.nb(), pos.nb());
    let (dp, ap, pp) = (node.data(), a.data(), pos.data());

    if n_dims % 2 != 0 || n_dims > ne[0] as usize {
        return Err("invalid rope n_dims".to_string());
    }

    for i3 in 0..ne[3] as usize {
        for i2 in 0..ne[2] as usize {
            let p = unsafe { *i32_at(pp, &pnb, i2, 0, 0, 0) } as f32;
            for i1 in 0..ne[1] as usize {
                unsafe {
                    for j in 0..n_dims / 2 {
                        let theta = p * freq_base.powf(-2.0 * j as f32 / n_dims as f32);
                        let (sin_t, cos_t) = theta.sin_cos();
                        let x0 = *f32_at(ap, &anb, 2 * j, i1, i2, i3);
                        let x1 = *f32_at(ap, &anb, 2 * j + 1, i1, i2, i3);
                        *f32_at(dp, &dnb, 2 * j, i1, i2, i3) = x0 * cos_t - x1 * sin_t;
                        *f32_at(dp, &dnb, 2 * j + 1, i1, i2, i3) = x0 * sin_t + x1 * cos_t;
                    }
                    for i0 in n_dims..ne[0] as usize {
                        *f32_at(dp, &dnb, i0, i1, i2, i3) = *f32_at(ap, &anb, i0, i1, i2, i3);
                    }
                }
            }
        }
    }
    Ok(())
}

/// dst[n, m] = a[k, n]^T . b[k, m], batched over dims 2 and 3 with
/// broadcasting of `a`.
fn mul_mat(node: &Tensor) -> Result<(), String> {
    let a = node.src(0).ok_or("missing src0")?;
    let b = node.src(1).ok_or("missing src1")?;
    require_f32(node)?;
    require_f32(&a)?;
    require_f32(&b)?;

    let ne = node.ne();
    let (ane, _bne) = (a.ne(), b.ne());
    let (dnb, anb, bnb) = (node.nb(), a.nb(), b.nb());
    let (dp, ap, bp) = (node.data(), a.data(), b.data());
    let k = ane[0] as usize;

    for i3 in 0..ne[3] as usize {
        for i2 in 0..ne[2] as usize {
            let a2 = i2 % ane[2] as usize;
            let a3 = i3 % ane[3] as usize;
            for i1 in 0..ne[1] as usize {
                for i0 in 0..ne[0] as usize {
                    let mut sum = 0.0f64;
                    unsafe {
                        for kk in 0..k {
                            let av = *f32_at(ap, &anb, kk, i0, a2, a3);
                            let bv = *f32_at(bp, &bnb, kk, i1, i2, i3);
                            sum += (av * bv) as f64;
                        }
                        *f32_at(dp, &dnb, i0, i1, i2, i3) = sum as f32;
                    }
                }
            }
        }
    }
    Ok(())
}

/// dst[:, u, t] = as[:, :, ids[u, t]]^T . b[:, u, t]
fn mul_mat_id(node: &Tensor) -> Result<(), String> {
    let a = node.src(0).ok_or("missing src0")?;
    let b = node.src(1).ok_or("missing src1")?;
    let ids = node.src(2).ok_or("missing src2")?;
    require_f32(node)?;
    require_f32(&a)?;
    require_f32(&b)?;
    if ids.ttype() != TensorType::I32 {
        return Err("mul_mat_id ids must be i32".to_string());
    }

    let ne = node.ne();
    let ane = a.ne();
    let (dnb, anb, bnb, inb) = (node.nb(), a.nb(), b.nb(), ids.nb());
    let (dp, ap, bp, ip) = (node.data(), a.data(), b.data(), ids.data());
    let k = ane[0] as usize;
    let n_expert = ane[2];

    for t in 0..ne[2] as usize {
        for u in 0..ne[1] as usize {
            let e = unsafe { *i32_at(ip, &inb, u, t, 0, 0) };
            if e < 0 || e as i64 >= n_expert {
                return Err(format!("expert id {e} out of range"));
            }
            for i0 in 0..ne[0] as usize {
                let mut sum = 0.0f64;
                unsafe {
                    for kk in 0..k {
                        let av = *f32_at(ap, &anb, kk, i0, e as usize, 0);
                        let bv = *f32_at(bp, &bnb, kk, u, t, 0);
                        sum += (av * bv) as f64;
                    }
                    *f32_at(dp, &dnb, i0, u, t, 0) = sum as f32;
                }
            }
        }
    }
    Ok(())
}
