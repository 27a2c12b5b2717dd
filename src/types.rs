//! Tensor element types, operations and status codes.

/// Status returned by compute entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    AllocFailed,
    Failed,
    Success,
    Aborted,
}

/// The different types of elements allowed in tensors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TensorType {
    F32,
    F16,
    I32,
    Q8_0,
}

pub const TYPE_COUNT: usize = 4;

struct TypeTraits {
    type_name: &'static str,
    blck_size: usize,
    type_size: usize,
    is_quantized: bool,
}

static TYPE_TRAITS: [TypeTraits; TYPE_COUNT] = [
    TypeTraits {
        type_name: "f32",
        blck_size: 1,
        type_size: std::mem::size_of::<f32>(),
        is_quantized: false,
    },
    TypeTraits {
        type_name: "f16",
        blck_size: 1,
        type_size: std::mem::size_of::<u16>(),
        is_quantized: false,
    },
    TypeTraits {
        type_name: "i32",
        blck_size: 1,
        type_size: std::mem::size_of::<i32>(),
        is_quantized: false,
    },
    // 32 quants + one f16 scale per block
    TypeTraits { type_name: "q8_0", blck_size: 32, type_size: 34, is_quantized: true },
];

pub fn type_name(tensor_type: TensorType) -> &'static str {
    TYPE_TRAITS[tensor_type as usize].type_name
}

pub fn block_size(tensor_type: TensorType) -> usize {
    TYPE_TRAITS[tensor_type as usize].blck_size
}

pub fn type_size(tensor_type: TensorType) -> usize {
    TYPE_TRAITS[tensor_type as usize].type_size
}

pub fn is_quantized(tensor_type: TensorType) -> bool {
    TYPE_TRAITS[tensor_type as usize].is_quantized
}

/// Size in bytes of a row of `ne` elements.
pub fn row_size(tensor_type: TensorType, ne: i64) -> usize {
    assert!(ne as usize % block_size(tensor_type) == 0);
    type_size(tensor_type) * (ne as usize) / block_size(tensor_type)
}

/// Graph operations understood by the scheduler and the reference kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    None,

    View,
    Reshape,
    Permute,
    Transpose,

    Add,
    Add1,
    Sub,
    Mul,
    Div,
    Sqr,
    Sqrt,
    Log,
    Scale,
    Unary,

    DiagMaskInf,
    DiagMaskZero,
    Norm,
    RmsNorm,
    SoftMax,
    Rope,

    MulMat,
    MulMatId,
}

/// Elementwise unary operations, carried in `op_params[0]` of an `Op::Unary`
/// node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Abs,
    Sgn,
    Neg,
    Relu,
    Gelu,
    Silu,
}

impl UnaryOp {
    pub fn from_i32(v: i32) -> Option<UnaryOp> {
        match v {
            0 => Some(UnaryOp::Abs),
            1 => Some(UnaryOp::Sgn),
            2 => Some(UnaryOp::Neg),
            3 => Some(UnaryOp::Relu),
            4 => Some(UnaryOp::Gelu),
            5 => Some(UnaryOp::Silu),
            _ => None,
        }
    }
}

/// Ops that only manipulate metadata; they never own storage and are skipped
/// by the assignment passes.
pub fn is_view_op(op: Op) -> bool {
    matches!(op, Op::View | Op::Reshape | Op::Permute | Op::Transpose)
}

/// Ops that may overwrite the storage of one of their sources.
///
/// The graph allocator reuses a parent's storage for these when the parent
/// has no other consumers and the layouts match.
pub fn op_can_inplace(op: Op) -> bool {
    matches!(
        op,
        Op::Scale
            | Op::DiagMaskZero
            | Op::DiagMaskInf
            | Op::Add
            | Op::Add1
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Sqr
            | Op::Sqrt
            | Op::Log
            | Op::Unary
            | Op::Rope
            | Op::RmsNorm
            | Op::SoftMax
    )
}
