pub mod backend;
pub mod error;
pub mod galloc;
pub mod optimize;
pub mod sched;
pub mod talloc;
pub mod tensor;
pub mod types;

pub use backend::{Backend, BackendImpl, Buffer, BufferType, Device, DeviceImpl, DeviceType};
pub use error::{Error, ErrorKind, Result};
pub use galloc::GraphAlloc;
pub use sched::Sched;
pub use talloc::TensorAlloc;
pub use tensor::{Graph, Tensor};
pub use types::{Op, Status, TensorType};

/// Installs a global tracing subscriber honouring `RUST_LOG`. Safe to call
/// more than once; later calls are ignored.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
