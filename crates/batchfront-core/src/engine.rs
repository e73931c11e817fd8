use crate::error::BatchError;
use crate::tensor::Tensor;
use crate::IOName;

/// Object-safe interface to the wrapped inference engine.
/// Keep it synchronous; a batch worker task can call it directly.
///
/// The returned tensors correspond 1:1, in order, to `requested_outputs`.
/// Implementations must tolerate concurrent `execute` calls.
pub trait InferenceEngine: Send + Sync + 'static {
    fn execute(
        &self,
        inputs: &[(IOName, Tensor)],
        requested_outputs: &[IOName],
        target_nodes: &[String],
    ) -> Result<Vec<Tensor>, BatchError>;
}
