use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use batchfront_core::{BatchError, IOName, InferenceEngine, Tensor, TensorSignature};
use tracing::{error, warn};

use crate::scheduler::{BasicScheduler, BatchCallback, BatchPolicy, BatchScheduler};
use crate::task::{Batch, BatchTask};

/// Session-wide batching knobs.
#[derive(Clone, Debug, Default)]
pub struct BatchingOptions {
    /// When non-empty, every batch is padded up to the smallest entry that
    /// fits it. Must be positive and strictly increasing; with
    /// [`BatchingSession::basic`] the last entry must equal the scheduler's
    /// `max_batch_size`.
    pub allowed_batch_sizes: Vec<usize>,
}

/// Builds the scheduler for one signature, given the callback that drives
/// closed batches through the session.
pub type SchedulerCreator =
    Box<dyn FnOnce(BatchCallback) -> Result<Box<dyn BatchScheduler>, BatchError>>;

pub struct SignatureWithSchedulerCreator {
    pub signature: TensorSignature,
    pub scheduler_creator: SchedulerCreator,
}

struct SessionCore {
    options: BatchingOptions,
    engine: Arc<dyn InferenceEngine>,
}

/// Coalesces concurrent single-request calls into batched executions
/// against the wrapped engine, keyed by tensor signature. Calls whose
/// signature was never declared bypass batching and run inline.
pub struct BatchingSession {
    core: Arc<SessionCore>,
    schedulers: HashMap<TensorSignature, Box<dyn BatchScheduler>>,
}

impl BatchingSession {
    pub fn new(
        options: BatchingOptions,
        engine: Arc<dyn InferenceEngine>,
        signatures: Vec<SignatureWithSchedulerCreator>,
    ) -> Result<Self, BatchError> {
        validate_allowed_batch_sizes(&options.allowed_batch_sizes)?;
        let core = Arc::new(SessionCore { options, engine });
        let mut schedulers: HashMap<TensorSignature, Box<dyn BatchScheduler>> =
            HashMap::with_capacity(signatures.len());
        for entry in signatures {
            let SignatureWithSchedulerCreator {
                signature,
                scheduler_creator,
            } = entry;
            if schedulers.contains_key(&signature) {
                return Err(BatchError::InvalidArgument(format!(
                    "duplicate batching signature {signature}"
                )));
            }
            let callback: BatchCallback = {
                let core = core.clone();
                let signature = signature.clone();
                Arc::new(move |batch| core.process_batch(&signature, batch))
            };
            let scheduler = scheduler_creator(callback)?;
            schedulers.insert(signature, scheduler);
        }
        Ok(Self { core, schedulers })
    }

    /// Single-signature session backed by a [`BasicScheduler`].
    pub fn basic(
        policy: BatchPolicy,
        options: BatchingOptions,
        signature: TensorSignature,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self, BatchError> {
        if let Some(&last) = options.allowed_batch_sizes.last() {
            if last != policy.max_batch_size {
                return Err(BatchError::InvalidArgument(format!(
                    "last entry in allowed_batch_sizes must match max_batch_size; \
                     last entry was {last}; expected {}",
                    policy.max_batch_size
                )));
            }
        }
        let scheduler_creator: SchedulerCreator = Box::new(move |callback| {
            Ok(Box::new(BasicScheduler::spawn(policy, callback)) as Box<dyn BatchScheduler>)
        });
        Self::new(
            options,
            engine,
            vec![SignatureWithSchedulerCreator {
                signature,
                scheduler_creator,
            }],
        )
    }

    /// Runs one request. Calls whose signature is in the dispatch table are
    /// batched with concurrent calls of the same signature; the caller
    /// suspends until its batch completes. Anything else runs inline
    /// against the wrapped engine.
    pub async fn run(
        &self,
        inputs: Vec<(IOName, Tensor)>,
        requested_outputs: &[IOName],
        target_nodes: &[String],
    ) -> Result<Vec<Tensor>, BatchError> {
        if !target_nodes.is_empty() {
            return Err(BatchError::PermissionDenied(
                "batching session does not support target nodes".into(),
            ));
        }
        let signature = TensorSignature::from_run_args(&inputs, requested_outputs);
        let Some(scheduler) = self.schedulers.get(&signature) else {
            warn!(%signature, "request matches no batching signature, bypassing batching");
            return self
                .core
                .engine
                .execute(&inputs, requested_outputs, target_nodes);
        };
        let (task, resp_rx) = BatchTask::new(inputs, requested_outputs.to_vec())?;
        scheduler.schedule(task)?;
        match resp_rx.await {
            Ok(result) => result,
            Err(_) => Err(BatchError::Internal(
                "batch worker dropped the task before completing it".into(),
            )),
        }
    }
}

impl SessionCore {
    /// The smallest allowed batch size that fits `batch_size`; identity
    /// when no allowed sizes are configured.
    fn round_to_lowest_allowed_batch_size(&self, batch_size: usize) -> usize {
        if self.options.allowed_batch_sizes.is_empty() {
            return batch_size;
        }
        for &allowed in &self.options.allowed_batch_sizes {
            if allowed >= batch_size {
                return allowed;
            }
        }
        error!(
            batch_size,
            "batch size exceeds the largest allowed size; ignoring allowed sizes constraint"
        );
        batch_size
    }

    /// Merges the batch's input tensors by concatenating same-named tensors
    /// across tasks, padding up to the nearest allowed batch size with rows
    /// sliced from the last task. Merged inputs come out in the signature's
    /// stable name order.
    fn merge_input_tensors(
        &self,
        signature: &TensorSignature,
        batch: &Batch,
    ) -> Result<Vec<(IOName, Tensor)>, BatchError> {
        if batch.num_tasks() < 1 {
            return Err(BatchError::Internal(format!(
                "batch size expected to be positive; was {}",
                batch.num_tasks()
            )));
        }
        let padding = self.round_to_lowest_allowed_batch_size(batch.size()) - batch.size();

        let mut tensors_to_merge: BTreeMap<&IOName, Vec<Tensor>> = BTreeMap::new();
        let last = batch.num_tasks() - 1;
        for (i, task) in batch.tasks().iter().enumerate() {
            for (name, tensor) in &task.inputs {
                let entries = tensors_to_merge.entry(name).or_default();
                entries.push(tensor.clone());
                if i == last && padding > 0 {
                    // One real row of the closing task is shape- and
                    // dtype-valid padding for this input.
                    let padding_row = tensor.slice_rows(0, 1)?;
                    for _ in 0..padding {
                        entries.push(padding_row.clone());
                    }
                }
            }
        }

        if tensors_to_merge.len() != signature.input_tensors().len() {
            return Err(BatchError::Internal(
                "one or more tasks does not conform to the batch signature".into(),
            ));
        }
        let mut merged = Vec::with_capacity(signature.input_tensors().len());
        for name in signature.input_tensors() {
            let Some(tensors) = tensors_to_merge.get(name) else {
                return Err(BatchError::Internal(
                    "one or more tasks does not conform to the batch signature".into(),
                ));
            };
            merged.push((name.clone(), Tensor::concat_rows(tensors)?));
        }
        Ok(merged)
    }

    /// Splits the batched outputs back into per-task output lists, each
    /// ordered by that task's requested outputs. A trailing padding slice
    /// is discarded.
    fn split_output_tensors(
        &self,
        signature: &TensorSignature,
        combined_outputs: Vec<Tensor>,
        batch: &Batch,
    ) -> Result<Vec<Vec<Tensor>>, BatchError> {
        if batch.num_tasks() < 1 {
            return Err(BatchError::Internal(format!(
                "batch size expected to be positive; was {}",
                batch.num_tasks()
            )));
        }
        let padding = self.round_to_lowest_allowed_batch_size(batch.size()) - batch.size();
        let mut task_sizes: Vec<usize> = batch.tasks().iter().map(BatchTask::size).collect();
        if padding > 0 {
            task_sizes.push(padding);
        }

        if combined_outputs.len() != signature.output_tensors().len() {
            return Err(BatchError::Internal(format!(
                "wrong number of batched output tensors; got {}, expected {}",
                combined_outputs.len(),
                signature.output_tensors().len()
            )));
        }

        let mut split_tensors: BTreeMap<&IOName, Vec<Tensor>> = BTreeMap::new();
        for (name, tensor) in signature.output_tensors().iter().zip(combined_outputs) {
            if tensor.rank() == 0 {
                return Err(BatchError::FailedPrecondition(
                    "batched output tensor has 0 dimensions".into(),
                ));
            }
            if tensor.dim0() != Some(batch.size() + padding) {
                return Err(BatchError::FailedPrecondition(
                    "batched output tensor's 0th dimension does not equal the sum of the \
                     0th dimension sizes of the input tensors"
                        .into(),
                ));
            }
            let parts = tensor.split_rows(&task_sizes)?;
            if parts.len() != task_sizes.len() {
                return Err(BatchError::Internal(format!(
                    "tensor split yielded {} parts; expected {}",
                    parts.len(),
                    task_sizes.len()
                )));
            }
            split_tensors.insert(name, parts);
        }

        let mut per_task = Vec::with_capacity(batch.num_tasks());
        for (i, task) in batch.tasks().iter().enumerate() {
            let mut outputs = Vec::with_capacity(task.requested_outputs.len());
            for name in &task.requested_outputs {
                let Some(parts) = split_tensors.get(name) else {
                    return Err(BatchError::Internal(format!(
                        "task requests output {} outside the batch signature",
                        name.0
                    )));
                };
                outputs.push(parts[i].clone());
            }
            per_task.push(outputs);
        }
        Ok(per_task)
    }

    /// Drives one closed batch: merge, one engine call, split. The outcome
    /// goes through [`Batch::complete`] on every path, so each task sees a
    /// terminal result even when a stage fails.
    fn process_batch(&self, signature: &TensorSignature, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let outcome = self.execute_batch(signature, &batch);
        batch.complete(outcome);
    }

    fn execute_batch(
        &self,
        signature: &TensorSignature,
        batch: &Batch,
    ) -> Result<Vec<Vec<Tensor>>, BatchError> {
        let merged_inputs = self.merge_input_tensors(signature, batch)?;
        let combined_outputs =
            self.engine
                .execute(&merged_inputs, signature.output_tensors(), &[])?;
        self.split_output_tensors(signature, combined_outputs, batch)
    }
}

fn validate_allowed_batch_sizes(sizes: &[usize]) -> Result<(), BatchError> {
    let mut prev = 0usize;
    for &size in sizes {
        if size <= prev {
            return Err(BatchError::InvalidArgument(
                "allowed_batch_sizes must be positive and strictly increasing".into(),
            ));
        }
        prev = size;
    }
    Ok(())
}
