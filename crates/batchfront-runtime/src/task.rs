use batchfront_core::{BatchError, IOName, Tensor};
use tokio::sync::oneshot;

/// What a caller gets back for one task: its output tensors, or the error
/// that sank the whole batch.
pub type TaskResult = Result<Vec<Tensor>, BatchError>;

/// One caller's in-flight request: owned inputs, the outputs it asked for,
/// and the channel its result is delivered on.
#[derive(Debug)]
pub struct BatchTask {
    pub inputs: Vec<(IOName, Tensor)>,
    pub requested_outputs: Vec<IOName>,
    pub zeroth_dim_size: usize,
    resp_tx: oneshot::Sender<TaskResult>,
}

impl BatchTask {
    /// Admits a request as a task, computing its batch-axis size. All
    /// inputs must be non-scalar and share their 0th-dimension size.
    pub fn new(
        inputs: Vec<(IOName, Tensor)>,
        requested_outputs: Vec<IOName>,
    ) -> Result<(Self, oneshot::Receiver<TaskResult>), BatchError> {
        let zeroth_dim_size = compute_input_size(&inputs)?;
        let (resp_tx, resp_rx) = oneshot::channel();
        Ok((
            Self {
                inputs,
                requested_outputs,
                zeroth_dim_size,
                resp_tx,
            },
            resp_rx,
        ))
    }

    /// Contribution of this task to a batch's size along the batch axis.
    pub fn size(&self) -> usize {
        self.zeroth_dim_size
    }

    fn finish(self, result: TaskResult) {
        // The caller may have gone away; then there is no one to deliver to.
        let _ = self.resp_tx.send(result);
    }
}

fn compute_input_size(inputs: &[(IOName, Tensor)]) -> Result<usize, BatchError> {
    if inputs.is_empty() {
        return Err(BatchError::InvalidArgument(
            "run() must have at least one input tensor".into(),
        ));
    }
    let mut size = 0usize;
    for (i, (name, tensor)) in inputs.iter().enumerate() {
        let Some(dim0) = tensor.dim0() else {
            return Err(BatchError::InvalidArgument(format!(
                "input tensor {} must have at least one dimension",
                name.0
            )));
        };
        if i == 0 {
            size = dim0;
        } else if dim0 != size {
            return Err(BatchError::InvalidArgument(format!(
                "input tensors must have equal 0th-dimension sizes; {} has {dim0}, expected {size}",
                name.0
            )));
        }
    }
    Ok(size)
}

/// An ordered set of tasks closed by a scheduler and handed to the driver
/// as one unit of work.
#[derive(Debug)]
pub struct Batch {
    tasks: Vec<BatchTask>,
}

impl Batch {
    pub fn new(tasks: Vec<BatchTask>) -> Self {
        Self { tasks }
    }

    /// Summed batch-axis size across tasks.
    pub fn size(&self) -> usize {
        self.tasks.iter().map(BatchTask::size).sum()
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[BatchTask] {
        &self.tasks
    }

    /// Delivers the batch outcome: each task its own output list, or the
    /// same error to every task. Every task hears back exactly once no
    /// matter which driver stage failed.
    pub fn complete(self, outcome: Result<Vec<Vec<Tensor>>, BatchError>) {
        match outcome {
            Ok(per_task) => {
                debug_assert_eq!(per_task.len(), self.tasks.len());
                for (task, outputs) in self.tasks.into_iter().zip(per_task) {
                    task.finish(Ok(outputs));
                }
            }
            Err(err) => {
                for task in self.tasks {
                    task.finish(Err(err.clone()));
                }
            }
        }
    }
}
