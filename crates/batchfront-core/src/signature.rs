use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::tensor::Tensor;
use crate::IOName;

const NAME_HASH_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Identifies a family of batchable calls: the set of input tensor names
/// and the set of requested output names. Calls batch together only when
/// both sets match exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorSignature {
    input_tensors: Vec<IOName>,
    output_tensors: Vec<IOName>,
}

impl TensorSignature {
    /// Builds a signature from name collections; order and duplicates are
    /// irrelevant.
    pub fn new(
        inputs: impl IntoIterator<Item = IOName>,
        outputs: impl IntoIterator<Item = IOName>,
    ) -> Self {
        let mut input_tensors: Vec<IOName> = inputs.into_iter().collect();
        input_tensors.sort();
        input_tensors.dedup();
        let mut output_tensors: Vec<IOName> = outputs.into_iter().collect();
        output_tensors.sort();
        output_tensors.dedup();
        Self {
            input_tensors,
            output_tensors,
        }
    }

    /// The signature of a single `run` call.
    pub fn from_run_args(inputs: &[(IOName, Tensor)], output_names: &[IOName]) -> Self {
        Self::new(
            inputs.iter().map(|(name, _)| name.clone()),
            output_names.iter().cloned(),
        )
    }

    /// Input names in stable (sorted) order.
    pub fn input_tensors(&self) -> &[IOName] {
        &self.input_tensors
    }

    /// Output names in stable (sorted) order.
    pub fn output_tensors(&self) -> &[IOName] {
        &self.output_tensors
    }
}

impl Hash for TensorSignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(combined_name_hash(&self.input_tensors));
        state.write_u64(combined_name_hash(&self.output_tensors));
    }
}

// XOR of per-name hashes: every insertion order of the same name set
// produces the same value. Safe because the stored sets are deduplicated.
fn combined_name_hash(names: &[IOName]) -> u64 {
    names.iter().fold(NAME_HASH_SEED, |acc, name| {
        let mut hasher = DefaultHasher::new();
        name.0.hash(&mut hasher);
        acc ^ hasher.finish()
    })
}

impl fmt::Display for TensorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, names: &[IOName]) -> fmt::Result {
            for (i, name) in names.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", name.0)?;
            }
            Ok(())
        }
        write!(f, "{{input_tensors: <")?;
        join(f, &self.input_tensors)?;
        write!(f, ">, output_tensors: <")?;
        join(f, &self.output_tensors)?;
        write!(f, ">}}")
    }
}
