use std::collections::HashMap;

use batchfront_core::{DType, IOName, Shape, Tensor, TensorSignature};
use bytes::Bytes;

fn name(s: &str) -> IOName {
    IOName(s.to_string())
}

fn dummy_tensor() -> Tensor {
    Tensor::from_cpu_bytes(
        DType::U8,
        Shape::from_slice(&[1]),
        Bytes::from_static(&[0u8]),
    )
    .expect("valid tensor")
}

#[test]
fn equality_ignores_order_and_duplicates() {
    let a = TensorSignature::new([name("b"), name("a"), name("a")], [name("y")]);
    let b = TensorSignature::new([name("a"), name("b")], [name("y")]);
    assert_eq!(a, b);
}

#[test]
fn differing_output_sets_are_distinct() {
    let a = TensorSignature::new([name("x")], [name("y")]);
    let b = TensorSignature::new([name("x")], [name("y"), name("z")]);
    assert_ne!(a, b);
}

#[test]
fn hash_is_insertion_order_independent() {
    let mut table = HashMap::new();
    table.insert(
        TensorSignature::new([name("a"), name("b"), name("c")], [name("y"), name("z")]),
        1,
    );
    let other_order =
        TensorSignature::new([name("c"), name("a"), name("b")], [name("z"), name("y")]);
    assert_eq!(table.get(&other_order), Some(&1));
}

#[test]
fn from_run_args_matches_explicit_construction() {
    let inputs = vec![(name("w"), dummy_tensor()), (name("x"), dummy_tensor())];
    let outputs = [name("y")];
    assert_eq!(
        TensorSignature::from_run_args(&inputs, &outputs),
        TensorSignature::new([name("x"), name("w")], [name("y")]),
    );
}

#[test]
fn display_renders_both_name_sets_sorted() {
    let signature = TensorSignature::new([name("x"), name("a")], [name("y")]);
    assert_eq!(
        signature.to_string(),
        "{input_tensors: <a, x>, output_tensors: <y>}"
    );
}

#[test]
fn accessors_expose_sorted_names() {
    let signature = TensorSignature::new([name("x"), name("a")], [name("q"), name("p")]);
    let inputs: Vec<&str> = signature
        .input_tensors()
        .iter()
        .map(|n| n.0.as_str())
        .collect();
    let outputs: Vec<&str> = signature
        .output_tensors()
        .iter()
        .map(|n| n.0.as_str())
        .collect();
    assert_eq!(inputs, ["a", "x"]);
    assert_eq!(outputs, ["p", "q"]);
}
