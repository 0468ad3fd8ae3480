//! Carries a tensor slicing across a TPC or reshape node.

use crate::graph::{Graph, Node, NodeKind, TensorId, TpcAccess};
use crate::slicing::{DimBindings, TensorSlicing};

fn data_inputs<'g>(graph: &'g Graph, node: &'g Node) -> impl Iterator<Item = TensorId> + 'g {
    node.inputs
        .iter()
        .copied()
        .filter(move |&tensor| graph.tensor(tensor).is_data())
}

/// Keeps the bindings of dims whose extent is equal in `target`; broadcast dims stay whole.
fn restrict(bindings: &DimBindings, from: &[u64], target: &[u64]) -> DimBindings {
    bindings
        .iter()
        .enumerate()
        .map(|(dim, binding)| match (binding, from.get(dim), target.get(dim)) {
            (Some(binding), Some(f), Some(t)) if f == t => Some(*binding),
            _ => None,
        })
        .collect()
}

/// Moves the bindings of `from` onto `to` through a reshape. Every bound dim must reappear in
/// `to` with the same extent and the same inner element count.
pub fn reindex(from: &[u64], bindings: &DimBindings, to: &[u64]) -> Option<DimBindings> {
    let mut mapped: DimBindings = to.iter().map(|_| None).collect();
    for (dim, binding) in bindings.iter().enumerate() {
        let Some(binding) = binding else {
            continue;
        };
        let inner: u64 = from[..dim].iter().product();
        let mut target_inner = 1u64;
        let mut found = None;
        for (target, &extent) in to.iter().enumerate() {
            if target_inner == inner && extent == from[dim] {
                found = Some(target);
                break;
            }
            target_inner *= extent;
        }
        mapped[found?] = Some(*binding);
    }
    Some(mapped)
}

/// Slicings of the data inputs of `node` when its output is sliced as `output`.
pub fn through_producer(
    graph: &Graph,
    node: &Node,
    output: &TensorSlicing,
) -> Option<Vec<TensorSlicing>> {
    if node.outputs.len() != 1 {
        return None;
    }
    let mut slicings = Vec::new();
    match &node.kind {
        NodeKind::Reshape => {
            let input = *node.inputs.first()?;
            let dims = graph.tensor(input).shape.max();
            let bindings = reindex(&output.dims, &output.bindings, dims)?;
            slicings.push(TensorSlicing::with_bindings(graph, input, bindings));
        }
        NodeKind::Tpc { access, .. } => {
            if let TpcAccess::Reduce { axis } = access {
                if output.binding(*axis).is_some() {
                    return None;
                }
            }
            if *access == TpcAccess::Opaque {
                return None;
            }
            for input in data_inputs(graph, node) {
                let dims = graph.tensor(input).shape.max();
                let bindings = restrict(&output.bindings, &output.dims, dims);
                let bindings = match access {
                    TpcAccess::Reduce { axis } => {
                        let mut bindings = output.bindings.clone();
                        if let Some(slot) = bindings.get_mut(*axis) {
                            *slot = None;
                        }
                        bindings
                    }
                    _ => bindings,
                };
                slicings.push(TensorSlicing::with_bindings(graph, input, bindings));
            }
        }
        NodeKind::Mme { .. } => return None,
    }
    Some(slicings)
}

/// Slicings of the output (first) and the other data inputs of `node` when its input
/// `input.tensor` is sliced as `input`.
pub fn through_consumer(
    graph: &Graph,
    node: &Node,
    input: &TensorSlicing,
) -> Option<Vec<TensorSlicing>> {
    if node.outputs.len() != 1 {
        return None;
    }
    let output = node.outputs[0];
    let out_dims = graph.tensor(output).shape.max();
    let mut slicings = Vec::new();
    match &node.kind {
        NodeKind::Reshape => {
            let bindings = reindex(&input.dims, &input.bindings, out_dims)?;
            slicings.push(TensorSlicing::with_bindings(graph, output, bindings));
        }
        NodeKind::Tpc { access, .. } => {
            match access {
                TpcAccess::Opaque => return None,
                TpcAccess::Reduce { axis } if input.binding(*axis).is_some() => return None,
                TpcAccess::Broadcast => {
                    let bound_broadcast = input.bindings.iter().enumerate().any(|(dim, b)| {
                        b.is_some() && input.dims.get(dim) != out_dims.get(dim)
                    });
                    if bound_broadcast {
                        return None;
                    }
                }
                _ => {}
            }
            let out = TensorSlicing::with_bindings(graph, output, input.bindings.clone());
            for other in data_inputs(graph, node).filter(|&t| t != input.tensor) {
                let dims = graph.tensor(other).shape.max();
                let bindings = match access {
                    TpcAccess::Reduce { .. } => input.bindings.clone(),
                    _ => restrict(&out.bindings, out_dims, dims),
                };
                slicings.push(TensorSlicing::with_bindings(graph, other, bindings));
            }
            slicings.insert(0, out);
        }
        NodeKind::Mme { .. } => return None,
    }
    Some(slicings)
}
