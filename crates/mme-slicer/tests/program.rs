mod common;

use common::{compile, conv_block, gemm_block, tensor, test_caps, test_config};
use mme_slicer::graph::topology::TopologyError;
use mme_slicer::graph::{ConvParams, DType, Graph, MmeKind, TpcAccess};
use mme_slicer::{DeviceCaps, SlicerConfig, SlicerError, SramSlicingPass, TensorId};

fn conv_network() -> Graph {
    let mut graph = Graph::new();
    let params = ConvParams::conv2d([3, 3], [1, 1], [1, 1], [1, 1, 1, 1]);
    let x_raw = tensor(&mut graph, "x_raw", DType::F32, &[8, 6, 6, 4]);
    let x = tensor(&mut graph, "x", DType::F32, &[8, 6, 6, 4]);
    let w = tensor(&mut graph, "w", DType::F32, &[16, 8, 3, 3]);
    let y = tensor(&mut graph, "y", DType::F32, &[16, 6, 6, 4]);
    let z = tensor(&mut graph, "z", DType::F32, &[16, 6, 6, 4]);
    graph
        .add_tpc("relu", "relu", TpcAccess::Elementwise, &[x_raw], &[x])
        .expect("relu");
    graph
        .add_mme("conv", MmeKind::Conv, &conv_block(&params), &[x, w], y)
        .expect("conv");
    graph
        .add_tpc("scale", "scale", TpcAccess::Elementwise, &[y], &[z])
        .expect("scale");
    graph
}

/// `a [64, M] x b [32, 64] -> out [32, M]` with `M` in `1..=512`.
fn dynamic_gemm() -> (Graph, TensorId, TensorId) {
    let mut graph = Graph::new();
    let a = graph
        .add_dynamic_tensor("a", DType::F32, &[64, 1], &[64, 512])
        .expect("dynamic a");
    let b = tensor(&mut graph, "b", DType::F32, &[32, 64]);
    let out = graph
        .add_dynamic_tensor("out", DType::F32, &[32, 1], &[32, 512])
        .expect("dynamic out");
    graph
        .add_mme("mm", MmeKind::Gemm, &gemm_block(false, false), &[a, b], out)
        .expect("gemm");
    (graph, a, out)
}

#[test]
fn identical_graphs_compile_to_identical_programs() {
    let first = compile(&conv_network(), &test_caps(), test_config(9_000));
    let second = compile(&conv_network(), &test_caps(), test_config(9_000));
    assert_eq!(first.bundles.len(), 1);
    assert_ne!(first.fingerprint, 0);
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(
        first.to_json().expect("json"),
        second.to_json().expect("json")
    );
}

#[test]
fn fingerprint_tracks_the_plan() {
    let tight = compile(&conv_network(), &test_caps(), test_config(9_000));
    let roomy = compile(&conv_network(), &test_caps(), test_config(16_000));
    assert_ne!(tight.fingerprint, roomy.fingerprint);
}

#[test]
fn operators_that_fit_are_emitted_unchanged() {
    let graph = conv_network();
    let program = compile(&graph, &test_caps(), test_config(1 << 20));
    assert!(program.bundles.is_empty());
    assert_eq!(program.stats.candidates, 0);
    let names: Vec<&str> = program.ops.iter().map(|op| op.name.as_str()).collect();
    assert_eq!(names, ["relu", "conv", "scale"]);
    assert!(program.ops.iter().all(|op| op.kind.label() == "node"));
}

#[test]
fn disabled_pass_matches_zero_capacity() {
    let graph = conv_network();
    let disabled = SlicerConfig {
        enabled: false,
        ..test_config(9_000)
    };
    let off = compile(&graph, &test_caps(), disabled);
    let zero = compile(&graph, &test_caps(), SlicerConfig::ground_truth());
    assert_eq!(off.count("node"), 3);
    assert_eq!(off.sram_budget, 0);
    assert_eq!(off.ops, zero.ops);
    assert_eq!(off.fingerprint, zero.fingerprint);
}

#[test]
fn hopeless_budget_leaves_the_operator_unsliced() {
    let mut graph = Graph::new();
    let a = tensor(&mut graph, "a", DType::F32, &[64, 8]);
    let b = tensor(&mut graph, "b", DType::F32, &[8, 64]);
    let out = tensor(&mut graph, "out", DType::F32, &[8, 8]);
    graph
        .add_mme("mm", MmeKind::Gemm, &gemm_block(false, false), &[a, b], out)
        .expect("gemm");
    let program = compile(&graph, &test_caps(), test_config(100));
    assert_eq!(program.stats.candidates, 1);
    assert_eq!(program.stats.unsliceable, 1);
    assert!(program.bundles.is_empty());
    assert_eq!(program.count("node"), 1);
}

fn fp8_gemm() -> Graph {
    let mut graph = Graph::new();
    let a = tensor(&mut graph, "a", DType::Fp8E4M3, &[256, 1024]);
    let b = tensor(&mut graph, "b", DType::Fp8E4M3, &[256, 256]);
    let out = tensor(&mut graph, "out", DType::Bf16, &[256, 1024]);
    graph
        .add_mme("fp8_mm", MmeKind::Gemm, &gemm_block(false, false), &[a, b], out)
        .expect("fp8 gemm");
    graph
}

#[test]
fn fp8_operands_slice_where_the_device_can_move_them() {
    let graph = fp8_gemm();
    let program = compile(&graph, &DeviceCaps::gaudi2(), SlicerConfig::with_capacity(500_000));
    assert_eq!(program.bundles.len(), 1);
    let m = &program.bundles[0].axes[0];
    assert_eq!((m.label.as_str(), m.chunk, m.slices), ("M", 256, 4));
    assert_eq!(program.stats.demoted_bundles, 0);
}

#[test]
fn unsupported_fill_demotes_the_bundle() {
    let graph = fp8_gemm();
    let program = compile(&graph, &DeviceCaps::gaudi(), SlicerConfig::with_capacity(500_000));
    assert_eq!(program.stats.candidates, 1);
    assert_eq!(program.stats.demoted_bundles, 1);
    assert!(program.bundles.is_empty());
    assert_eq!(program.count("node"), 1);
}

#[test]
fn dynamic_extent_is_planned_at_its_maximum() {
    let (mut graph, a, out) = dynamic_gemm();
    let planned = compile(&graph, &test_caps(), test_config(60_000));
    let m = &planned.bundles[0].axes[0];
    assert_eq!((m.label.as_str(), m.extent, m.chunk, m.slices), ("M", 512, 64, 8));

    graph.set_actual_shape(a, &[64, 100]).expect("actual a");
    graph.set_actual_shape(out, &[32, 100]).expect("actual out");
    let relaunched = compile(&graph, &test_caps(), test_config(60_000));
    assert_eq!(planned.fingerprint, relaunched.fingerprint);

    let plans = relaunched.launch_plans(&graph).expect("launch plans");
    assert_eq!(plans.len(), 1);
    let plan = &plans[0];
    assert_eq!(plan.axes[0].extent, 100);
    assert_eq!(plan.axes[0].planned_slices, 8);
    assert_eq!(plan.axes[0].active_slices, 2);
    assert_eq!(plan.slices.len(), 2);
    assert_eq!(plan.skipped, 6);
    assert_eq!(plan.slices[1].ranges[0], (64, 36));
}

#[test]
fn launch_plan_without_actual_shapes_covers_every_slice() {
    let (graph, _, _) = dynamic_gemm();
    let program = compile(&graph, &test_caps(), test_config(60_000));
    let plans = program.launch_plans(&graph).expect("launch plans");
    assert_eq!(plans[0].slices.len(), 8);
    assert_eq!(plans[0].skipped, 0);
}

#[test]
fn partially_resolved_axis_is_rejected_at_launch() {
    let (mut graph, a, _) = dynamic_gemm();
    let program = compile(&graph, &test_caps(), test_config(60_000));
    // `out` keeps its maximum M while `a` launches with 100 rows.
    graph.set_actual_shape(a, &[64, 100]).expect("actual a");
    let err = program.launch_plans(&graph).expect_err("inconsistent launch");
    assert!(
        matches!(&err, SlicerError::OperandMismatch { node, message }
            if node == "mm" && message.contains("`a`")),
        "{err}"
    );
}

/// SAME-padded stride-2 conv over `x [4, 1..11, 6, 2]`.
fn dynamic_same_conv() -> (Graph, TensorId, TensorId) {
    let mut graph = Graph::new();
    let params = ConvParams::conv2d([3, 3], [2, 1], [1, 1], [0; 4]).with_same_padding();
    let x = graph
        .add_dynamic_tensor("x", DType::F32, &[4, 1, 6, 2], &[4, 11, 6, 2])
        .expect("dynamic x");
    let w = tensor(&mut graph, "w", DType::F32, &[8, 4, 3, 3]);
    let y = graph
        .add_dynamic_tensor("y", DType::F32, &[8, 1, 6, 2], &[8, 6, 6, 2])
        .expect("dynamic y");
    graph
        .add_mme("conv", MmeKind::Conv, &conv_block(&params), &[x, w], y)
        .expect("conv");
    (graph, x, y)
}

#[test]
fn dynamic_same_padding_conv_launch_rederives_pads() {
    let (mut graph, x, y) = dynamic_same_conv();
    let program = compile(&graph, &test_caps(), test_config(4_000));
    let w_axis = program.bundles[0]
        .axes
        .iter()
        .find(|axis| axis.label == "W")
        .expect("W axis");
    assert_eq!((w_axis.chunk, w_axis.slices), (1, 6));

    // At W = 11 the six output columns need one pad column on each side.
    let planned = program.launch_plans(&graph).expect("planned launch");
    assert_eq!(planned[0].slices[0].conv[0].pad_before, 1);

    graph.set_actual_shape(x, &[4, 10, 6, 2]).expect("actual x");
    graph.set_actual_shape(y, &[8, 5, 6, 2]).expect("actual y");
    let plans = program.launch_plans(&graph).expect("launch plans");
    let plan = &plans[0];
    assert_eq!(plan.slices.len(), 5);
    assert_eq!(plan.skipped, 1);
    let first = plan.slices[0].conv[0];
    assert_eq!((first.start, first.pad_before), (0, 0));
    let last = plan.slices[4].conv[0];
    assert_eq!((last.start, last.len, last.pad_after), (8, 2, 1));
}

#[test]
fn actual_shapes_must_lie_in_the_declared_range() {
    let (mut graph, a, _) = dynamic_gemm();
    let err = graph.set_actual_shape(a, &[64, 600]).expect_err("too large");
    assert!(matches!(
        err,
        SlicerError::ActualShapeOutOfRange {
            dim: 1,
            actual: 600,
            ..
        }
    ));
    let err = graph.set_actual_shape(a, &[64]).expect_err("wrong rank");
    assert!(matches!(err, SlicerError::ActualRank { .. }));
}

#[test]
fn malformed_inputs_are_rejected() {
    let mut graph = Graph::new();
    let a = tensor(&mut graph, "a", DType::F32, &[8, 8]);
    let b = tensor(&mut graph, "b", DType::F32, &[8, 8]);
    let out = tensor(&mut graph, "out", DType::F32, &[8, 8]);
    let err = graph
        .add_mme("mm", MmeKind::Gemm, &[0, 0, 0], &[a, b], out)
        .expect_err("short block");
    assert!(matches!(err, SlicerError::ParamBlockSize { actual: 3, .. }));

    let err = graph
        .add_dynamic_tensor("bad", DType::F32, &[4, 9], &[4, 8])
        .expect_err("min above max");
    assert!(matches!(err, SlicerError::InvalidShapeRange { dim: 1, .. }));
}

#[test]
fn cyclic_graphs_are_rejected_by_the_pass() {
    let mut graph = Graph::new();
    let t0 = tensor(&mut graph, "t0", DType::F32, &[4, 4]);
    let t1 = tensor(&mut graph, "t1", DType::F32, &[4, 4]);
    graph
        .add_tpc("first", "relu", TpcAccess::Elementwise, &[t1], &[t0])
        .expect("first");
    graph
        .add_tpc("second", "relu", TpcAccess::Elementwise, &[t0], &[t1])
        .expect("second");
    let caps = test_caps();
    let err = SramSlicingPass::new(&caps, SlicerConfig::default())
        .run(&graph)
        .expect_err("cycle");
    assert!(matches!(err, SlicerError::Topology(TopologyError::Cycle { .. })));
}

#[test]
fn summary_lists_bundles_and_counters() {
    let (graph, _, _) = dynamic_gemm();
    let program = compile(&graph, &test_caps(), test_config(60_000));
    let summary = program.summary();
    assert!(summary.starts_with("device test budget 60000 bytes"));
    assert!(summary.contains("bundle 0 `mm`: M=8x64"), "{summary}");
    assert!(summary.contains("candidates 1, sliced 1"), "{summary}");
}
