#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use mme_slicer::emit::{EmittedOp, Location, OpKind, Region, SliceRef};
use mme_slicer::geometry::AxisWindow;
use mme_slicer::graph::{
    ConvParams, DType, GemmParams, Graph, MmeKind, MmeParams, NodeId, NodeKind, TensorId,
    TpcAccess,
};
use mme_slicer::{DeviceCaps, SlicedProgram, SlicerConfig, SramSlicingPass};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Small device: 16-byte cache lines and 4x4 f32 MME tiles, so toy shapes still slice.
pub fn test_caps() -> DeviceCaps {
    DeviceCaps {
        name: "test".to_string(),
        sram_size_bytes: 1 << 20,
        sram_base_address: 0x1000_0000,
        cache_line_bytes: 16,
        mme_tile_width_bytes: 16,
        mme_tile_height: 4,
        ..DeviceCaps::gaudi()
    }
}

pub fn test_config(capacity: u64) -> SlicerConfig {
    SlicerConfig {
        min_common_dim_for_partials: 4,
        f32_accumulation_threshold: 16,
        ..SlicerConfig::with_capacity(capacity)
    }
}

pub fn compile(graph: &Graph, caps: &DeviceCaps, config: SlicerConfig) -> SlicedProgram {
    SramSlicingPass::new(caps, config)
        .run(graph)
        .expect("pass run")
}

pub fn conv_block(params: &ConvParams) -> Vec<u8> {
    params.encode()
}

pub fn gemm_block(transpose_a: bool, transpose_b: bool) -> Vec<u8> {
    GemmParams::new(transpose_a, transpose_b).encode()
}

/// Integer-valued inputs: every sum stays exact in f32 whatever the summation order.
pub fn random_inputs(graph: &Graph, seed: u64) -> HashMap<TensorId, Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    graph
        .tensors()
        .iter()
        .filter(|t| t.is_data() && graph.producer(t.id).is_none())
        .map(|t| {
            let len = t.shape.max_elements() as usize;
            let data = (0..len).map(|_| rng.gen_range(-2i32..=2) as f32).collect();
            (t.id, data)
        })
        .collect()
}

fn strides(dims: &[u64]) -> Vec<u64> {
    let mut strides = Vec::with_capacity(dims.len());
    let mut acc = 1;
    for &dim in dims {
        strides.push(acc);
        acc *= dim;
    }
    strides
}

fn linear(strides: &[u64], index: &[u64]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum::<u64>() as usize
}

/// Visits every index of `dims`, first dim fastest.
fn for_each_index(dims: &[u64], mut f: impl FnMut(&[u64])) {
    if dims.iter().any(|&d| d == 0) {
        return;
    }
    let mut index = vec![0u64; dims.len()];
    loop {
        f(&index);
        let mut dim = 0;
        loop {
            if dim == dims.len() {
                return;
            }
            index[dim] += 1;
            if index[dim] < dims[dim] {
                break;
            }
            index[dim] = 0;
            dim += 1;
        }
    }
}

fn region_dims(region: &[Region]) -> Vec<u64> {
    region.iter().map(|r| r.len).collect()
}

fn extract(full: &[f32], dims: &[u64], region: &[Region]) -> Vec<f32> {
    let full_strides = strides(dims);
    let mut out = Vec::new();
    for_each_index(&region_dims(region), |index| {
        let global: Vec<u64> = index.iter().zip(region).map(|(i, r)| r.start + i).collect();
        out.push(full[linear(&full_strides, &global)]);
    });
    out
}

fn insert(full: &mut [f32], dims: &[u64], region: &[Region], data: &[f32]) {
    let full_strides = strides(dims);
    let mut next = 0;
    for_each_index(&region_dims(region), |index| {
        let global: Vec<u64> = index.iter().zip(region).map(|(i, r)| r.start + i).collect();
        full[linear(&full_strides, &global)] = data[next];
        next += 1;
    });
}

/// Dense local operand: data plus its dims.
pub struct Local<'a> {
    pub data: &'a [f32],
    pub dims: Vec<u64>,
    strides: Vec<u64>,
}

impl<'a> Local<'a> {
    pub fn new(data: &'a [f32], dims: Vec<u64>) -> Self {
        assert_eq!(data.len() as u64, dims.iter().product::<u64>(), "operand size");
        Self {
            data,
            strides: strides(&dims),
            dims,
        }
    }

    fn at(&self, index: &[u64]) -> f32 {
        self.data[linear(&self.strides, index)]
    }

    fn dim(&self, dim: usize) -> u64 {
        self.dims.get(dim).copied().unwrap_or(1)
    }
}

struct ConvAxisParams {
    stride: u64,
    dilation: u64,
}

fn conv_axes(params: &ConvParams) -> Vec<ConvAxisParams> {
    (0..params.spatial_rank)
        .map(|s| ConvAxisParams {
            stride: u64::from(params.stride[s]),
            dilation: u64::from(params.dilation[s]),
        })
        .collect()
}

/// Input positions `o * stride - pad + tap * dilation`, or `None` when any falls outside.
fn positions(
    o: &[u64],
    tap: &[u64],
    axes: &[ConvAxisParams],
    pads: &[i64],
    extents: &[u64],
) -> Option<Vec<u64>> {
    (0..o.len())
        .map(|s| {
            let axis = &axes[s];
            let position = (o[s] * axis.stride) as i64 - pads[s] + (tap[s] * axis.dilation) as i64;
            (position >= 0 && (position as u64) < extents[s]).then_some(position as u64)
        })
        .collect()
}

/// Accumulates one MME computation into `out`. `pads` is the leading padding per spatial
/// axis as seen by the local operands.
pub fn mme_accumulate(
    kind: MmeKind,
    params: &MmeParams,
    inputs: &[Local<'_>],
    out_dims: &[u64],
    pads: &[i64],
    out: &mut [f32],
) {
    let out_strides = strides(out_dims);
    let conv = match params {
        MmeParams::Gemm(gemm) => {
            gemm_accumulate(*gemm, &inputs[0], &inputs[1], out_dims, out);
            if kind == MmeKind::MaskedBatchGemm {
                gemm_accumulate(*gemm, &inputs[2], &inputs[3], out_dims, out);
            }
            return;
        }
        MmeParams::Conv(conv) => conv,
    };
    assert_eq!(conv.groups, 1, "grouped convolutions are not modeled");
    let r = conv.spatial_rank;
    let axes = conv_axes(conv);
    let taps: Vec<u64> = (0..r).map(|s| u64::from(conv.kernel[s])).collect();
    match kind {
        MmeKind::Conv => {
            let (x, w) = (&inputs[0], &inputs[1]);
            for_each_index(out_dims, |o| {
                for c in 0..x.dim(0) {
                    for_each_index(&taps, |tap| {
                        let Some(spatial) = positions(&o[1..=r], tap, &axes, pads, &x.dims[1..=r])
                        else {
                            return;
                        };
                        let mut xi = vec![c];
                        xi.extend(spatial);
                        xi.push(o[r + 1]);
                        let mut wi = vec![o[0], c];
                        wi.extend_from_slice(tap);
                        out[linear(&out_strides, o)] += x.at(&xi) * w.at(&wi);
                    });
                }
            });
        }
        MmeKind::Dedx => {
            let (dy, w) = (&inputs[0], &inputs[1]);
            for_each_index(&dy.dims, |o| {
                let g = dy.at(o);
                for_each_index(&taps, |tap| {
                    let Some(spatial) = positions(&o[1..=r], tap, &axes, pads, &out_dims[1..=r])
                    else {
                        return;
                    };
                    for c in 0..out_dims[0] {
                        let mut xi = vec![c];
                        xi.extend_from_slice(&spatial);
                        xi.push(o[r + 1]);
                        let mut wi = vec![o[0], c];
                        wi.extend_from_slice(tap);
                        out[linear(&out_strides, &xi)] += g * w.at(&wi);
                    }
                });
            });
        }
        _ => {
            let (dy, x) = (&inputs[0], &inputs[1]);
            for_each_index(&dy.dims, |o| {
                let g = dy.at(o);
                for_each_index(&taps, |tap| {
                    let Some(spatial) = positions(&o[1..=r], tap, &axes, pads, &x.dims[1..=r])
                    else {
                        return;
                    };
                    for c in 0..x.dim(0) {
                        let mut xi = vec![c];
                        xi.extend_from_slice(&spatial);
                        xi.push(o[r + 1]);
                        let mut wi = vec![o[0], c];
                        wi.extend_from_slice(tap);
                        out[linear(&out_strides, &wi)] += g * x.at(&xi);
                    }
                });
            });
        }
    }
}

fn gemm_accumulate(gemm: GemmParams, a: &Local<'_>, b: &Local<'_>, out_dims: &[u64], out: &mut [f32]) {
    let out_strides = strides(out_dims);
    let k_count = a.dim(usize::from(gemm.transpose_a));
    let batch = |operand: &Local<'_>, o: &[u64], first: u64, second: u64| {
        let mut index = vec![first, second];
        for dim in 2..operand.dims.len() {
            index.push(if operand.dim(dim) == 1 { 0 } else { o[dim] });
        }
        index
    };
    for k in 0..k_count {
        for_each_index(out_dims, |o| {
            let (n, m) = (o[0], o[1]);
            let ai = if gemm.transpose_a { batch(a, o, m, k) } else { batch(a, o, k, m) };
            let bi = if gemm.transpose_b { batch(b, o, k, n) } else { batch(b, o, n, k) };
            out[linear(&out_strides, o)] += a.at(&ai) * b.at(&bi);
        });
    }
}

/// Vector-engine kernels understood by the executor.
pub fn tpc_compute(kernel: &str, access: TpcAccess, inputs: &[Local<'_>], out_dims: &[u64]) -> Vec<f32> {
    let mut out = Vec::new();
    match access {
        TpcAccess::Reduce { axis } => {
            let input = &inputs[0];
            for_each_index(out_dims, |o| {
                let mut index = o.to_vec();
                let mut sum = 0.0;
                for j in 0..input.dim(axis) {
                    index[axis] = j;
                    sum += input.at(&index);
                }
                out.push(sum);
            });
        }
        _ => {
            for_each_index(out_dims, |o| {
                let values: Vec<f32> = inputs
                    .iter()
                    .map(|input| {
                        let index: Vec<u64> = (0..input.dims.len())
                            .map(|d| if input.dim(d) == 1 { 0 } else { o[d] })
                            .collect();
                        input.at(&index)
                    })
                    .collect();
                let value = match kernel {
                    "relu" => values[0].max(0.0),
                    "add" => values.iter().sum(),
                    "mul" => values.iter().product(),
                    "scale" => values[0] * 0.5,
                    "copy" => values[0],
                    other => panic!("unknown test kernel `{other}`"),
                };
                out.push(value);
            });
        }
    }
    out
}

/// Reference interpreter of emitted programs over dense f32 memories.
pub struct Executor<'g> {
    graph: &'g Graph,
    hbm: HashMap<TensorId, Vec<f32>>,
    sram: BTreeMap<u64, Vec<f32>>,
    scratch: HashMap<(TensorId, Vec<Region>, u32), Vec<f32>>,
}

impl<'g> Executor<'g> {
    pub fn new(graph: &'g Graph, inputs: &HashMap<TensorId, Vec<f32>>) -> Self {
        Self {
            graph,
            hbm: inputs.clone(),
            sram: BTreeMap::new(),
            scratch: HashMap::new(),
        }
    }

    pub fn run(mut self, program: &SlicedProgram) -> HashMap<TensorId, Vec<f32>> {
        for op in &program.ops {
            self.step(op);
        }
        self.hbm
    }

    fn dims(&self, tensor: TensorId) -> Vec<u64> {
        self.graph.tensor(tensor).shape.max().to_vec()
    }

    fn hbm_mut(&mut self, tensor: TensorId) -> &mut Vec<f32> {
        let len = self.graph.tensor(tensor).shape.max_elements() as usize;
        self.hbm.entry(tensor).or_insert_with(|| vec![0.0; len])
    }

    fn read(&self, slice: &SliceRef) -> Vec<f32> {
        match slice.location {
            Location::Hbm => {
                let full = self
                    .hbm
                    .get(&slice.tensor)
                    .unwrap_or_else(|| panic!("{:?} read before it was written", slice.tensor));
                extract(full, &self.dims(slice.tensor), &slice.region)
            }
            Location::Sram { address, .. } => {
                let data = self
                    .sram
                    .get(&address)
                    .unwrap_or_else(|| panic!("sram {address:#x} read before it was written"));
                assert_eq!(data.len() as u64, slice.elements(), "sram {address:#x} holds another window");
                data.clone()
            }
            Location::Scratch { partial } => self
                .scratch
                .get(&(slice.tensor, slice.region.clone(), partial))
                .unwrap_or_else(|| panic!("partial {partial} of {:?} missing", slice.tensor))
                .clone(),
        }
    }

    fn write(&mut self, slice: &SliceRef, data: Vec<f32>) {
        assert_eq!(data.len() as u64, slice.elements());
        match slice.location {
            Location::Hbm => {
                let dims = self.dims(slice.tensor);
                let region = slice.region.clone();
                insert(self.hbm_mut(slice.tensor), &dims, &region, &data);
            }
            Location::Sram { address, .. } => {
                self.sram.insert(address, data);
            }
            Location::Scratch { partial } => {
                self.scratch
                    .insert((slice.tensor, slice.region.clone(), partial), data);
            }
        }
    }

    fn step(&mut self, op: &EmittedOp) {
        match &op.kind {
            OpKind::Node { node } => self.run_node(*node),
            OpKind::MmeSlice {
                node,
                inputs,
                output,
                conv,
                accumulate,
                ..
            } => {
                let data: Vec<Vec<f32>> = inputs.iter().map(|slice| self.read(slice)).collect();
                let locals: Vec<Local<'_>> = data
                    .iter()
                    .zip(inputs)
                    .map(|(data, slice)| Local::new(data, region_dims(&slice.region)))
                    .collect();
                let out_dims = region_dims(&output.region);
                let mut out = if *accumulate {
                    self.read(output)
                } else {
                    vec![0.0; output.elements() as usize]
                };
                let (kind, params) = self.mme(*node);
                let pads: Vec<i64> = conv.iter().map(|w: &AxisWindow| w.pad_before).collect();
                mme_accumulate(kind, &params, &locals, &out_dims, &pads, &mut out);
                self.write(output, out);
            }
            OpKind::TpcSlice {
                node,
                inputs,
                outputs,
                ..
            } => {
                let data: Vec<Vec<f32>> = inputs.iter().map(|slice| self.read(slice)).collect();
                let locals: Vec<Local<'_>> = data
                    .iter()
                    .zip(inputs)
                    .map(|(data, slice)| Local::new(data, region_dims(&slice.region)))
                    .collect();
                let (kernel, access) = self.tpc(*node);
                let out_dims = region_dims(&outputs[0].region);
                let result = tpc_compute(&kernel, access, &locals, &out_dims);
                for output in outputs {
                    self.write(output, result.clone());
                }
            }
            OpKind::Reinterpret { input, output, .. } => {
                assert_eq!(input.elements(), output.elements(), "reinterpret changes size");
                let (Location::Sram { address: a, .. }, Location::Sram { address: b, .. }) =
                    (input.location, output.location)
                else {
                    panic!("reinterpret outside SRAM");
                };
                assert_eq!(a, b, "reinterpret must share its buffer");
            }
            OpKind::Fill { source, target } | OpKind::Spill { source, target } => {
                let data = self.read(source);
                self.write(target, data);
            }
            OpKind::Reduce { lhs, rhs, output } => {
                let sum = self
                    .read(lhs)
                    .iter()
                    .zip(self.read(rhs))
                    .map(|(l, r)| l + r)
                    .collect();
                self.write(output, sum);
            }
            OpKind::Cast { input, output } => {
                let data = self.read(input);
                self.write(output, data);
            }
            OpKind::Concat { tensor, .. } => {
                assert!(self.hbm.contains_key(tensor), "concat of an unwritten tensor");
            }
        }
    }

    fn mme(&self, node: NodeId) -> (MmeKind, MmeParams) {
        match &self.graph.node(node).kind {
            NodeKind::Mme { kind, params } => (*kind, params.clone()),
            other => panic!("expected an MME node, found {other:?}"),
        }
    }

    fn tpc(&self, node: NodeId) -> (String, TpcAccess) {
        match &self.graph.node(node).kind {
            NodeKind::Tpc { kernel, access } => (kernel.clone(), *access),
            other => panic!("expected a TPC node, found {other:?}"),
        }
    }

    fn whole(&self, tensor: TensorId) -> Vec<f32> {
        self.hbm
            .get(&tensor)
            .unwrap_or_else(|| panic!("{:?} read before it was written", tensor))
            .clone()
    }

    fn run_node(&mut self, node: NodeId) {
        let entry = self.graph.node(node).clone();
        let data_inputs: Vec<TensorId> = entry
            .inputs
            .iter()
            .copied()
            .filter(|&t| self.graph.tensor(t).is_data())
            .collect();
        let data: Vec<Vec<f32>> = data_inputs.iter().map(|&t| self.whole(t)).collect();
        let locals: Vec<Local<'_>> = data
            .iter()
            .zip(&data_inputs)
            .map(|(data, &t)| Local::new(data, self.dims(t)))
            .collect();
        let output = entry.outputs[0];
        let out_dims = self.dims(output);
        let result = match &entry.kind {
            NodeKind::Mme { kind, params } => {
                let mut out = vec![0.0; out_dims.iter().product::<u64>() as usize];
                let pads = match params {
                    MmeParams::Conv(conv) => {
                        let input_dims = match kind {
                            MmeKind::Conv => &locals[0].dims,
                            MmeKind::Dedx => &out_dims,
                            _ => &locals[1].dims,
                        };
                        (0..conv.spatial_rank)
                            .map(|s| conv.axis(s, input_dims[1 + s]).pad_before as i64)
                            .collect()
                    }
                    MmeParams::Gemm(_) => Vec::new(),
                };
                mme_accumulate(*kind, params, &locals, &out_dims, &pads, &mut out);
                out
            }
            NodeKind::Tpc { kernel, access } => tpc_compute(kernel, *access, &locals, &out_dims),
            NodeKind::Reshape => data[0].clone(),
        };
        for &out in &entry.outputs {
            *self.hbm_mut(out) = result.clone();
        }
    }
}

/// Runs `program` and returns the contents of every graph output.
pub fn execute(
    graph: &Graph,
    program: &SlicedProgram,
    inputs: &HashMap<TensorId, Vec<f32>>,
) -> BTreeMap<TensorId, Vec<f32>> {
    let memory = Executor::new(graph, inputs).run(program);
    graph
        .tensors()
        .iter()
        .filter(|t| graph.is_graph_output(t.id))
        .map(|t| {
            let data = memory
                .get(&t.id)
                .unwrap_or_else(|| panic!("graph output `{}` never written", t.name))
                .clone();
            (t.id, data)
        })
        .collect()
}

/// Compiles `graph` with slicing off and with `config`, runs both and requires identical
/// graph outputs. Returns the sliced program.
pub fn assert_matches_unsliced(graph: &Graph, caps: &DeviceCaps, config: SlicerConfig) -> SlicedProgram {
    let reference = compile(graph, caps, SlicerConfig::ground_truth());
    assert!(reference.bundles.is_empty());
    let sliced = compile(graph, caps, config);
    let inputs = random_inputs(graph, 17);
    let expected = execute(graph, &reference, &inputs);
    let actual = execute(graph, &sliced, &inputs);
    for (tensor, values) in &expected {
        assert_eq!(
            actual.get(tensor),
            Some(values),
            "output `{}` differs",
            graph.tensor(*tensor).name
        );
    }
    assert_program_invariants(&sliced);
    sliced
}

fn sram_range(slice: &SliceRef) -> Option<(u64, u64)> {
    match slice.location {
        Location::Sram { address, .. } => Some((address, address + slice.bytes())),
        _ => None,
    }
}

fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

/// Capacity, address range and dependency invariants of an emitted program.
pub fn assert_program_invariants(program: &SlicedProgram) {
    for bundle in &program.bundles {
        assert!(bundle.peak_bytes <= program.sram_budget, "bundle {} peak", bundle.id);
        for (i, a) in bundle.allocations.iter().enumerate() {
            let concurrent_max = bundle
                .allocations
                .iter()
                .filter(|b| b.first_op <= a.first_op && a.first_op <= b.last_op)
                .map(|b| b.bytes)
                .sum::<u64>();
            assert!(concurrent_max <= program.sram_budget, "live bytes exceed the budget");
            for b in &bundle.allocations[i + 1..] {
                let concurrent = b.first_op <= a.last_op && a.first_op <= b.last_op;
                if concurrent {
                    assert!(
                        !overlaps((a.address, a.address + a.bytes), (b.address, b.address + b.bytes)),
                        "live buffers {a:?} and {b:?} overlap"
                    );
                }
            }
        }
    }
    assert_dependencies_order_hazards(program);
}

/// Every pair of ops touching overlapping SRAM bytes, one of them writing, is ordered.
pub fn assert_dependencies_order_hazards(program: &SlicedProgram) {
    let count = program.ops.len();
    let words = count.div_ceil(64);
    let mut ancestors: Vec<Vec<u64>> = Vec::with_capacity(count);
    for op in &program.ops {
        let mut set = vec![0u64; words];
        for &dep in &op.deps {
            assert!(dep < op.index, "op {} depends on a later op {dep}", op.index);
            set[dep / 64] |= 1 << (dep % 64);
            for (word, bits) in set.iter_mut().zip(&ancestors[dep]) {
                *word |= bits;
            }
        }
        ancestors.push(set);
    }
    let accesses: Vec<(Vec<(u64, u64)>, Vec<(u64, u64)>)> = program
        .ops
        .iter()
        .map(|op| {
            let (reads, writes) = op.kind.accesses();
            (
                reads.into_iter().filter_map(sram_range).collect(),
                writes.into_iter().filter_map(sram_range).collect(),
            )
        })
        .collect();
    for later in 0..count {
        let (later_reads, later_writes) = &accesses[later];
        if later_reads.is_empty() && later_writes.is_empty() {
            continue;
        }
        for earlier in 0..later {
            let (earlier_reads, earlier_writes) = &accesses[earlier];
            let hazard = earlier_writes
                .iter()
                .any(|w| later_reads.iter().chain(later_writes).any(|r| overlaps(*w, *r)))
                || earlier_reads
                    .iter()
                    .any(|r| later_writes.iter().any(|w| overlaps(*r, *w)));
            if hazard {
                let ordered = ancestors[later][earlier / 64] & (1 << (earlier % 64)) != 0;
                assert!(
                    ordered,
                    "ops {earlier} ({}) and {later} ({}) conflict in SRAM but are unordered",
                    program.ops[earlier].name, program.ops[later].name
                );
            }
        }
    }
}

/// The distinct output windows of a bundle's MME slices tile the output exactly once.
pub fn assert_output_covered(graph: &Graph, program: &SlicedProgram, bundle: u32) {
    let summary = program
        .bundles
        .iter()
        .find(|b| b.id == bundle)
        .expect("bundle summary");
    let output = graph.node(summary.anchor).outputs[0];
    let dims = graph.tensor(output).shape.max().to_vec();
    let mut windows: Vec<Vec<Region>> = Vec::new();
    for op in &program.ops[summary.ops.0..summary.ops.1] {
        if let OpKind::MmeSlice { output: out, .. } = &op.kind {
            if !windows.contains(&out.region) {
                windows.push(out.region.clone());
            }
        }
    }
    let mut hits = vec![0u32; dims.iter().product::<u64>() as usize];
    let full_strides = strides(&dims);
    for region in &windows {
        for_each_index(&region_dims(region), |index| {
            let global: Vec<u64> = index.iter().zip(region).map(|(i, r)| r.start + i).collect();
            hits[linear(&full_strides, &global)] += 1;
        });
    }
    assert!(hits.iter().all(|&h| h == 1), "output windows do not tile the output");
}

/// Data tensor of `dtype` with fixed dims.
pub fn tensor(graph: &mut Graph, name: &str, dtype: DType, dims: &[u64]) -> TensorId {
    graph.add_tensor(name, dtype, dims)
}

/// `x [C, W, H, N]`, `w [K, C, kw, kh]` and the matching output for `params`.
pub fn conv_graph(
    kind: MmeKind,
    dtype: DType,
    x: [u64; 4],
    k: u64,
    params: &ConvParams,
) -> (Graph, NodeId) {
    let mut graph = Graph::new();
    let [c, w, h, n] = x;
    let out_w = params.axis(0, w).output_size(w);
    let out_h = params.axis(1, h).output_size(h);
    let kw = u64::from(params.kernel[0]);
    let kh = u64::from(params.kernel[1]);
    let x_dims = [c, w, h, n];
    let w_dims = [k, c, kw, kh];
    let y_dims = [k, out_w, out_h, n];
    let (a, b, out) = match kind {
        MmeKind::Conv => (x_dims, w_dims, y_dims),
        MmeKind::Dedx => (y_dims, w_dims, x_dims),
        _ => (y_dims, x_dims, w_dims),
    };
    let a = tensor(&mut graph, "a", dtype, &a);
    let b = tensor(&mut graph, "b", dtype, &b);
    let out = tensor(&mut graph, "out", dtype, &out);
    let node = graph
        .add_mme(kind.as_str(), kind, &conv_block(params), &[a, b], out)
        .expect("add conv");
    (graph, node)
}
