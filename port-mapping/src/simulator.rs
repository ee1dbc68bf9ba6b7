use rustc_hash::FxHashMap;

use crate::arch::{Architecture, InsnId, PortId};
use crate::experiment::{ExpResult, ExperimentError, ExperimentList};
use crate::mapping::Mapping;

/// Something that can attach cycle counts to instruction sequences: the
/// local simulator here, or the remote benchmark driver on a measurement
/// server.
pub trait Processor {
    fn arch(&self) -> &Architecture;

    fn description(&self) -> String;

    /// Produces the result dictionary for one instruction sequence. Failure
    /// is represented inside the result (`cycles: None` plus a cause), not
    /// as an `Err`.
    fn execute(&mut self, iseq: &[InsnId]) -> ExpResult;

    /// Evaluates every experiment of the list in order, storing the results
    /// in place.
    fn eval_list(&mut self, exps: &mut ExperimentList) -> Result<(), ExperimentError> {
        for idx in 0..exps.len() {
            let iseq = exps.exps()[idx].iseq.clone();
            let result = self.execute(&iseq);
            exps.exps_mut()[idx].result = Some(result);
        }
        Ok(())
    }
}

/// The uop weight table of one instruction sequence under one mapping:
/// for each distinct port-set bitvector, how many uops of the sequence
/// carry it.
#[derive(Debug, Clone)]
pub struct WeightTable {
    weights: FxHashMap<u64, u64>,
    num_ports: u32,
}

impl WeightTable {
    pub fn num_ports(&self) -> u32 {
        self.num_ports
    }

    pub fn weights(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.weights.iter().map(|(u, w)| (*u, *w))
    }

    /// The load of a non-empty port subset `q`: the number of uops that can
    /// only run inside `q`, divided by `|q|`.
    pub fn load(&self, q: u64) -> f64 {
        debug_assert!(q != 0);
        let mut contained = 0u64;
        for (u, w) in &self.weights {
            if !q & u == 0 {
                contained += w;
            }
        }
        contained as f64 / q.count_ones() as f64
    }

    /// The bottleneck cycle count: the maximum load over all non-empty port
    /// subsets. Loads are compared exactly (integer cross-multiplication);
    /// only the final value is converted to floating point.
    pub fn bottleneck_cycles(&self) -> f64 {
        let mut best_num = 0u64;
        let mut best_den = 1u32;
        for q in 1..(1u64 << self.num_ports) {
            let mut contained = 0u64;
            for (u, w) in &self.weights {
                if !q & u == 0 {
                    contained += w;
                }
            }
            let den = q.count_ones();
            // contained / den > best_num / best_den
            if contained as u128 * best_den as u128 > best_num as u128 * den as u128 {
                best_num = contained;
                best_den = den;
            }
        }
        best_num as f64 / best_den as f64
    }
}

/// Mapping from [`PortId`] to bit position. Bits follow the name-sorted
/// port order so that serialized mappings and weight tables agree.
fn port_bits(arch: &Architecture) -> Vec<u32> {
    let ports = arch.port_list();
    let mut bits = vec![0u32; arch.num_ports()];
    for (bit, port) in ports.iter().enumerate() {
        bits[port.0 as usize] = bit as u32;
    }
    bits
}

fn port_set_bv(bits: &[u32], ports: &[PortId]) -> u64 {
    let mut bv = 0u64;
    for p in ports {
        bv |= 1 << bits[p.0 as usize];
    }
    bv
}

/// Folds an instruction sequence into its weight table under `mapping`.
pub fn weight_table(mapping: &Mapping, iseq: &[InsnId]) -> WeightTable {
    let arch = mapping.arch();
    assert!(
        arch.num_ports() <= 20,
        "bottleneck evaluation is exponential in the port count"
    );
    let bits = port_bits(arch);
    let mut weights: FxHashMap<u64, u64> = FxHashMap::default();
    for insn in iseq {
        for uop in mapping.uops_of(*insn) {
            *weights.entry(port_set_bv(&bits, uop.ports())).or_insert(0) += 1;
        }
    }
    WeightTable {
        weights,
        num_ports: arch.num_ports() as u32,
    }
}

/// Cycles per iteration for `iseq` under `mapping`.
pub fn cycles(mapping: &Mapping, iseq: &[InsnId]) -> f64 {
    weight_table(mapping, iseq).bottleneck_cycles()
}

/// A [`Processor`] that predicts cycle counts from a port mapping instead
/// of measuring them.
pub struct SimProcessor {
    mapping: Mapping,
}

impl SimProcessor {
    pub fn new(mapping: Mapping) -> Self {
        SimProcessor { mapping }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }
}

impl Processor for SimProcessor {
    fn arch(&self) -> &Architecture {
        self.mapping.arch()
    }

    fn description(&self) -> String {
        "simulation processor using the bottleneck algorithm".to_owned()
    }

    fn execute(&mut self, iseq: &[InsnId]) -> ExpResult {
        ExpResult::ok(cycles(&self.mapping, iseq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Assignment, PortSet};

    fn arch2() -> Architecture {
        let mut arch = Architecture::new();
        arch.add_insns(["a", "b", "c"]).unwrap();
        arch.add_numbered_ports(2).unwrap();
        arch
    }

    fn ps(arch: &Architecture, names: &[&str]) -> PortSet {
        names.iter().map(|n| arch.port(n).unwrap()).collect()
    }

    #[test]
    fn direct_mapping_scenario() {
        // a -> {0}, b -> {1}, c -> {0,1}; [a, a, b] bottlenecks on port 0.
        let arch = arch2();
        let a = arch.insn("a").unwrap();
        let b = arch.insn("b").unwrap();
        let sets = vec![
            ps(&arch, &["0"]),
            ps(&arch, &["1"]),
            ps(&arch, &["0", "1"]),
        ];
        let mapping = Mapping::new(arch, Assignment::Direct(sets));
        let table = weight_table(&mapping, &[a, a, b]);
        assert_eq!(table.load(0b01), 2.0);
        assert_eq!(table.load(0b10), 1.0);
        assert_eq!(table.load(0b11), 1.5);
        assert_eq!(table.bottleneck_cycles(), 2.0);
    }

    #[test]
    fn decomposed_mapping_scenario() {
        // a -> [{0}, {1}]; a single a occupies both ports for one cycle.
        let arch = arch2();
        let a = arch.insn("a").unwrap();
        let uops = vec![
            vec![ps(&arch, &["0"]), ps(&arch, &["1"])],
            vec![ps(&arch, &["0", "1"])],
            vec![],
        ];
        let mapping = Mapping::new(arch, Assignment::Decomposed(uops));
        assert_eq!(cycles(&mapping, &[a]), 1.0);
    }

    #[test]
    fn single_port_uops_serialize_fully() {
        // All uops restricted to one port: cycles equals the uop count.
        let arch = arch2();
        let a = arch.insn("a").unwrap();
        let sets = vec![ps(&arch, &["0"]); 3];
        let mapping = Mapping::new(arch, Assignment::Direct(sets));
        assert_eq!(cycles(&mapping, &[a; 7]), 7.0);
    }

    #[test]
    fn full_width_uops_round_robin() {
        // Uops that may run anywhere fill all ports evenly.
        let arch = arch2();
        let a = arch.insn("a").unwrap();
        let sets = vec![ps(&arch, &["0", "1"]); 3];
        let mapping = Mapping::new(arch, Assignment::Direct(sets));
        assert_eq!(cycles(&mapping, &[a; 5]), 2.5);
    }

    #[test]
    fn every_load_is_a_lower_bound() {
        let arch = arch2();
        let a = arch.insn("a").unwrap();
        let b = arch.insn("b").unwrap();
        let c = arch.insn("c").unwrap();
        let sets = vec![
            ps(&arch, &["0"]),
            ps(&arch, &["1"]),
            ps(&arch, &["0", "1"]),
        ];
        let mapping = Mapping::new(arch, Assignment::Direct(sets));
        let table = weight_table(&mapping, &[a, b, c, c, b]);
        let cyc = table.bottleneck_cycles();
        for q in 1..(1u64 << table.num_ports()) {
            assert!(table.load(q) <= cyc + 1e-12);
        }
    }
}
