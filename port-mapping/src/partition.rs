use itertools::Itertools;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::arch::{ArchError, Architecture, InsnId};
use crate::experiment::{ExperimentError, ExperimentList};
use crate::mapping::{Assignment, Mapping, MappingError, PortSet};

/// How close two cycle counts must be to count as indistinguishable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tolerance {
    /// `|a - b| <= eps`
    Absolute(f64),
    /// `2|a - b| <= eps * (a + b)`, scale-invariant.
    Relative(f64),
}

impl Tolerance {
    pub fn eq(&self, a: f64, b: f64) -> bool {
        match *self {
            Tolerance::Absolute(eps) => (a - b).abs() <= eps,
            Tolerance::Relative(eps) => 2.0 * (a - b).abs() <= eps * (a + b),
        }
    }
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("experiment {rid} is not a singleton (length {len})")]
    NotASingleton { rid: u64, len: usize },

    #[error("experiment {rid} does not contain exactly two distinct instructions")]
    NotAPair { rid: u64 },

    #[error("experiment {rid} carries no cycle count")]
    MissingCycles { rid: u64 },

    #[error("no singleton experiment for instruction {0:?}")]
    MissingSingleton(String),

    #[error("mapping over representatives is missing {0:?}")]
    MissingRepresentative(String),

    #[error(transparent)]
    Arch(#[from] ArchError),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// A partition of instructions into equivalence buckets.
#[derive(Debug, Clone)]
pub struct Partition {
    pub buckets: Vec<Vec<InsnId>>,
    bucket_of: FxHashMap<InsnId, usize>,
}

impl Partition {
    pub fn bucket_of(&self, insn: InsnId) -> &[InsnId] {
        &self.buckets[self.bucket_of[&insn]]
    }
}

struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n as u32).collect(),
        }
    }

    fn find(&mut self, x: u32) -> u32 {
        let mut root = x;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        // path compression
        let mut cur = x;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb as usize] = ra;
        }
    }
}

/// Buckets `elems` by the symmetric relation `equiv`, closed transitively.
pub fn create_partition(
    elems: &[InsnId],
    mut equiv: impl FnMut(InsnId, InsnId) -> bool,
) -> Partition {
    let index_of: FxHashMap<InsnId, u32> = elems
        .iter()
        .enumerate()
        .map(|(idx, insn)| (*insn, idx as u32))
        .collect();
    let mut uf = UnionFind::new(elems.len());
    for (a, b) in elems.iter().tuple_combinations() {
        if equiv(*a, *b) {
            uf.union(index_of[a], index_of[b]);
        }
    }
    let mut root_to_bucket: FxHashMap<u32, usize> = FxHashMap::default();
    let mut buckets: Vec<Vec<InsnId>> = Vec::new();
    let mut bucket_of = FxHashMap::default();
    for insn in elems {
        let root = uf.find(index_of[insn]);
        let bucket = *root_to_bucket.entry(root).or_insert_with(|| {
            buckets.push(Vec::new());
            buckets.len() - 1
        });
        buckets[bucket].push(*insn);
        bucket_of.insert(*insn, bucket);
    }
    Partition { buckets, bucket_of }
}

/// Per-instruction singleton cycle counts, pulled out of a singleton
/// experiment list.
pub fn singleton_cycles(
    singleton_elist: &ExperimentList,
) -> Result<FxHashMap<InsnId, f64>, PartitionError> {
    let mut res = FxHashMap::default();
    for e in singleton_elist {
        if e.iseq.len() != 1 {
            return Err(PartitionError::NotASingleton {
                rid: e.rid,
                len: e.iseq.len(),
            });
        }
        let cycles = e
            .cycles()
            .ok_or(PartitionError::MissingCycles { rid: e.rid })?;
        res.insert(e.iseq[0], cycles);
    }
    Ok(res)
}

/// Partitions the instructions of `elist.arch` into classes that no
/// experiment of `singleton_elist` (stage 1) or `pair_elist` (stage 2) can
/// distinguish under the tolerance.
pub fn partition_instructions(
    pair_elist: &ExperimentList,
    singleton_elist: &ExperimentList,
    tol: Tolerance,
) -> Result<Partition, PartitionError> {
    let arch = &pair_elist.arch;
    let insns = arch.insn_list();

    // The singleton list may carry its own architecture with a different
    // id order; translate by name into the pair list's id space.
    let mut singletons: FxHashMap<InsnId, f64> = FxHashMap::default();
    for (id, cycles) in singleton_cycles(singleton_elist)? {
        let name = singleton_elist.arch.insn_name(id);
        if let Some(our_id) = arch.insn(name) {
            singletons.insert(our_id, cycles);
        }
    }
    for insn in &insns {
        if !singletons.contains_key(insn) {
            return Err(PartitionError::MissingSingleton(
                arch.insn_name(*insn).to_owned(),
            ));
        }
    }

    // Stage 1: bucket by the singleton measurements alone.
    let coarse = create_partition(&insns, |a, b| tol.eq(singletons[&a], singletons[&b]));

    // Index the pair experiments by both of their instructions.
    let mut pair_exps: FxHashMap<InsnId, FxHashMap<InsnId, Vec<usize>>> = FxHashMap::default();
    for (idx, e) in pair_elist.iter().enumerate() {
        let distinct = e.distinct_insns();
        if distinct.len() != 2 {
            return Err(PartitionError::NotAPair { rid: e.rid });
        }
        let (i, j) = (distinct[0], distinct[1]);
        pair_exps.entry(i).or_default().entry(j).or_default().push(idx);
        pair_exps.entry(j).or_default().entry(i).or_default().push(idx);
    }
    let empty: FxHashMap<InsnId, Vec<usize>> = FxHashMap::default();

    // Stage 2: within each coarse bucket, compare the pair experiments that
    // combine the two candidates with every third instruction, in ascending
    // order of length. Any length or cycles mismatch distinguishes them.
    let check_pair_equivalent = |i1: InsnId, i2: InsnId| -> Result<bool, PartitionError> {
        let i1_exps = pair_exps.get(&i1).unwrap_or(&empty);
        let i2_exps = pair_exps.get(&i2).unwrap_or(&empty);
        for third in &insns {
            if *third == i1 || *third == i2 {
                continue;
            }
            let mut e1s: Vec<&crate::experiment::Experiment> = i1_exps
                .get(third)
                .map(|v| v.iter().map(|idx| &pair_elist.exps()[*idx]).collect())
                .unwrap_or_default();
            let mut e2s: Vec<&crate::experiment::Experiment> = i2_exps
                .get(third)
                .map(|v| v.iter().map(|idx| &pair_elist.exps()[*idx]).collect())
                .unwrap_or_default();
            e1s.sort_by_key(|e| e.iseq.len());
            e2s.sort_by_key(|e| e.iseq.len());
            for (e1, e2) in e1s.iter().zip(e2s.iter()) {
                if e1.iseq.len() != e2.iseq.len() {
                    log::warn!(
                        "corresponding experiments with differing length: {} vs {}",
                        e1.rid,
                        e2.rid
                    );
                    return Ok(false);
                }
                let c1 = e1
                    .cycles()
                    .ok_or(PartitionError::MissingCycles { rid: e1.rid })?;
                let c2 = e2
                    .cycles()
                    .ok_or(PartitionError::MissingCycles { rid: e2.rid })?;
                if !tol.eq(c1, c2) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    };

    let mut fine_pairs: FxHashMap<(InsnId, InsnId), bool> = FxHashMap::default();
    for bucket in &coarse.buckets {
        for (i1, i2) in bucket.iter().tuple_combinations() {
            fine_pairs.insert((*i1, *i2), check_pair_equivalent(*i1, *i2)?);
        }
    }

    Ok(create_partition(&insns, |a, b| {
        *fine_pairs
            .get(&(a, b))
            .or_else(|| fine_pairs.get(&(b, a)))
            .unwrap_or(&false)
    }))
}

/// Picks the lexicographically smallest instruction name of each bucket.
/// Returns the representatives and the member-to-representative map.
pub fn compute_representatives(
    arch: &Architecture,
    partition: &Partition,
) -> (Vec<InsnId>, FxHashMap<InsnId, InsnId>) {
    let mut representatives = Vec::with_capacity(partition.buckets.len());
    let mut insn_to_rep = FxHashMap::default();
    for bucket in &partition.buckets {
        let rep = *bucket
            .iter()
            .min_by_key(|i| arch.insn_name(**i))
            .expect("buckets are never empty");
        representatives.push(rep);
        for insn in bucket {
            insn_to_rep.insert(*insn, rep);
        }
    }
    (representatives, insn_to_rep)
}

/// Restricts an experiment list to the representative instructions: every
/// experiment mentioning a non-representative is dropped, and the result
/// lives on a fresh architecture that only knows the representatives.
pub fn restrict_elist(
    elist: &ExperimentList,
    representatives: &[InsnId],
) -> Result<ExperimentList, PartitionError> {
    let arch = &elist.arch;
    let mut new_arch = Architecture::new();
    let mut sorted_reps = representatives.to_vec();
    sorted_reps.sort_by(|a, b| arch.insn_name(*a).cmp(arch.insn_name(*b)));
    for rep in &sorted_reps {
        new_arch.add_insn(arch.insn_name(*rep))?;
    }
    for port in arch.port_list() {
        new_arch.add_port(arch.port_name(port))?;
    }

    let keep: FxHashMap<InsnId, InsnId> = sorted_reps
        .iter()
        .map(|rep| {
            let new_id = new_arch
                .insn(arch.insn_name(*rep))
                .expect("just inserted above");
            (*rep, new_id)
        })
        .collect();

    let mut new_elist = ExperimentList::new(new_arch);
    for e in elist {
        let mut new_iseq = Vec::with_capacity(e.iseq.len());
        let mut dropped = false;
        for insn in &e.iseq {
            match keep.get(insn) {
                Some(new_id) => new_iseq.push(*new_id),
                None => {
                    dropped = true;
                    break;
                }
            }
        }
        if dropped {
            continue;
        }
        let new_exp = new_elist.create_exp(new_iseq)?;
        new_exp.result = e.result.clone();
        new_exp.other_results = e.other_results.clone();
    }
    Ok(new_elist)
}

/// Extends a mapping that covers only representatives back to the full
/// architecture: every instruction adopts its representative's assignment.
pub fn generalize_mapping(
    full_arch: &Architecture,
    mapping: &Mapping,
    insn_to_rep: &FxHashMap<InsnId, InsnId>,
) -> Result<Mapping, PartitionError> {
    let rep_arch = mapping.arch();
    let port_of = |rep_port: crate::arch::PortId| -> Result<crate::arch::PortId, PartitionError> {
        full_arch
            .port(rep_arch.port_name(rep_port))
            .ok_or_else(|| ArchError::UnknownPort(rep_arch.port_name(rep_port).to_owned()).into())
    };

    let mut assignment: Vec<Vec<PortSet>> = Vec::with_capacity(full_arch.num_insns());
    for idx in 0..full_arch.num_insns() {
        let insn = InsnId(idx as u32);
        let rep = insn_to_rep.get(&insn).copied().unwrap_or(insn);
        let rep_name = full_arch.insn_name(rep);
        let rep_in_mapping = rep_arch
            .insn(rep_name)
            .ok_or_else(|| PartitionError::MissingRepresentative(rep_name.to_owned()))?;
        let mut uops = Vec::new();
        for uop in mapping.uops_of(rep_in_mapping) {
            let ports: Result<Vec<_>, _> = uop.ports().iter().map(|p| port_of(*p)).collect();
            uops.push(PortSet::new(ports?));
        }
        assignment.push(uops);
    }
    Ok(Mapping::new(
        full_arch.clone(),
        Assignment::Decomposed(assignment),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExpResult;

    fn arch4() -> Architecture {
        let mut arch = Architecture::new();
        arch.add_insns(["add", "sub", "mul", "div"]).unwrap();
        arch.add_numbered_ports(3).unwrap();
        arch
    }

    fn singleton_list(arch: &Architecture, cycles: &[(&str, f64)]) -> ExperimentList {
        let mut list = ExperimentList::new(arch.clone());
        for (name, c) in cycles {
            let insn = arch.insn(name).unwrap();
            list.create_exp(vec![insn]).unwrap().result = Some(ExpResult::ok(*c));
        }
        list
    }

    fn add_pair(list: &mut ExperimentList, iseq: &[&str], cycles: f64) {
        let ids: Vec<InsnId> = iseq
            .iter()
            .map(|n| list.arch.insn(n).unwrap())
            .collect();
        list.create_exp(ids).unwrap().result = Some(ExpResult::ok(cycles));
    }

    #[test]
    fn stage1_separates_clearly_different_singletons() {
        let arch = arch4();
        let singles = singleton_list(
            &arch,
            &[("add", 1.0), ("sub", 1.0), ("mul", 3.0), ("div", 10.0)],
        );
        let pairs = ExperimentList::new(arch.clone());
        let partition =
            partition_instructions(&pairs, &singles, Tolerance::Relative(0.05)).unwrap();
        // add and sub merge; mul and div stay alone.
        assert_eq!(partition.buckets.len(), 3);
        let add = arch.insn("add").unwrap();
        let sub = arch.insn("sub").unwrap();
        assert_eq!(partition.bucket_of(add), partition.bucket_of(sub));
    }

    #[test]
    fn stage2_distinguishes_by_pair_experiments() {
        let arch = arch4();
        let singles = singleton_list(
            &arch,
            &[("add", 1.0), ("sub", 1.0), ("mul", 1.0), ("div", 10.0)],
        );
        let mut pairs = ExperimentList::new(arch.clone());
        // mul competes with add for a port, sub does not.
        add_pair(&mut pairs, &["add", "sub"], 2.0);
        add_pair(&mut pairs, &["add", "mul"], 2.0);
        add_pair(&mut pairs, &["sub", "mul"], 1.0);
        add_pair(&mut pairs, &["add", "div"], 10.0);
        add_pair(&mut pairs, &["sub", "div"], 10.0);
        add_pair(&mut pairs, &["mul", "div"], 10.0);
        let partition =
            partition_instructions(&pairs, &singles, Tolerance::Relative(0.05)).unwrap();
        let add = arch.insn("add").unwrap();
        let sub = arch.insn("sub").unwrap();
        assert_ne!(
            partition.bucket_of(add).to_vec(),
            partition.bucket_of(sub).to_vec()
        );
    }

    #[test]
    fn representatives_are_lexicographically_smallest() {
        let arch = arch4();
        let singles = singleton_list(
            &arch,
            &[("add", 1.0), ("sub", 1.0), ("mul", 1.0), ("div", 1.0)],
        );
        let pairs = ExperimentList::new(arch.clone());
        let partition =
            partition_instructions(&pairs, &singles, Tolerance::Relative(0.05)).unwrap();
        assert_eq!(partition.buckets.len(), 1);
        let (reps, insn_to_rep) = compute_representatives(&arch, &partition);
        assert_eq!(reps.len(), 1);
        assert_eq!(arch.insn_name(reps[0]), "add");
        assert!(insn_to_rep.values().all(|r| *r == reps[0]));
    }

    #[test]
    fn restrict_drops_foreign_experiments() {
        let arch = arch4();
        let mut list = ExperimentList::new(arch.clone());
        add_pair(&mut list, &["add", "mul"], 2.0);
        add_pair(&mut list, &["add", "sub"], 1.0);
        let reps = vec![arch.insn("add").unwrap(), arch.insn("mul").unwrap()];
        let restricted = restrict_elist(&list, &reps).unwrap();
        assert_eq!(restricted.arch.num_insns(), 2);
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted.exps()[0].iseq.len(), 2);
    }

    #[test]
    fn generalize_round_trips_uniform_mappings() {
        // If all equivalent instructions share their assignment, then
        // generalize(restrict(M)) == M.
        let arch = arch4();
        let p0 = arch.port("0").unwrap();
        let p1 = arch.port("1").unwrap();
        let uop = PortSet::new(vec![p0, p1]);
        let assignment: Vec<Vec<PortSet>> = vec![vec![uop.clone()]; arch.num_insns()];
        let full = Mapping::new(arch.clone(), Assignment::Decomposed(assignment));

        let add = arch.insn("add").unwrap();
        let insn_to_rep: FxHashMap<InsnId, InsnId> =
            arch.insn_list().into_iter().map(|i| (i, add)).collect();

        let mut rep_arch = Architecture::new();
        rep_arch.add_insn("add").unwrap();
        rep_arch.add_numbered_ports(3).unwrap();
        let rep_uop = PortSet::new(vec![rep_arch.port("0").unwrap(), rep_arch.port("1").unwrap()]);
        let restricted = Mapping::new(rep_arch, Assignment::Decomposed(vec![vec![rep_uop]]));

        let generalized = generalize_mapping(&arch, &restricted, &insn_to_rep).unwrap();
        for insn in arch.insn_list() {
            assert_eq!(generalized.uops_of(insn), full.uops_of(insn));
        }
    }
}
