use std::io::{Read, Write};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::Error as _;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::arch::{ArchError, Architecture, InsnId};

/// A single timed run of a benchmark, with the frequency bookkeeping needed
/// for the stability gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub benchtime: f64,
    pub cycles: f64,
    pub meas_freq: i64,
    #[serde(default)]
    pub freq_before: f64,
    #[serde(default)]
    pub freq_after: f64,
    #[serde(default)]
    pub tp_before: f64,
    #[serde(default)]
    pub tp_after: f64,
    #[serde(default)]
    pub tp_uncertainty: f64,
}

/// Why a measurement produced no cycle count.
///
/// The wire encoding is `cycles: null` plus the corresponding cause string
/// in `error_cause`; [`MeasureError::from_cause`] recovers the variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeasureError {
    #[error("frequency too unreliable for measurements, try more repetitions")]
    Unstable,

    #[error("compilation failed")]
    CompileFailed,

    #[error("execution failed")]
    ExecFailed,

    #[error("throughput missing in {tool} output")]
    ToolOutputMissing { tool: String },

    #[error("connection timeout")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl MeasureError {
    pub fn from_cause(cause: &str) -> Self {
        match cause {
            "frequency too unreliable for measurements, try more repetitions" => Self::Unstable,
            "compilation failed" => Self::CompileFailed,
            "execution failed" => Self::ExecFailed,
            "connection timeout" => Self::Timeout,
            _ => {
                if let Some(rest) = cause.strip_prefix("throughput missing in ") {
                    if let Some(tool) = rest.strip_suffix(" output") {
                        return Self::ToolOutputMissing {
                            tool: tool.to_owned(),
                        };
                    }
                }
                Self::Other(cause.to_owned())
            }
        }
    }
}

/// The result dictionary of one experiment. This is a stable boundary: it
/// is what the benchmark driver reports, what travels over the RPC channel
/// and what gets persisted inside experiment lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpResult {
    /// Cycles per testcase instance, or `None` if the measurement failed.
    pub cycles: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meas_freq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp_uncertainty: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_runs: Vec<RunRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_runs: Vec<RunRecord>,
}

impl ExpResult {
    pub fn ok(cycles: f64) -> Self {
        ExpResult {
            cycles: Some(cycles),
            ..Default::default()
        }
    }

    pub fn failed(err: MeasureError) -> Self {
        ExpResult {
            cycles: None,
            error_cause: Some(err.to_string()),
            ..Default::default()
        }
    }

    pub fn outcome(&self) -> Result<f64, MeasureError> {
        match (self.cycles, &self.error_cause) {
            (Some(c), _) => Ok(c),
            (None, Some(cause)) => Err(MeasureError::from_cause(cause)),
            (None, None) => Err(MeasureError::Other("missing result".to_owned())),
        }
    }

    /// Drops the per-repetition records, keeping only the aggregate.
    pub fn strip_runs(&mut self) {
        self.valid_runs.clear();
        self.invalid_runs.clear();
    }
}

/// A result obtained from a secondary source (a simulator, another tool),
/// attached to an experiment under a unique identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedResult {
    pub id: String,
    #[serde(flatten)]
    pub result: ExpResult,
}

#[derive(Debug, Clone)]
pub struct Experiment {
    /// Monotonic id within the owning list.
    pub rid: u64,
    pub iseq: Vec<InsnId>,
    pub result: Option<ExpResult>,
    pub other_results: Vec<TaggedResult>,
}

impl Experiment {
    pub fn cycles(&self) -> Option<f64> {
        self.result.as_ref().and_then(|r| r.cycles)
    }

    pub fn distinct_insns(&self) -> Vec<InsnId> {
        let mut insns = self.iseq.clone();
        insns.sort();
        insns.dedup();
        insns
    }

    pub fn num_occurrences(&self, insn: InsnId) -> usize {
        self.iseq.iter().filter(|i| **i == insn).count()
    }

    pub fn has_other_result(&self, id: &str) -> bool {
        self.other_results.iter().any(|r| r.id == id)
    }
}

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("trying to modify an unmodifiable experiment list")]
    Frozen,

    #[error("expected a document of kind {expected:?}, found {found:?}")]
    WrongKind { expected: &'static str, found: String },

    #[error("merge inputs disagree: {0} experiments vs {1}")]
    MergeLengthMismatch(usize, usize),

    #[error("merge inputs disagree on the sequence of experiment {0}")]
    MergeSequenceMismatch(u64),

    #[error("experiment list already contains results tagged {0:?}")]
    DuplicateIdentifier(String),

    #[error(transparent)]
    Arch(#[from] ArchError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// An ordered collection of experiments over one architecture.
#[derive(Debug, Clone)]
pub struct ExperimentList {
    pub arch: Architecture,
    exps: Vec<Experiment>,
    next_id: u64,
    modifiable: bool,
}

impl ExperimentList {
    pub fn new(arch: Architecture) -> Self {
        ExperimentList {
            arch,
            exps: Vec::new(),
            next_id: 0,
            modifiable: true,
        }
    }

    pub fn len(&self) -> usize {
        self.exps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exps.is_empty()
    }

    pub fn exps(&self) -> &[Experiment] {
        &self.exps
    }

    pub fn exps_mut(&mut self) -> &mut [Experiment] {
        &mut self.exps
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Experiment> {
        self.exps.iter()
    }

    fn check_modifiable(&self) -> Result<(), ExperimentError> {
        if self.modifiable {
            Ok(())
        } else {
            Err(ExperimentError::Frozen)
        }
    }

    pub fn create_exp(&mut self, iseq: Vec<InsnId>) -> Result<&mut Experiment, ExperimentError> {
        self.check_modifiable()?;
        let rid = self.next_id;
        self.next_id += 1;
        self.exps.push(Experiment {
            rid,
            iseq,
            result: None,
            other_results: Vec::new(),
        });
        Ok(self.exps.last_mut().unwrap())
    }

    /// Splits into two frozen views, with `round(len * ratio)` experiments
    /// in the first one. Useful for training/evaluation partitions.
    pub fn split_randomly<R: Rng>(&self, ratio: f64, rng: &mut R) -> (Self, Self) {
        let mut shuffled = self.exps.clone();
        shuffled.shuffle(rng);
        let in_a = (shuffled.len() as f64 * ratio).round() as usize;
        let in_a = in_a.min(shuffled.len());
        let rest = shuffled.split_off(in_a);
        let freeze = |exps: Vec<Experiment>| ExperimentList {
            arch: self.arch.clone(),
            next_id: self.next_id,
            exps,
            modifiable: false,
        };
        (freeze(shuffled), freeze(rest))
    }

    /// True if any experiment already carries an `other_results` entry with
    /// this identifier.
    pub fn has_identifier(&self, id: &str) -> bool {
        self.exps.iter().any(|e| e.has_other_result(id))
    }

    /// Folds the `other_results` of `other` into this list. Both lists must
    /// contain the same experiments in the same order; entries whose id is
    /// already present on an experiment are dropped, never overwritten.
    /// Returns the number of adopted entries.
    pub fn merge_other_results(&mut self, other: &ExperimentList) -> Result<usize, ExperimentError> {
        if self.exps.len() != other.exps.len() {
            return Err(ExperimentError::MergeLengthMismatch(
                self.exps.len(),
                other.exps.len(),
            ));
        }
        let mut adopted = 0;
        for (e, other_e) in self.exps.iter_mut().zip(other.exps.iter()) {
            let same_seq = e.iseq.len() == other_e.iseq.len()
                && e.iseq
                    .iter()
                    .zip(other_e.iseq.iter())
                    .all(|(a, b)| self.arch.insn_name(*a) == other.arch.insn_name(*b));
            if !same_seq {
                return Err(ExperimentError::MergeSequenceMismatch(e.rid));
            }
            for r in &other_e.other_results {
                if e.has_other_result(&r.id) {
                    continue;
                }
                e.other_results.push(r.clone());
                adopted += 1;
            }
        }
        Ok(adopted)
    }
}

impl<'a> IntoIterator for &'a ExperimentList {
    type Item = &'a Experiment;
    type IntoIter = std::slice::Iter<'a, Experiment>;

    fn into_iter(self) -> Self::IntoIter {
        self.exps.iter()
    }
}

#[derive(Serialize, Deserialize)]
struct ExperimentJson {
    kind: String,
    iseq: Vec<String>,
    result: Option<ExpResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    other_results: Option<Vec<TaggedResult>>,
}

#[derive(Serialize, Deserialize)]
struct ExperimentListJson {
    kind: String,
    arch: Architecture,
    exps: Vec<ExperimentJson>,
}

impl ExperimentList {
    fn to_json(&self) -> ExperimentListJson {
        ExperimentListJson {
            kind: "ExperimentList".to_owned(),
            arch: self.arch.clone(),
            exps: self
                .exps
                .iter()
                .map(|e| ExperimentJson {
                    kind: "Experiment".to_owned(),
                    iseq: e
                        .iseq
                        .iter()
                        .map(|i| self.arch.insn_name(*i).to_owned())
                        .collect(),
                    result: e.result.clone(),
                    other_results: if e.other_results.is_empty() {
                        None
                    } else {
                        Some(e.other_results.clone())
                    },
                })
                .collect(),
        }
    }

    fn from_json(
        json: ExperimentListJson,
        expected_arch: Option<&Architecture>,
    ) -> Result<Self, ExperimentError> {
        if json.kind != "ExperimentList" {
            return Err(ExperimentError::WrongKind {
                expected: "ExperimentList",
                found: json.kind,
            });
        }
        if let Some(expected) = expected_arch {
            expected.verify_matches(&json.arch)?;
        }
        let arch = json.arch;
        let mut list = ExperimentList::new(arch);
        for e in json.exps {
            if e.kind != "Experiment" {
                return Err(ExperimentError::WrongKind {
                    expected: "Experiment",
                    found: e.kind,
                });
            }
            let mut iseq = Vec::with_capacity(e.iseq.len());
            for name in &e.iseq {
                let id = list
                    .arch
                    .insn(name)
                    .ok_or_else(|| ArchError::UnknownInsn(name.clone()))?;
                iseq.push(id);
            }
            let exp = list.create_exp(iseq)?;
            exp.result = e.result;
            exp.other_results = e.other_results.unwrap_or_default();
        }
        Ok(list)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ExperimentError> {
        let json: ExperimentListJson = serde_json::from_str(s)?;
        Self::from_json(json, None)
    }

    pub fn from_reader<R: Read>(
        reader: R,
        expected_arch: Option<&Architecture>,
    ) -> Result<Self, ExperimentError> {
        let json: ExperimentListJson = serde_json::from_reader(reader)?;
        Self::from_json(json, expected_arch)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, &self.to_json())
    }
}

impl serde::Serialize for ExperimentList {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.to_json(), serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ExperimentList {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = <ExperimentListJson as serde::Deserialize>::deserialize(deserializer)?;
        ExperimentList::from_json(json, None).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_list() -> ExperimentList {
        let mut arch = Architecture::new();
        arch.add_insns(["a", "b", "c"]).unwrap();
        arch.add_numbered_ports(2).unwrap();
        let a = arch.insn("a").unwrap();
        let b = arch.insn("b").unwrap();
        let mut list = ExperimentList::new(arch);
        list.create_exp(vec![a]).unwrap().result = Some(ExpResult::ok(1.0));
        list.create_exp(vec![a, b]).unwrap().result = Some(ExpResult::ok(2.0));
        list
    }

    #[test]
    fn rids_are_monotonic() {
        let list = sample_list();
        let rids: Vec<u64> = list.iter().map(|e| e.rid).collect();
        assert_eq!(rids, [0, 1]);
    }

    #[test]
    fn json_round_trip() {
        let mut list = sample_list();
        list.exps_mut()[0].other_results.push(TaggedResult {
            id: "sim".to_owned(),
            result: ExpResult::ok(1.5),
        });
        let s = serde_json::to_string(&list).unwrap();
        let loaded = ExperimentList::from_json_str(&s).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.exps()[0].cycles(), Some(1.0));
        assert_eq!(loaded.exps()[0].other_results[0].id, "sim");
        assert_eq!(loaded.exps()[1].iseq.len(), 2);
        list.arch.verify_matches(&loaded.arch).unwrap();
    }

    #[test]
    fn load_with_mismatching_arch_fails() {
        let list = sample_list();
        let s = serde_json::to_string(&list).unwrap();
        let json: ExperimentListJson = serde_json::from_str(&s).unwrap();
        let mut other = Architecture::new();
        other.add_insns(["a", "b"]).unwrap();
        other.add_numbered_ports(2).unwrap();
        assert!(ExperimentList::from_json(json, Some(&other)).is_err());
    }

    #[test]
    fn merging_a_list_into_itself_changes_nothing() {
        let mut list = sample_list();
        list.exps_mut()[1].other_results.push(TaggedResult {
            id: "sim".to_owned(),
            result: ExpResult::ok(2.5),
        });
        let copy = list.clone();
        let adopted = list.merge_other_results(&copy).unwrap();
        assert_eq!(adopted, 0);
        assert_eq!(list.exps()[1].other_results.len(), 1);
    }

    #[test]
    fn merge_adopts_new_ids_only() {
        let mut list = sample_list();
        list.exps_mut()[0].other_results.push(TaggedResult {
            id: "sim".to_owned(),
            result: ExpResult::ok(1.5),
        });
        let mut other = list.clone();
        other.exps_mut()[0].other_results[0].result = ExpResult::ok(99.0);
        other.exps_mut()[0].other_results.push(TaggedResult {
            id: "mca".to_owned(),
            result: ExpResult::ok(3.0),
        });
        let adopted = list.merge_other_results(&other).unwrap();
        assert_eq!(adopted, 1);
        // the existing "sim" entry was not overwritten
        assert_eq!(list.exps()[0].other_results[0].result.cycles, Some(1.5));
        assert!(list.exps()[0].has_other_result("mca"));
    }

    #[test]
    fn split_views_are_frozen() {
        let list = sample_list();
        let mut rng = StdRng::seed_from_u64(1);
        let (mut a, b) = list.split_randomly(0.5, &mut rng);
        assert_eq!(a.len() + b.len(), list.len());
        assert!(matches!(
            a.create_exp(vec![]),
            Err(ExperimentError::Frozen)
        ));
    }

    #[test]
    fn cause_strings_round_trip() {
        for err in [
            MeasureError::Unstable,
            MeasureError::CompileFailed,
            MeasureError::ExecFailed,
            MeasureError::Timeout,
            MeasureError::ToolOutputMissing {
                tool: "iaca".to_owned(),
            },
        ] {
            let res = ExpResult::failed(err.clone());
            assert_eq!(res.outcome(), Err(err));
        }
    }
}
