use std::collections::BTreeMap;
use std::io::{Read, Write};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::Error as _;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::arch::{ArchError, Architecture, InsnId, PortId};

/// A set of ports a uop can execute on, kept sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortSet(Vec<PortId>);

impl PortSet {
    pub fn new(mut ports: Vec<PortId>) -> Self {
        ports.sort();
        ports.dedup();
        PortSet(ports)
    }

    pub fn ports(&self) -> &[PortId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<PortId> for PortSet {
    fn from_iter<T: IntoIterator<Item = PortId>>(iter: T) -> Self {
        PortSet::new(iter.into_iter().collect())
    }
}

/// Per-instruction port assignment, indexed by [`InsnId`].
///
/// `Direct` gives each instruction a single port set (the one-uop
/// simplification, persisted as `Mapping2`); `Decomposed` gives each
/// instruction a list of uops (persisted as `Mapping3`).
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Direct(Vec<PortSet>),
    Decomposed(Vec<Vec<PortSet>>),
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("expected a document of kind Mapping2 or Mapping3, found {0:?}")]
    WrongKind(String),

    #[error("assignment is missing instruction {0:?}")]
    MissingInsn(String),

    #[error("malformed assignment entry for {insn:?}: {what}")]
    MalformedEntry { insn: String, what: String },

    #[error(transparent)]
    Arch(#[from] ArchError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// An immutable port mapping over one architecture.
#[derive(Debug, Clone)]
pub struct Mapping {
    arch: Architecture,
    assignment: Assignment,
}

impl Mapping {
    /// Builds a mapping from per-instruction data. The assignment vectors
    /// must cover every instruction of `arch` (index = instruction id).
    pub fn new(arch: Architecture, assignment: Assignment) -> Self {
        let covered = match &assignment {
            Assignment::Direct(v) => v.len(),
            Assignment::Decomposed(v) => v.len(),
        };
        assert_eq!(
            covered,
            arch.num_insns(),
            "assignment must cover every instruction of the architecture"
        );
        Mapping { arch, assignment }
    }

    pub fn arch(&self) -> &Architecture {
        &self.arch
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn kind(&self) -> &'static str {
        match self.assignment {
            Assignment::Direct(_) => "Mapping2",
            Assignment::Decomposed(_) => "Mapping3",
        }
    }

    /// The uops of one instruction: a single port set for `Direct`
    /// mappings, the uop list for `Decomposed` ones.
    pub fn uops_of(&self, insn: InsnId) -> &[PortSet] {
        match &self.assignment {
            Assignment::Direct(v) => std::slice::from_ref(&v[insn.0 as usize]),
            Assignment::Decomposed(v) => &v[insn.0 as usize],
        }
    }

    /// Uniformly random `Direct` mapping, for tests and synthetic
    /// processors.
    pub fn random_direct<R: Rng>(arch: Architecture, rng: &mut R) -> Self {
        let ports = arch.port_list();
        let assignment = (0..arch.num_insns())
            .map(|_| random_port_set(&ports, rng))
            .collect();
        Mapping::new(arch, Assignment::Direct(assignment))
    }

    /// Uniformly random `Decomposed` mapping with 1..=`max_uops` uops per
    /// instruction.
    pub fn random_decomposed<R: Rng>(arch: Architecture, max_uops: usize, rng: &mut R) -> Self {
        let ports = arch.port_list();
        let assignment = (0..arch.num_insns())
            .map(|_| {
                let num_uops = rng.gen_range(1..=max_uops);
                (0..num_uops)
                    .map(|_| random_port_set(&ports, rng))
                    .collect()
            })
            .collect();
        Mapping::new(arch, Assignment::Decomposed(assignment))
    }
}

fn random_port_set<R: Rng>(ports: &[PortId], rng: &mut R) -> PortSet {
    let size = rng.gen_range(1..=ports.len());
    let mut shuffled = ports.to_vec();
    shuffled.shuffle(rng);
    shuffled.truncate(size);
    PortSet::new(shuffled)
}

#[derive(Serialize, Deserialize)]
struct MappingJson {
    kind: String,
    arch: Architecture,
    assignment: BTreeMap<String, serde_json::Value>,
}

impl Mapping {
    fn port_set_names(&self, ps: &PortSet) -> Vec<String> {
        let mut names: Vec<String> = ps
            .ports()
            .iter()
            .map(|p| self.arch.port_name(*p).to_owned())
            .collect();
        names.sort();
        names
    }

    fn to_json(&self) -> MappingJson {
        let mut assignment = BTreeMap::new();
        for insn in self.arch.insn_list() {
            let name = self.arch.insn_name(insn).to_owned();
            let value = match &self.assignment {
                Assignment::Direct(v) => {
                    serde_json::json!(self.port_set_names(&v[insn.0 as usize]))
                }
                Assignment::Decomposed(v) => {
                    let uops: Vec<Vec<String>> = v[insn.0 as usize]
                        .iter()
                        .map(|ps| self.port_set_names(ps))
                        .collect();
                    serde_json::json!(uops)
                }
            };
            assignment.insert(name, value);
        }
        MappingJson {
            kind: self.kind().to_owned(),
            arch: self.arch.clone(),
            assignment,
        }
    }

    fn from_json(
        json: MappingJson,
        expected_arch: Option<&Architecture>,
    ) -> Result<Self, MappingError> {
        if let Some(expected) = expected_arch {
            expected.verify_matches(&json.arch)?;
        }
        let arch = json.arch;

        let parse_port_set = |insn: &str, v: &serde_json::Value| -> Result<PortSet, MappingError> {
            let names = v.as_array().ok_or_else(|| MappingError::MalformedEntry {
                insn: insn.to_owned(),
                what: "expected an array of port names".to_owned(),
            })?;
            let mut ports = Vec::with_capacity(names.len());
            for n in names {
                let n = n.as_str().ok_or_else(|| MappingError::MalformedEntry {
                    insn: insn.to_owned(),
                    what: "port name is not a string".to_owned(),
                })?;
                ports.push(arch.port(n).ok_or_else(|| ArchError::UnknownPort(n.to_owned()))?);
            }
            Ok(PortSet::new(ports))
        };

        let assignment = match json.kind.as_str() {
            "Mapping2" => {
                let mut per_insn = vec![None; arch.num_insns()];
                for (name, v) in &json.assignment {
                    let insn = arch
                        .insn(name)
                        .ok_or_else(|| ArchError::UnknownInsn(name.clone()))?;
                    per_insn[insn.0 as usize] = Some(parse_port_set(name, v)?);
                }
                let sets = unwrap_per_insn(per_insn, &arch)?;
                Assignment::Direct(sets)
            }
            "Mapping3" => {
                let mut per_insn = vec![None; arch.num_insns()];
                for (name, v) in &json.assignment {
                    let insn = arch
                        .insn(name)
                        .ok_or_else(|| ArchError::UnknownInsn(name.clone()))?;
                    let uop_values =
                        v.as_array().ok_or_else(|| MappingError::MalformedEntry {
                            insn: name.clone(),
                            what: "expected an array of uops".to_owned(),
                        })?;
                    let mut uops = Vec::with_capacity(uop_values.len());
                    for u in uop_values {
                        uops.push(parse_port_set(name, u)?);
                    }
                    per_insn[insn.0 as usize] = Some(uops);
                }
                let uop_lists = unwrap_per_insn(per_insn, &arch)?;
                Assignment::Decomposed(uop_lists)
            }
            other => return Err(MappingError::WrongKind(other.to_owned())),
        };
        Ok(Mapping { arch, assignment })
    }

    pub fn from_json_str(
        s: &str,
        expected_arch: Option<&Architecture>,
    ) -> Result<Self, MappingError> {
        let json: MappingJson = serde_json::from_str(s)?;
        Self::from_json(json, expected_arch)
    }

    pub fn from_reader<R: Read>(
        reader: R,
        expected_arch: Option<&Architecture>,
    ) -> Result<Self, MappingError> {
        let json: MappingJson = serde_json::from_reader(reader)?;
        Self::from_json(json, expected_arch)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, &self.to_json())
    }
}

fn unwrap_per_insn<T>(
    per_insn: Vec<Option<T>>,
    arch: &Architecture,
) -> Result<Vec<T>, MappingError> {
    per_insn
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| {
            entry.ok_or_else(|| MappingError::MissingInsn(arch.insn_name(InsnId(idx as u32)).to_owned()))
        })
        .collect()
}

impl serde::Serialize for Mapping {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.to_json(), serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Mapping {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = <MappingJson as serde::Deserialize>::deserialize(deserializer)?;
        Mapping::from_json(json, None).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arch3() -> Architecture {
        let mut arch = Architecture::new();
        arch.add_insns(["a", "b", "c"]).unwrap();
        arch.add_numbered_ports(2).unwrap();
        arch
    }

    fn ps(arch: &Architecture, names: &[&str]) -> PortSet {
        names.iter().map(|n| arch.port(n).unwrap()).collect()
    }

    #[test]
    fn direct_round_trip() {
        let arch = arch3();
        let sets = vec![
            ps(&arch, &["0"]),
            ps(&arch, &["1"]),
            ps(&arch, &["0", "1"]),
        ];
        let mapping = Mapping::new(arch, Assignment::Direct(sets));
        let s = serde_json::to_string(&mapping).unwrap();
        assert!(s.contains("\"Mapping2\""));
        let loaded = Mapping::from_json_str(&s, Some(mapping.arch())).unwrap();
        assert_eq!(loaded.assignment(), mapping.assignment());
    }

    #[test]
    fn decomposed_round_trip() {
        let arch = arch3();
        let a = arch.insn("a").unwrap();
        let uops = vec![
            vec![ps(&arch, &["0"]), ps(&arch, &["1"])],
            vec![ps(&arch, &["0", "1"])],
            vec![],
        ];
        let mapping = Mapping::new(arch, Assignment::Decomposed(uops));
        let s = serde_json::to_string(&mapping).unwrap();
        assert!(s.contains("\"Mapping3\""));
        let loaded = Mapping::from_json_str(&s, None).unwrap();
        let a_loaded = loaded.arch().insn("a").unwrap();
        assert_eq!(loaded.uops_of(a_loaded).len(), 2);
        assert_eq!(mapping.uops_of(a).len(), 2);
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let arch = arch3();
        let mapping = Mapping::new(
            arch,
            Assignment::Direct(vec![PortSet::new(vec![]); 3]),
        );
        let s = serde_json::to_string(&mapping).unwrap();
        let s = s.replace("Mapping2", "MappingX");
        assert!(matches!(
            Mapping::from_json_str(&s, None),
            Err(MappingError::WrongKind(_))
        ));
    }

    #[test]
    fn arch_verification_applies() {
        let arch = arch3();
        let mapping = Mapping::random_direct(arch, &mut rand::rngs::mock::StepRng::new(7, 11));
        let s = serde_json::to_string(&mapping).unwrap();
        let mut other = Architecture::new();
        other.add_insns(["a", "b"]).unwrap();
        other.add_numbered_ports(2).unwrap();
        assert!(Mapping::from_json_str(&s, Some(&other)).is_err());
    }
}
