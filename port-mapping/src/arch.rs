use std::collections::BTreeSet;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::de::Error as _;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Index of an instruction within its [`Architecture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InsnId(pub u32);

/// Index of a port within its [`Architecture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u32);

#[derive(Debug, Error)]
pub enum ArchError {
    #[error("duplicate instruction name: {0}")]
    DuplicateInsn(String),

    #[error("duplicate port name: {0}")]
    DuplicatePort(String),

    #[error("unknown instruction name: {0}")]
    UnknownInsn(String),

    #[error("unknown port name: {0}")]
    UnknownPort(String),

    #[error("restriction contains instruction id {0:?} outside this architecture")]
    RestrictionOutOfRange(InsnId),

    #[error("expected a document of kind {expected:?}, found {found:?}")]
    WrongKind { expected: &'static str, found: String },

    #[error("architecture mismatch: instructions differ\n  ours:   {ours:?}\n  theirs: {theirs:?}")]
    InsnSetMismatch { ours: Vec<String>, theirs: Vec<String> },

    #[error("architecture mismatch: ports differ\n  ours:   {ours:?}\n  theirs: {theirs:?}")]
    PortSetMismatch { ours: Vec<String>, theirs: Vec<String> },
}

/// Instruction names may contain whitespace in the instruction-form files;
/// persisted names never do.
pub fn normalize_insn_name(name: &str) -> String {
    name.replace([' ', '\t'], "_")
}

/// The set of instructions and ports under consideration.
///
/// Names are interned once; all hot paths pass [`InsnId`]/[`PortId`]. The
/// optional restriction temporarily narrows the visible instruction set
/// (e.g. to equivalence-class representatives) without forgetting the rest.
#[derive(Debug, Clone, Default)]
pub struct Architecture {
    name: Option<String>,
    insn_names: Vec<String>,
    insn_index: FxHashMap<String, InsnId>,
    port_names: Vec<String>,
    port_index: FxHashMap<String, PortId>,
    restriction: Option<BTreeSet<InsnId>>,
}

impl Architecture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_display_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn add_insn(&mut self, name: &str) -> Result<InsnId, ArchError> {
        let name = normalize_insn_name(name);
        if self.insn_index.contains_key(&name) {
            return Err(ArchError::DuplicateInsn(name));
        }
        let id = InsnId(self.insn_names.len() as u32);
        self.insn_index.insert(name.clone(), id);
        self.insn_names.push(name);
        Ok(id)
    }

    pub fn add_port(&mut self, name: &str) -> Result<PortId, ArchError> {
        if self.port_index.contains_key(name) {
            return Err(ArchError::DuplicatePort(name.to_owned()));
        }
        let id = PortId(self.port_names.len() as u32);
        self.port_index.insert(name.to_owned(), id);
        self.port_names.push(name.to_owned());
        Ok(id)
    }

    pub fn add_insns<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ArchError> {
        for n in names {
            self.add_insn(n)?;
        }
        Ok(())
    }

    pub fn add_numbered_ports(&mut self, num: u32) -> Result<(), ArchError> {
        for i in 0..num {
            self.add_port(&i.to_string())?;
        }
        Ok(())
    }

    pub fn insn_name(&self, id: InsnId) -> &str {
        &self.insn_names[id.0 as usize]
    }

    pub fn port_name(&self, id: PortId) -> &str {
        &self.port_names[id.0 as usize]
    }

    /// Looks up an instruction by (normalized) name.
    pub fn insn(&self, name: &str) -> Option<InsnId> {
        self.insn_index.get(&normalize_insn_name(name)).copied()
    }

    pub fn port(&self, name: &str) -> Option<PortId> {
        self.port_index.get(name).copied()
    }

    pub fn num_insns(&self) -> usize {
        self.insn_names.len()
    }

    pub fn num_ports(&self) -> usize {
        self.port_names.len()
    }

    /// All instructions, name-sorted, honoring the restriction if one is set.
    pub fn insn_list(&self) -> Vec<InsnId> {
        let mut ids: Vec<InsnId> = match &self.restriction {
            Some(allowed) => allowed.iter().copied().collect(),
            None => (0..self.insn_names.len() as u32).map(InsnId).collect(),
        };
        ids.sort_by(|a, b| self.insn_name(*a).cmp(self.insn_name(*b)));
        ids
    }

    /// All ports, name-sorted.
    pub fn port_list(&self) -> Vec<PortId> {
        let mut ids: Vec<PortId> = (0..self.port_names.len() as u32).map(PortId).collect();
        ids.sort_by(|a, b| self.port_name(*a).cmp(self.port_name(*b)));
        ids
    }

    /// Narrows the visible instruction set. The restriction must not name
    /// instructions outside this architecture.
    pub fn restrict_insns(
        &mut self,
        insns: impl IntoIterator<Item = InsnId>,
    ) -> Result<(), ArchError> {
        let set: BTreeSet<InsnId> = insns.into_iter().collect();
        for id in &set {
            if id.0 as usize >= self.insn_names.len() {
                return Err(ArchError::RestrictionOutOfRange(*id));
            }
        }
        self.restriction = Some(set);
        Ok(())
    }

    pub fn unrestrict_insns(&mut self) {
        self.restriction = None;
    }

    pub fn is_restricted(&self) -> bool {
        self.restriction.is_some()
    }

    fn sorted_insn_names(&self) -> Vec<String> {
        self.insn_list()
            .into_iter()
            .map(|i| self.insn_name(i).to_owned())
            .collect()
    }

    fn sorted_port_names(&self) -> Vec<String> {
        self.port_list()
            .into_iter()
            .map(|p| self.port_name(p).to_owned())
            .collect()
    }

    /// Checks that `insns`/`ports` name exactly this architecture's
    /// instruction and port sets. Used when a file embeds an architecture
    /// that must match an externally supplied one.
    pub fn verify_names(&self, insns: &[String], ports: &[String]) -> Result<(), ArchError> {
        let ours: BTreeSet<String> = self.sorted_insn_names().into_iter().collect();
        let theirs: BTreeSet<String> = insns.iter().map(|n| normalize_insn_name(n)).collect();
        if ours != theirs {
            return Err(ArchError::InsnSetMismatch {
                ours: ours.into_iter().collect(),
                theirs: theirs.into_iter().collect(),
            });
        }
        let ours: BTreeSet<String> = self.sorted_port_names().into_iter().collect();
        let theirs: BTreeSet<String> = ports.iter().cloned().collect();
        if ours != theirs {
            return Err(ArchError::PortSetMismatch {
                ours: ours.into_iter().collect(),
                theirs: theirs.into_iter().collect(),
            });
        }
        Ok(())
    }

    pub fn verify_matches(&self, other: &Architecture) -> Result<(), ArchError> {
        self.verify_names(&other.sorted_insn_names(), &other.sorted_port_names())
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Architecture({} insns, {} ports)",
            self.num_insns(),
            self.num_ports()
        )
    }
}

#[derive(Serialize, Deserialize)]
struct ArchJson {
    kind: String,
    insns: Vec<String>,
    ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl Architecture {
    fn to_json(&self) -> ArchJson {
        ArchJson {
            kind: "Architecture".to_owned(),
            insns: self.sorted_insn_names(),
            ports: self.sorted_port_names(),
            name: self.name.clone(),
        }
    }

    fn from_json(json: ArchJson) -> Result<Self, ArchError> {
        if json.kind != "Architecture" {
            return Err(ArchError::WrongKind {
                expected: "Architecture",
                found: json.kind,
            });
        }
        let mut arch = Architecture::new();
        arch.add_insns(json.insns.iter().map(String::as_str))?;
        for p in &json.ports {
            arch.add_port(p)?;
        }
        arch.name = json.name;
        Ok(arch)
    }
}

impl serde::Serialize for Architecture {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.to_json(), serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Architecture {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = <ArchJson as serde::Deserialize>::deserialize(deserializer)?;
        Architecture::from_json(json).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arch_ab() -> Architecture {
        let mut arch = Architecture::new();
        arch.add_insns(["b", "a", "c"]).unwrap();
        arch.add_numbered_ports(2).unwrap();
        arch
    }

    #[test]
    fn insn_list_is_name_sorted() {
        let arch = arch_ab();
        let names: Vec<&str> = arch.insn_list().iter().map(|i| arch.insn_name(*i)).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut arch = arch_ab();
        assert!(matches!(arch.add_insn("a"), Err(ArchError::DuplicateInsn(_))));
        assert!(matches!(arch.add_port("0"), Err(ArchError::DuplicatePort(_))));
    }

    #[test]
    fn names_are_normalized() {
        let mut arch = Architecture::new();
        let id = arch.add_insn("add rax, 44").unwrap();
        assert_eq!(arch.insn_name(id), "add_rax,_44");
        assert_eq!(arch.insn("add rax, 44"), Some(id));
    }

    #[test]
    fn restriction_narrows_insn_list() {
        let mut arch = arch_ab();
        let a = arch.insn("a").unwrap();
        let c = arch.insn("c").unwrap();
        arch.restrict_insns([c, a]).unwrap();
        let names: Vec<&str> = arch.insn_list().iter().map(|i| arch.insn_name(*i)).collect();
        assert_eq!(names, ["a", "c"]);
        arch.unrestrict_insns();
        assert_eq!(arch.insn_list().len(), 3);
    }

    #[test]
    fn restriction_must_be_subset() {
        let mut arch = arch_ab();
        assert!(arch.restrict_insns([InsnId(17)]).is_err());
    }

    #[test]
    fn json_round_trip() {
        let arch = arch_ab();
        let s = serde_json::to_string(&arch).unwrap();
        let loaded: Architecture = serde_json::from_str(&s).unwrap();
        arch.verify_matches(&loaded).unwrap();
    }

    #[test]
    fn verify_rejects_differing_sets() {
        let arch = arch_ab();
        let mut other = Architecture::new();
        other.add_insns(["a", "b"]).unwrap();
        other.add_numbered_ports(2).unwrap();
        assert!(matches!(
            arch.verify_matches(&other),
            Err(ArchError::InsnSetMismatch { .. })
        ));
    }
}
