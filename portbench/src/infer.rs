//! Port-mapping inference.
//!
//! The heavy lifting is done by an external evolutionary search binary;
//! this module owns the invocation contract (textual experiment list on
//! stdin, JSON mapping on stdout) and the partitioning wrapper that
//! shrinks the search's input to one representative per equivalence class
//! before generalizing the result back to the full instruction set.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde_derive::Deserialize;

use port_mapping::experiment::ExperimentList;
use port_mapping::mapping::Mapping;
use port_mapping::partition::{
    compute_representatives, partition_instructions, restrict_elist, generalize_mapping, Tolerance,
};

use crate::cli::InferArgs;
use crate::errors::{fail, CliError};

fn default_epsilon() -> f64 {
    0.1
}

fn default_partitioning() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct InferrerConfig {
    /// Which inference engine to use; only the evolutionary search is
    /// wired up.
    pub inferrer: String,
    /// Path to the search binary.
    pub bin_path: PathBuf,
    /// Config file handed through to the search binary.
    pub config_path: PathBuf,
    /// Tolerance for the equivalence partitioning.
    #[serde(default = "default_epsilon")]
    pub equivalence_epsilon: f64,
    /// Run inference on equivalence-class representatives only.
    #[serde(default = "default_partitioning")]
    pub partitioning: bool,
}

/// The indented block format the search binary reads.
pub fn export_explist(elist: &ExperimentList) -> Result<String, CliError> {
    let indent = "    ";
    let arch = &elist.arch;
    let mut out = String::new();
    out.push_str("architecture:\n");
    out.push_str(&format!("{indent}instructions:\n"));
    for insn in arch.insn_list() {
        out.push_str(&format!("{indent}{indent}{}\n", arch.insn_name(insn)));
    }
    out.push_str(&format!("{indent}ports: {}\n\n", arch.num_ports()));
    for exp in elist {
        out.push_str("experiment:\n");
        out.push_str(&format!("{indent}instructions:\n"));
        for insn in &exp.iseq {
            out.push_str(&format!("{indent}{indent}{}\n", arch.insn_name(*insn)));
        }
        let cycles = exp
            .cycles()
            .ok_or_else(|| fail(format!("experiment {} carries no cycle count", exp.rid)))?;
        out.push_str(&format!("{indent}cycles: {cycles:?}\n\n"));
    }
    Ok(out)
}

fn singletons_of(elist: &ExperimentList) -> Result<ExperimentList, CliError> {
    let mut res = ExperimentList::new(elist.arch.clone());
    for e in elist {
        if e.iseq.len() == 1 {
            let new = res.create_exp(e.iseq.clone())?;
            new.result = e.result.clone();
            new.other_results = e.other_results.clone();
        }
    }
    Ok(res)
}

/// Invokes the external search on the given experiments.
fn run_search(config: &InferrerConfig, exps: &ExperimentList) -> Result<Mapping, CliError> {
    let singleton_path = Path::new("/tmp/portbench_singletons.exps");
    let journal_path = Path::new("/tmp/portbench_evo_journal.log");

    let singletons = singletons_of(exps)?;
    let mut singleton_file = File::create(singleton_path)?;
    singleton_file.write_all(export_explist(&singletons)?.as_bytes())?;
    drop(singleton_file);

    let mut child = Command::new(&config.bin_path)
        .arg(format!("-c{}", config.config_path.display()))
        .arg("-i")
        .arg("-j")
        .arg("-n1")
        .arg(format!("-x{}", journal_path.display()))
        .arg(format!("-q{}", exps.arch.num_ports()))
        .arg(format!("-e{}", singleton_path.display()))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            fail(format!(
                "could not start the search binary {}: {err}",
                config.bin_path.display()
            ))
        })?;

    let exps_text = export_explist(exps)?;
    child
        .stdin
        .take()
        .expect("stdin was piped")
        .write_all(exps_text.as_bytes())?;
    let output = child.wait_with_output()?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        log::info!("search binary stderr:\n{stderr}");
    }
    if !output.status.success() {
        return Err(fail(format!(
            "search binary exited with {}:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stdout)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(Mapping::from_json_str(&stdout, Some(&exps.arch))?)
}

/// Full inference pipeline: optionally partition and restrict, search,
/// generalize back.
pub fn infer_mapping(config: &InferrerConfig, exps: &ExperimentList) -> Result<Mapping, CliError> {
    if config.inferrer != "pmevo" {
        return Err(fail(format!("unknown inferrer {:?}", config.inferrer)));
    }
    if !config.partitioning {
        return run_search(config, exps);
    }

    let singletons = singletons_of(exps)?;
    let mut pairs = ExperimentList::new(exps.arch.clone());
    for e in exps {
        if e.iseq.len() > 1 {
            let new = pairs.create_exp(e.iseq.clone())?;
            new.result = e.result.clone();
        }
    }

    let tol = Tolerance::Relative(config.equivalence_epsilon);
    let partition = partition_instructions(&pairs, &singletons, tol)?;
    let (reps, insn_to_rep) = compute_representatives(&exps.arch, &partition);

    let restricted = restrict_elist(exps, &reps)?;
    log::info!(
        "restricted input to {} out of {} instructions and {} out of {} experiments",
        reps.len(),
        exps.arch.num_insns(),
        restricted.len(),
        exps.len()
    );

    let mapping = run_search(config, &restricted)?;
    Ok(generalize_mapping(&exps.arch, &mapping, &insn_to_rep)?)
}

pub fn run(args: &InferArgs) -> Result<(), CliError> {
    let mut explist = crate::util::load_elist(&args.exps, None)?;

    if let Some(singleton_path) = &args.singleton_exps {
        let extra = crate::util::load_elist(singleton_path, Some(&explist.arch))?;
        for e in &extra {
            let new = explist.create_exp(e.iseq.clone())?;
            new.result = e.result.clone();
            new.other_results = e.other_results.clone();
        }
    }

    let config_file = File::open(&args.config)
        .map_err(|err| fail(format!("could not open {}: {err}", args.config.display())))?;
    let config: InferrerConfig = serde_json::from_reader(config_file)?;

    let mapping = infer_mapping(&config, &explist)?;

    match &args.out {
        Some(out) => {
            let file = File::create(out)?;
            mapping.to_writer(std::io::BufWriter::new(file))?;
            println!("Written inferred mapping to {}.", out.display());
        }
        None => {
            mapping.to_writer(std::io::stdout().lock())?;
            println!();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use port_mapping::arch::Architecture;
    use port_mapping::experiment::ExpResult;

    #[test]
    fn export_format_matches_the_search_contract() {
        let mut arch = Architecture::new();
        arch.add_insns(["addq", "mulq"]).unwrap();
        arch.add_numbered_ports(3).unwrap();
        let add = arch.insn("addq").unwrap();
        let mul = arch.insn("mulq").unwrap();
        let mut elist = ExperimentList::new(arch);
        elist.create_exp(vec![add]).unwrap().result = Some(ExpResult::ok(1.0));
        elist.create_exp(vec![add, mul]).unwrap().result = Some(ExpResult::ok(2.5));

        let out = export_explist(&elist).unwrap();
        let expected = "architecture:\n    instructions:\n        addq\n        mulq\n    \
                        ports: 3\n\nexperiment:\n    instructions:\n        addq\n    \
                        cycles: 1.0\n\nexperiment:\n    instructions:\n        addq\n        \
                        mulq\n    cycles: 2.5\n\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn singleton_extraction() {
        let mut arch = Architecture::new();
        arch.add_insns(["a", "b"]).unwrap();
        arch.add_numbered_ports(1).unwrap();
        let a = arch.insn("a").unwrap();
        let b = arch.insn("b").unwrap();
        let mut elist = ExperimentList::new(arch);
        elist.create_exp(vec![a]).unwrap().result = Some(ExpResult::ok(1.0));
        elist.create_exp(vec![a, b]).unwrap().result = Some(ExpResult::ok(2.0));
        let singles = singletons_of(&elist).unwrap();
        assert_eq!(singles.len(), 1);
        assert_eq!(singles.exps()[0].iseq, vec![a]);
    }
}
