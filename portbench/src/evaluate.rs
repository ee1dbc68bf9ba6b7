//! Annotating experiment lists with predictions or re-measurements under a
//! unique identifier. Existing entries are never overwritten; evaluating
//! with an identifier that is already present is a hard error.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use port_mapping::experiment::TaggedResult;
use port_mapping::mapping::Mapping;
use port_mapping::simulator::{Processor, SimProcessor};

use crate::cli::EvaluateArgs;
use crate::errors::{fail, CliError};
use crate::remote::RemoteProcessor;
use crate::util::{load_elist, write_elist};

/// `results.json` -> `results_eval01.json` -> `results_eval02.json` ...
fn next_eval_name(input: &Path) -> PathBuf {
    static EVAL_RE: OnceLock<Regex> = OnceLock::new();
    let re = EVAL_RE.get_or_init(|| Regex::new(r"_eval(\d+)$").expect("valid regex"));

    let s = input.to_string_lossy();
    let stem = s.strip_suffix(".json").unwrap_or(&s);
    match re.captures(stem) {
        Some(caps) => {
            let num: u32 = caps[1].parse().unwrap_or(0);
            let base = &stem[..stem.len() - caps[0].len()];
            PathBuf::from(format!("{base}_eval{:02}.json", num + 1))
        }
        None => PathBuf::from(format!("{stem}_eval01.json")),
    }
}

pub fn run(args: &EvaluateArgs) -> Result<(), CliError> {
    let mut processor: Box<dyn Processor> = match &args.mapping {
        Some(mapping_path) => {
            let file = std::fs::File::open(mapping_path).map_err(|err| {
                fail(format!("could not open {}: {err}", mapping_path.display()))
            })?;
            let mapping = Mapping::from_reader(std::io::BufReader::new(file), None)?;
            Box::new(SimProcessor::new(mapping))
        }
        None => Box::new(RemoteProcessor::connect(&args.client)?),
    };
    let arch = processor.arch().clone();
    log::info!("evaluating with a {}", processor.description());

    for exps_path in &args.exps {
        let mut elist = load_elist(exps_path, Some(&arch))?;
        if elist.has_identifier(&args.identifier) {
            return Err(fail(format!(
                "the experiment list in {} already contains measurements tagged {:?}",
                exps_path.display(),
                args.identifier
            )));
        }

        log::info!(
            "evaluating {} experiments from {}",
            elist.len(),
            exps_path.display()
        );
        for idx in 0..elist.len() {
            // The list's ids may differ from the processor's; go by name.
            let iseq: Vec<_> = elist.exps()[idx]
                .iseq
                .iter()
                .map(|insn| {
                    let name = elist.arch.insn_name(*insn);
                    arch.insn(name)
                        .ok_or_else(|| fail(format!("unknown instruction {name:?}")))
                })
                .collect::<Result<_, _>>()?;
            let result = processor.execute(&iseq);
            elist.exps_mut()[idx].other_results.push(TaggedResult {
                id: args.identifier.clone(),
                result,
            });
        }

        let outname = match &args.out {
            Some(out) => out.clone(),
            None => next_eval_name(exps_path),
        };
        write_elist(&outname, &elist)?;
        println!(
            "Written {} evaluated experiments to {}.",
            elist.len(),
            outname.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_names_increment() {
        assert_eq!(
            next_eval_name(Path::new("r.json")),
            PathBuf::from("r_eval01.json")
        );
        assert_eq!(
            next_eval_name(Path::new("r_eval01.json")),
            PathBuf::from("r_eval02.json")
        );
        assert_eq!(
            next_eval_name(Path::new("r_eval09.json")),
            PathBuf::from("r_eval10.json")
        );
        assert_eq!(
            next_eval_name(Path::new("dir/r_eval2")),
            PathBuf::from("dir/r_eval03.json")
        );
    }
}
