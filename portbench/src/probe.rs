//! Smoke-testing a measurement server: run every short experiment (up to a
//! length and count limit) and report what failed.

use itertools::Itertools;
use regex::Regex;

use port_mapping::experiment::ExperimentList;
use port_mapping::simulator::Processor;
use portbench_rpc::RunOptions;

use crate::cli::ProbeArgs;
use crate::errors::{fail, CliError};
use crate::remote::RemoteProcessor;

pub fn run(args: &ProbeArgs) -> Result<(), CliError> {
    let proc = RemoteProcessor::connect(&args.client)?;
    let arch = proc.arch().clone();
    println!(
        "Remote processor supports {} instructions and has {} ports.",
        arch.num_insns(),
        arch.num_ports()
    );

    let name_re = match &args.regex {
        Some(re) => Some(Regex::new(re).map_err(|err| fail(format!("bad regex: {err}")))?),
        None => None,
    };
    let insns: Vec<_> = arch
        .insn_list()
        .into_iter()
        .filter(|insn| {
            let name = arch.insn_name(*insn);
            args.filter.as_ref().is_none_or(|f| name.contains(f.as_str()))
                && name_re.as_ref().is_none_or(|re| re.is_match(name))
        })
        .collect();

    let opts = RunOptions {
        repetitions: Some(args.repetitions),
        target_time_us: Some(500000.0),
        num_insns_per_iteration: Some(10),
        ..Default::default()
    };

    let mut elist = ExperimentList::new(arch.clone());
    for length in 1..=args.length {
        println!("Running experiments of length {length}...");
        for (count, iseq) in insns
            .iter()
            .copied()
            .combinations_with_replacement(length)
            .enumerate()
        {
            if args.num > 0 && count as i64 >= args.num {
                break;
            }
            let result = proc.execute_with(&iseq, &opts)?;
            let names: Vec<&str> = iseq.iter().map(|i| arch.insn_name(*i)).collect();
            println!("  {:?}: {:?}", names, result.cycles);
            let exp = elist.create_exp(iseq.to_vec())?;
            exp.result = Some(result);
        }
    }

    let failing: Vec<_> = elist.iter().filter(|e| e.cycles().is_none()).collect();
    if !failing.is_empty() {
        println!("Some experiments failed:");
        for e in &failing {
            let names: Vec<&str> = e.iseq.iter().map(|i| arch.insn_name(*i)).collect();
            let cause = e
                .result
                .as_ref()
                .and_then(|r| r.error_cause.as_deref())
                .unwrap_or("unknown cause");
            println!("  {names:?}: {cause}");
        }
        return Err(fail(format!("{} experiments failed", failing.len())));
    }
    Ok(())
}
