//! Experiment generation and measurement campaigns.
//!
//! The default recipe measures one singleton experiment per instruction
//! and then pair experiments for every instruction pair, with pair lengths
//! balanced so instructions with equal singleton cost end up in
//! experiments of equal length (which the equivalence partitioner relies
//! on). `--eval` and `--step` instead sample uniformly distributed
//! instruction mixes for evaluation data sets.

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;

use port_mapping::arch::{Architecture, InsnId};
use port_mapping::experiment::{Experiment, ExpResult, ExperimentList};
use port_mapping::partition::{create_partition, singleton_cycles, Tolerance};
use port_mapping::sample::sample_experiments;
use port_mapping::simulator::Processor;
use portbench_rpc::RunOptions;

use crate::cli::GenExperimentsArgs;
use crate::errors::{fail, CliError};
use crate::remote::RemoteProcessor;
use crate::util::{filename_append, write_elist};
use crate::vault::Vault;

/// Shared measurement state for one invocation: the connection, the run
/// options, the optional progress journal and the dropped-run statistics.
struct Campaign<'a> {
    proc: &'a RemoteProcessor,
    opts: RunOptions,
    vault: Option<Vault>,
    verbose: bool,
    next_progress: u64,
    exps_with_dropped_runs: usize,
    dropped_runs: usize,
}

impl Campaign<'_> {
    fn eval_elist(&mut self, elist: &mut ExperimentList) -> Result<(), CliError> {
        let total = elist.len();
        for idx in 0..total {
            let exp = &elist.exps()[idx];
            log::info!(
                "running experiment {} of {} (length {})",
                idx + 1,
                total,
                exp.iseq.len()
            );
            let iseq = self.translate(&elist.arch, &exp.iseq)?;
            let mut result = self.proc.execute_with(&iseq, &self.opts)?;
            if result.cycles.is_none() {
                return Err(fail(format!(
                    "failed to evaluate experiment {}: {}",
                    elist.exps()[idx].rid,
                    result.error_cause.as_deref().unwrap_or("unknown cause"),
                )));
            }
            if !result.invalid_runs.is_empty() {
                self.exps_with_dropped_runs += 1;
                self.dropped_runs += result.invalid_runs.len();
            }
            if let Some(vault) = &mut self.vault {
                let value = experiment_value(&elist.arch, &elist.exps()[idx], &result);
                vault.add(self.next_progress, value)?;
                self.next_progress += 1;
            }
            if !self.verbose {
                result.strip_runs();
            }
            elist.exps_mut()[idx].result = Some(result);
        }
        Ok(())
    }

    /// Experiment lists may carry their own architecture (e.g. loaded from
    /// a file); instruction ids are translated by name onto the server's.
    fn translate(&self, arch: &Architecture, iseq: &[InsnId]) -> Result<Vec<InsnId>, CliError> {
        iseq.iter()
            .map(|insn| {
                let name = arch.insn_name(*insn);
                self.proc
                    .arch()
                    .insn(name)
                    .ok_or_else(|| fail(format!("server does not know instruction {name:?}")))
            })
            .collect()
    }

    fn report_dropped_runs(&self) {
        if self.exps_with_dropped_runs > 0 {
            log::warn!(
                "dropped {} runs for {} experiments because of unstable clock frequency",
                self.dropped_runs,
                self.exps_with_dropped_runs
            );
        }
    }

    fn finalize_vault(&self) -> Result<(), CliError> {
        if let Some(vault) = &self.vault {
            vault.finalize(false)?;
        }
        Ok(())
    }
}

fn experiment_value(
    arch: &Architecture,
    exp: &Experiment,
    result: &ExpResult,
) -> serde_json::Value {
    let iseq: Vec<&str> = exp.iseq.iter().map(|i| arch.insn_name(*i)).collect();
    serde_json::json!({
        "kind": "Experiment",
        "iseq": iseq,
        "result": result,
    })
}

pub fn run(args: &GenExperimentsArgs) -> Result<(), CliError> {
    if args.step.is_some() && args.eval.is_some() {
        return Err(fail("provide at most one of --step and --eval"));
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let proc = RemoteProcessor::connect(&args.client)?;
    let arch = proc.arch().clone();
    let insns = arch.insn_list();
    log::info!(
        "connected: {} instructions, {} ports",
        arch.num_insns(),
        arch.num_ports()
    );

    let vault = args.vault.as_deref().map(Vault::for_outfile).transpose()?;
    let mut campaign = Campaign {
        proc: &proc,
        opts: RunOptions {
            repetitions: Some(args.repetitions),
            target_time_us: Some(args.targettime),
            num_insns_per_iteration: Some(args.insns_per_iteration),
            max_uncertainty: Some(args.epsilon * 0.5),
            num_total_dynamic_insns: None,
        },
        vault,
        verbose: args.verbose,
        next_progress: 0,
        exps_with_dropped_runs: 0,
        dropped_runs: 0,
    };

    if let Some(step) = &args.step {
        let (num, minl, maxl) = (step[0], step[1], step[2]);
        for curr_len in minl..maxl {
            let mut elist = ExperimentList::new(arch.clone());
            for iseq in sample_experiments(&insns, curr_len, curr_len + 1, num, &mut rng) {
                elist.create_exp(iseq)?;
            }
            campaign.eval_elist(&mut elist)?;
            let outname = filename_append(&args.out, &format!("_len_{curr_len:02}"));
            write_elist(&outname, &elist)?;
            println!(
                "Written {} evaluated experiments of length {} to {}.",
                elist.len(),
                curr_len,
                outname.display()
            );
        }
        campaign.report_dropped_runs();
        return campaign.finalize_vault();
    }

    if let Some(eval) = &args.eval {
        let mut elist = match &args.exps {
            Some(exps_path) => crate::util::load_elist(exps_path, None)?,
            None => {
                let (num, minl, maxl) = (eval[0], eval[1], eval[2]);
                log::info!(
                    "sampling {num} evaluation experiments with lengths in [{minl}, {maxl})"
                );
                let mut elist = ExperimentList::new(arch.clone());
                for iseq in sample_experiments(&insns, minl, maxl, num, &mut rng) {
                    elist.create_exp(iseq)?;
                }
                write_elist(&args.out, &elist)?;
                println!(
                    "Written {} sampled evaluation experiments to {}.",
                    elist.len(),
                    args.out.display()
                );
                elist
            }
        };
        campaign.eval_elist(&mut elist)?;
        write_elist(&args.out, &elist)?;
        println!(
            "Written {} evaluated evaluation experiments to {}.",
            elist.len(),
            args.out.display()
        );
        campaign.report_dropped_runs();
        return campaign.finalize_vault();
    }

    // Default recipe: singletons first, then balanced pairs.
    let singleton_file = filename_append(&args.out, "_singletons");
    let pair_file = filename_append(&args.out, "_pair");

    log::info!("generating {} singleton experiments", insns.len());
    let mut singleton_elist = ExperimentList::new(arch.clone());
    for insn in &insns {
        singleton_elist.create_exp(vec![*insn])?;
    }
    write_elist(&singleton_file, &singleton_elist)?;

    campaign.eval_elist(&mut singleton_elist)?;
    write_elist(&singleton_file, &singleton_elist)?;
    println!(
        "Written {} evaluated singleton experiments to {}.",
        singleton_elist.len(),
        singleton_file.display()
    );

    // Bucket instructions whose singleton results are indistinguishable
    // and use the bucket maximum for the pair lengths, so equivalent
    // instructions end up with pair experiments of identical size.
    let singles = singleton_cycles(&singleton_elist)?;
    let tol = Tolerance::Absolute(args.epsilon);
    let buckets = create_partition(&insns, |a, b| tol.eq(singles[&a], singles[&b]));
    let mut max_t: FxHashMap<InsnId, f64> = FxHashMap::default();
    for bucket in &buckets.buckets {
        let bucket_max = bucket
            .iter()
            .map(|i| singles[i])
            .fold(f64::NEG_INFINITY, f64::max);
        for insn in bucket {
            max_t.insert(*insn, bucket_max);
        }
    }

    log::info!("generating pair experiments");
    let mut pair_elist = ExperimentList::new(arch.clone());
    for (a, b) in insns.iter().tuple_combinations() {
        pair_elist.create_exp(vec![*a, *b])?;

        let (slow, fast, t_slow, t_fast) = if max_t[a] >= max_t[b] {
            (*a, *b, max_t[a], max_t[b])
        } else {
            (*b, *a, max_t[b], max_t[a])
        };
        let factor = (t_slow / t_fast).ceil() as usize;
        if factor == 1 {
            continue;
        }
        // The slower instruction fills the faster one's idle time.
        let mut iseq = vec![slow];
        iseq.extend(std::iter::repeat(fast).take(factor));
        pair_elist.create_exp(iseq)?;
    }
    write_elist(&pair_file, &pair_elist)?;
    println!(
        "Written {} pair experiments to {}.",
        pair_elist.len(),
        pair_file.display()
    );

    log::info!("evaluating {} pair experiments", pair_elist.len());
    campaign.eval_elist(&mut pair_elist)?;
    write_elist(&pair_file, &pair_elist)?;
    println!(
        "Written {} evaluated pair experiments to {}.",
        pair_elist.len(),
        pair_file.display()
    );

    campaign.report_dropped_runs();
    campaign.finalize_vault()
}
