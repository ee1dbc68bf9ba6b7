use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "portbench",
    version,
    about = r#"
portbench drives port-mapping experiments against a measurement server and
infers port mappings from the results.

EXAMPLES:
    # Measure singleton and pair experiments for every instruction:
    portbench gen-experiments --host box1 results.json

    # Infer a port mapping from measured experiments:
    portbench infer pmevo.cfg results_pair.json --singletonexps results_singletons.json -o mapping.json

    # Predict cycle counts for measured experiments from a mapping:
    portbench evaluate -m mapping.json -x sim results.json
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Generate experiments and execute them on a measurement server.
    GenExperiments(GenExperimentsArgs),

    /// Infer a port mapping for a list of experiments.
    Infer(InferArgs),

    /// Evaluate experiment lists with a mapping or a remote server and
    /// annotate the results.
    Evaluate(EvaluateArgs),

    /// Merge the annotated results of experiment lists with identical
    /// experiments.
    Merge(MergeArgs),

    /// Smoke-test a measurement server with small experiments.
    Probe(ProbeArgs),

    /// Finalize an interrupted progress file.
    Recover(RecoverArgs),
}

/// How to reach the measurement server.
#[derive(Debug, Args)]
pub struct ClientArgs {
    /// The remote host to connect to.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// The port of the remote host.
    #[arg(long, default_value_t = 42424)]
    pub port: u16,

    /// Path to a folder containing an SSL key and certificate.
    #[arg(long, default_value = "./ssl")]
    pub sslpath: PathBuf,
}

#[derive(Debug, Args)]
pub struct GenExperimentsArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// Repetitions per experiment; the median of the stable ones wins.
    #[arg(short, long, value_name = "N", default_value_t = 5)]
    pub repetitions: u32,

    /// Target time to run each experiment, in microseconds.
    #[arg(short, long = "targettime", value_name = "T", default_value_t = 10000.0)]
    pub targettime: f64,

    /// Number of instructions per loop iteration.
    #[arg(short = 'n', long = "insnsperiteration", value_name = "N", default_value_t = 100)]
    pub insns_per_iteration: u64,

    /// Path to write the resulting experiment lists to.
    pub out: PathBuf,

    /// Seed for the random number generator.
    #[arg(long, value_name = "S", default_value_t = 424242)]
    pub seed: u64,

    /// File for storing intermediate results.
    #[arg(long, value_name = "FILE")]
    pub vault: Option<PathBuf>,

    /// Generate NUM uniformly sampled evaluation mixes with lengths in
    /// [MIN, MAX).
    #[arg(long, num_args = 3, value_names = ["NUM", "MIN", "MAX"])]
    pub eval: Option<Vec<usize>>,

    /// For each length in [MIN, MAX), generate NUM uniformly sampled
    /// mixes of exactly that length.
    #[arg(long, num_args = 3, value_names = ["NUM", "MIN", "MAX"])]
    pub step: Option<Vec<usize>>,

    /// Evaluate this experiment list instead of sampling new mixes.
    #[arg(long, value_name = "FILE")]
    pub exps: Option<PathBuf>,

    /// Keep the per-repetition run records in the output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Maximal difference of cycle counts to count as equal.
    #[arg(short, long, value_name = "E", default_value_t = 0.1)]
    pub epsilon: f64,
}

#[derive(Debug, Args)]
pub struct InferArgs {
    /// Inferrer config in JSON format.
    #[arg(value_name = "CFG")]
    pub config: PathBuf,

    /// Experiment list to fit.
    #[arg(value_name = "EXPFILE")]
    pub exps: PathBuf,

    /// Additional singleton experiments to append.
    #[arg(long = "singletonexps", value_name = "EXPFILE")]
    pub singleton_exps: Option<PathBuf>,

    /// Path to write the resulting mapping to (default: stdout).
    #[arg(short, long, value_name = "OUTFILE")]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// Evaluate with this mapping instead of a remote server.
    #[arg(short, long, value_name = "FILE")]
    pub mapping: Option<PathBuf>,

    /// Unique identifier under which the results are recorded.
    #[arg(short = 'x', long, value_name = "ID")]
    pub identifier: String,

    /// Name for the resulting experiment list (default: derived from the
    /// input name).
    #[arg(short, long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Input experiment lists in JSON format.
    #[arg(value_name = "FILE", required = true)]
    pub exps: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct MergeArgs {
    /// Name for the resulting experiment list.
    #[arg(short, long, value_name = "FILE")]
    pub out: PathBuf,

    /// Input experiment lists in JSON format.
    #[arg(value_name = "FILE", required = true)]
    pub exps: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    /// Test all experiments of length up to N.
    #[arg(short, long, value_name = "N", default_value_t = 1)]
    pub length: usize,

    /// Execute each experiment N times on the server.
    #[arg(short, long, value_name = "N", default_value_t = 1)]
    pub repetitions: u32,

    /// Only use instructions whose name contains this substring.
    #[arg(short, long, value_name = "STR")]
    pub filter: Option<String>,

    /// Only use instructions whose name matches this regex.
    #[arg(short = 'x', long, value_name = "RE")]
    pub regex: Option<String>,

    /// Execute only the first N experiments per length (-1: all).
    #[arg(short, long, value_name = "N", default_value_t = -1)]
    pub num: i64,
}

#[derive(Debug, Args)]
pub struct RecoverArgs {
    /// The progress file to finalize.
    #[arg(value_name = "INFILE")]
    pub infile: PathBuf,

    /// Delete the progress file after finalization.
    #[arg(short, long)]
    pub delete_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Opt::command().debug_assert();
    }

    #[test]
    fn gen_experiments_defaults() {
        let opt = Opt::parse_from(["portbench", "gen-experiments", "out.json"]);
        let Action::GenExperiments(args) = opt.action else {
            panic!("wrong action");
        };
        assert_eq!(args.client.host, "localhost");
        assert_eq!(args.client.port, 42424);
        assert_eq!(args.repetitions, 5);
        assert_eq!(args.seed, 424242);
        assert_eq!(args.epsilon, 0.1);
        assert_eq!(args.out, PathBuf::from("out.json"));
    }

    #[test]
    fn eval_takes_three_values() {
        let opt = Opt::parse_from([
            "portbench",
            "gen-experiments",
            "--eval",
            "100",
            "4",
            "9",
            "out.json",
        ]);
        let Action::GenExperiments(args) = opt.action else {
            panic!("wrong action");
        };
        assert_eq!(args.eval, Some(vec![100, 4, 9]));
    }

    #[test]
    fn evaluate_requires_identifier_and_inputs() {
        assert!(Opt::try_parse_from(["portbench", "evaluate", "-x", "sim"]).is_err());
        let opt =
            Opt::parse_from(["portbench", "evaluate", "-x", "sim", "-m", "map.json", "e.json"]);
        let Action::Evaluate(args) = opt.action else {
            panic!("wrong action");
        };
        assert_eq!(args.identifier, "sim");
        assert_eq!(args.exps.len(), 1);
    }
}
