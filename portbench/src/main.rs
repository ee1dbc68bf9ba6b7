mod cli;
mod errors;
mod evaluate;
mod gen_experiments;
mod infer;
mod merge;
mod probe;
mod remote;
mod util;
mod vault;

use clap::Parser;

use cli::{Action, Opt, RecoverArgs};
use errors::CliError;
use vault::Vault;

fn main() {
    env_logger::init();

    let opt = Opt::parse();
    let result = match &opt.action {
        Action::GenExperiments(args) => gen_experiments::run(args),
        Action::Infer(args) => infer::run(args),
        Action::Evaluate(args) => evaluate::run(args),
        Action::Merge(args) => merge::run(args),
        Action::Probe(args) => probe::run(args),
        Action::Recover(args) => recover(args),
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn recover(args: &RecoverArgs) -> Result<(), CliError> {
    let vault = Vault::from_progress_file(&args.infile)?;
    let num = vault.len();
    let written = vault.finalize(args.delete_progress)?;
    println!(
        "Written finalized result with {} entries into {}.",
        num,
        written.display()
    );
    Ok(())
}
