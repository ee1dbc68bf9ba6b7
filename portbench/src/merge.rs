//! Merging the annotated results of experiment lists that contain the same
//! experiments (e.g. the same list evaluated with different tools).

use crate::cli::MergeArgs;
use crate::errors::CliError;
use crate::util::{load_elist, write_elist};

pub fn run(args: &MergeArgs) -> Result<(), CliError> {
    let mut elist = load_elist(&args.exps[0], None)?;

    for path in &args.exps[1..] {
        let other = load_elist(path, Some(&elist.arch))?;
        let adopted = elist.merge_other_results(&other)?;
        log::info!(
            "adopted {} result entries from {}",
            adopted,
            path.display()
        );
    }

    write_elist(&args.out, &elist)?;
    println!(
        "Written merged experiment list to {}.",
        args.out.display()
    );
    Ok(())
}
