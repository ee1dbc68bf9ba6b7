use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use port_mapping::arch::Architecture;
use port_mapping::experiment::ExperimentList;

use crate::errors::CliError;

/// `results.json` + `_pair` -> `results_pair.json`.
pub fn filename_append(path: &Path, suffix: &str) -> PathBuf {
    let s = path.to_string_lossy();
    let stem = s.strip_suffix(".json").unwrap_or(&s);
    PathBuf::from(format!("{stem}{suffix}.json"))
}

pub fn load_elist(path: &Path, arch: Option<&Architecture>) -> Result<ExperimentList, CliError> {
    let file = File::open(path)
        .map_err(|err| crate::errors::fail(format!("could not open {}: {err}", path.display())))?;
    Ok(ExperimentList::from_reader(BufReader::new(file), arch)?)
}

pub fn write_elist(path: &Path, elist: &ExperimentList) -> Result<(), CliError> {
    let file = File::create(path)
        .map_err(|err| crate::errors::fail(format!("could not create {}: {err}", path.display())))?;
    elist.to_writer(BufWriter::new(file))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_suffixes() {
        assert_eq!(
            filename_append(Path::new("out.json"), "_pair"),
            PathBuf::from("out_pair.json")
        );
        assert_eq!(
            filename_append(Path::new("out"), "_singletons"),
            PathBuf::from("out_singletons.json")
        );
        assert_eq!(
            filename_append(Path::new("out.json"), "_len_03"),
            PathBuf::from("out_len_03.json")
        );
    }
}
