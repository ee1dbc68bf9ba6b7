//! Incremental progress storage for long measurement campaigns.
//!
//! Every completed measurement is appended to a progress file as one
//! `[progress_id, data]` JSON line, so a crashed campaign loses at most
//! the experiment it was working on. `finalize` (or the `recover`
//! subcommand) turns the journal into the proper JSON array output.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{fail, CliError};

pub struct Vault {
    progress_path: PathBuf,
    out_path: PathBuf,
    entries: Vec<(u64, Value)>,
}

impl Vault {
    /// Opens (or starts) the progress journal for the given output file.
    pub fn for_outfile(out: &Path) -> Result<Self, CliError> {
        let progress_path = PathBuf::from(format!("{}.progress", out.display()));
        Self::open(progress_path, out.to_owned())
    }

    /// Opens an existing progress journal, deriving the output name from
    /// it.
    pub fn from_progress_file(progress: &Path) -> Result<Self, CliError> {
        let s = progress.display().to_string();
        let out_path = match s.strip_suffix(".progress") {
            Some(stem) if stem.ends_with(".json") => PathBuf::from(stem),
            _ => PathBuf::from(format!("{s}.final.json")),
        };
        Self::open(progress.to_owned(), out_path)
    }

    fn open(progress_path: PathBuf, out_path: PathBuf) -> Result<Self, CliError> {
        let mut entries = Vec::new();
        if progress_path.is_file() {
            log::info!("found progress file {}", progress_path.display());
            let reader = BufReader::new(File::open(&progress_path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: (u64, Value) = serde_json::from_str(&line).map_err(|err| {
                    fail(format!(
                        "failed to load progress from {} (line {}): {err}\n  \
                         Fix or remove the file to continue.",
                        progress_path.display(),
                        lineno + 1
                    ))
                })?;
                entries.push(entry);
            }
        }
        Ok(Vault {
            progress_path,
            out_path,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The id of the most recently journaled entry, if any.
    pub fn last_progress(&self) -> Option<u64> {
        self.entries.last().map(|(id, _)| *id)
    }

    pub fn add(&mut self, progress_id: u64, data: Value) -> Result<(), CliError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.progress_path)?;
        let line = serde_json::to_string(&(progress_id, &data))?;
        writeln!(file, "{line}")?;
        self.entries.push((progress_id, data));
        Ok(())
    }

    /// Writes the accumulated data as a JSON array to the output file.
    pub fn finalize(&self, delete_progress: bool) -> Result<&Path, CliError> {
        let values: Vec<&Value> = self.entries.iter().map(|(_, v)| v).collect();
        let file = File::create(&self.out_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &values)?;
        writeln!(writer)?;
        writer.flush()?;
        if delete_progress && self.progress_path.is_file() {
            std::fs::remove_file(&self.progress_path)?;
        }
        Ok(&self.out_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("exps.json");
        let mut vault = Vault::for_outfile(&out).unwrap();
        assert!(vault.is_empty());
        vault.add(0, serde_json::json!({"cycles": 1.0})).unwrap();
        vault.add(1, serde_json::json!({"cycles": 2.0})).unwrap();

        let vault = Vault::for_outfile(&out).unwrap();
        assert_eq!(vault.len(), 2);
        assert_eq!(vault.last_progress(), Some(1));

        let written = vault.finalize(true).unwrap();
        let content = std::fs::read_to_string(written).unwrap();
        let values: Vec<Value> = serde_json::from_str(&content).unwrap();
        assert_eq!(values.len(), 2);
        assert!(!dir.path().join("exps.json.progress").exists());
    }

    #[test]
    fn output_name_derivation() {
        let vault = Vault::from_progress_file(Path::new("/tmp/a.json.progress")).unwrap();
        assert_eq!(vault.out_path, PathBuf::from("/tmp/a.json"));
        let vault = Vault::from_progress_file(Path::new("/tmp/b.log")).unwrap();
        assert_eq!(vault.out_path, PathBuf::from("/tmp/b.log.final.json"));
    }

    #[test]
    fn corrupt_progress_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("x.json.progress");
        std::fs::write(&progress, "not json\n").unwrap();
        assert!(Vault::from_progress_file(&progress).is_err());
    }
}
