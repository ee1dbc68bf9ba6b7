//! ISA descriptors.
//!
//! Everything the benchmark driver needs to know about one instruction set
//! lives behind the [`Isa`] trait: the register file, the C program frame,
//! per-register initialization code, how to invoke the produced benchmark
//! (or the simulating tool), and how to parse its output. New ISAs are
//! registered in the compile-time [`ISA_REGISTRY`] table.

mod aarch64;
mod sim;
mod x86_64;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_derive::Deserialize;
use thiserror::Error;

use port_mapping::experiment::MeasureError;

use crate::register_file::RegisterFile;
use crate::settings::Settings;

#[derive(Debug, Error)]
pub enum IsaError {
    #[error("no initialization code for register {0:?}")]
    NoInitCode(String),

    #[error("unsupported ISA {0:?}")]
    UnknownIsa(String),
}

/// A successfully parsed benchmark or tool report. Simulated back-ends
/// only produce a cycle count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMeasurement {
    pub benchtime: Option<f64>,
    pub cycles: f64,
    pub meas_freq: Option<i64>,
}

#[derive(Deserialize)]
struct BinReport {
    benchtime: f64,
    cycles: f64,
    meas_freq: i64,
}

pub trait Isa: Send + Sync {
    fn name(&self) -> &'static str;

    /// Subdirectory of the input dir holding this ISA's `.insn` files.
    fn insn_dir(&self) -> &'static str;

    fn immediate_prefix(&self) -> &'static str {
        ""
    }

    fn as_imm(&self, imm: i64) -> String {
        format!("{}{}", self.immediate_prefix(), imm)
    }

    fn register_file(&self) -> &'static RegisterFile;

    /// The C template with the ISA-specific sections already substituted;
    /// only the per-run holes (`{num_iterations}`, `{loop_body}`, ...)
    /// remain.
    fn program_frame(&self) -> &str;

    fn init_code_for_register(&self, reg: &str) -> Result<String, IsaError>;

    fn additional_cc_flags(&self) -> &'static [&'static str] {
        &[]
    }

    fn is_simulated(&self) -> bool {
        false
    }

    /// Post-compilation fixup of the produced artifact, if the back-end
    /// needs one.
    fn prepare_binary(&self, _bmk_bin: &Path) -> std::io::Result<()> {
        Ok(())
    }

    /// The command that produces the measurement output on stdout.
    fn create_command(&self, settings: &Settings, bmk_bin: &Path) -> Vec<OsString> {
        let mut command: Vec<OsString> = Vec::new();
        if find_in_path("taskset").is_some() {
            command.push("taskset".into());
            command.push("-c".into());
            command.push(settings.core.to_string().into());
        }
        command.push(bmk_bin.as_os_str().to_owned());
        command
    }

    /// Parses the command's stdout into a measurement.
    fn extract_result(
        &self,
        stdout: &str,
        _num_testcase_instances: u64,
    ) -> Result<RawMeasurement, MeasureError> {
        let report: BinReport = serde_json::from_str(stdout)
            .map_err(|e| MeasureError::Other(format!("malformed benchmark report: {e}")))?;
        Ok(RawMeasurement {
            benchtime: Some(report.benchtime),
            cycles: report.cycles,
            meas_freq: Some(report.meas_freq),
        })
    }
}

pub struct IsaEntry {
    pub name: &'static str,
    pub build: fn() -> Box<dyn Isa>,
}

/// All known ISAs. Native ones are selected by the machine's `uname -m`
/// string, simulated ones by their tool-qualified names.
pub static ISA_REGISTRY: &[IsaEntry] = &[
    IsaEntry { name: "x86_64", build: x86_64::build },
    IsaEntry { name: "aarch64", build: aarch64::build },
    IsaEntry { name: "IACAx86_64", build: sim::build_iaca },
    IsaEntry { name: "Ithemalx86_64", build: sim::build_ithemal },
    IsaEntry { name: "LLVMMCA_SKLx86_64", build: sim::build_mca_skylake },
    IsaEntry { name: "LLVMMCA_ZENPx86_64", build: sim::build_mca_znver1 },
    IsaEntry { name: "LLVMMCA_A72_ARM", build: sim::build_mca_a72 },
];

pub fn create_isa(name: &str) -> Option<Box<dyn Isa>> {
    ISA_REGISTRY
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| (entry.build)())
}

/// The ISA name of the machine we are running on.
pub fn native_isa_name() -> std::io::Result<String> {
    let output = Command::new("uname").arg("-m").output()?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Fills `{name}` holes by plain substitution. Hole names are chosen so
/// that nothing else in the templates looks like one.
pub fn fill_template(template: &str, values: &[(&str, String)]) -> String {
    let mut out = template.to_owned();
    for (name, value) in values {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

/// The shared C frame for native execution. The ISA-specific sections
/// (`{INCLUDES}`, `{ASM_INIT}`, `{ASM_INSTRUCTIONS}`, `{WARMUP_CODE}`) are
/// substituted when the descriptor is built; the remaining holes are
/// per-run parameters.
pub const NATIVE_PROGRAM_FRAME: &str = r#"#include <stdio.h>
#include <stdlib.h>
#include <dirent.h>
#include <dlfcn.h>
#include <sys/time.h>
#include <sys/stat.h>
#include <sys/types.h>
#include <string.h>

{INCLUDES}

int main (void) {
    struct timeval start, end;
    double benchtime;
    // allocate and initialize scratch memory for loads and stores
    long long mem_size = 4096 + 32768;
    char * memt = (char*) aligned_alloc(4096, mem_size);
    for (int i = 0; i < mem_size; ++i) {
        memt[i] = 42;
    }
    long long N = {num_iterations};
    double freq = {frequency};
    long long num_instances_per_iteration = {num_instances_per_iteration};

    // initialization code
{ASM_INIT}

    { // Warmup Code
    register void * mem asm("{membasereg}") = memt + 4096;
    register long long div asm("{div_reg}") = 44; // initialize the non-zero divisor register
{WARMUP_CODE}
    }

    FILE* f = fopen("{freq_path}", "r");
    long long meas_freq;
    fscanf(f, "%lld", &meas_freq);
    fclose(f);

    freq = (double)meas_freq;

    gettimeofday(&start, NULL);

    register void * mem asm("{membasereg}") = memt + 4096;
    register long long div asm("{div_reg}") = 44; // initialize the non-zero divisor register

    // ASM loop
{ASM_INSTRUCTIONS}

    gettimeofday(&end, NULL);

    // dump output
    fprintf (stdout, "{\n");
    // This returns the time for the experiment in microseconds (1e(-6)s)
    benchtime = ((double)end.tv_sec - (double)start.tv_sec) * 1000000 + ((double)end.tv_usec - (double)start.tv_usec);
    fprintf(stdout, "  \"benchtime\": %.2f,\n", benchtime);

    // calculate cycles per Testcase: time * e(-6) * freq * e3 / n
    double instruction_throughput = (benchtime * freq) / ((double)N * num_instances_per_iteration * 1000.0);
    fprintf(stdout, "  \"cycles\": %.10f,\n", instruction_throughput);
    fprintf(stdout, "  \"meas_freq\": %lld\n", meas_freq);
    fprintf(stdout, "}\n");
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_native_and_simulated_isas() {
        assert!(create_isa("x86_64").is_some());
        assert!(create_isa("aarch64").is_some());
        assert!(create_isa("IACAx86_64").is_some());
        assert!(create_isa("LLVMMCA_A72_ARM").is_some());
        assert!(create_isa("riscv64").is_none());

        assert!(!create_isa("x86_64").unwrap().is_simulated());
        assert!(create_isa("Ithemalx86_64").unwrap().is_simulated());
    }

    #[test]
    fn template_holes_are_plain_substitution() {
        let out = fill_template(
            "mov r15, {num_iterations} // {missing}",
            &[("num_iterations", "100".to_owned())],
        );
        assert_eq!(out, "mov r15, 100 // {missing}");
    }

    #[test]
    fn default_extract_result_parses_the_report() {
        let isa = create_isa("x86_64").unwrap();
        let raw = isa
            .extract_result(
                "{\n  \"benchtime\": 400000.25,\n  \"cycles\": 1.5,\n  \"meas_freq\": 3000000\n}\n",
                1,
            )
            .unwrap();
        assert_eq!(raw.benchtime, Some(400000.25));
        assert_eq!(raw.cycles, 1.5);
        assert_eq!(raw.meas_freq, Some(3000000));

        assert!(isa.extract_result("garbage", 1).is_err());
    }

    #[test]
    fn immediates_carry_the_prefix() {
        let isa = create_isa("x86_64").unwrap();
        assert_eq!(isa.as_imm(44), "44");
    }
}
