//! The benchmark driver: renders, compiles and executes one measurement at
//! a time, validates frequency stability across repetitions, and reports
//! the median of the valid runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;

use thiserror::Error;

use port_mapping::experiment::{ExpResult, MeasureError, RunRecord};
use portbench_rpc::proto::RunOptions;

use crate::alloc::{AllocError, Allocator};
use crate::insn_form::{FormError, InsnForm, InsnInstance};
use crate::isa::{fill_template, Isa, IsaError};
use crate::machine_params::MachineParams;
use crate::settings::Settings;

/// Structural failures: bad requests or a broken environment. These are
/// reported as RPC errors, unlike per-measurement failures which travel
/// inside the result dictionary.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unknown instruction {0:?}")]
    UnknownInsn(String),

    #[error("experiments must contain at least one instruction")]
    EmptySequence,

    #[error("cannot set target_time_us and num_total_dynamic_insns together")]
    ConflictingOptions,

    #[error("iteration count {0} exceeds the 32-bit loop counter")]
    TooManyIterations(u64),

    #[error("register file lacks a 64-bit {0} register")]
    MissingReservedRegister(&'static str),

    #[error("parameter probe failed: {0}")]
    ProbeFailed(MeasureError),

    #[error(transparent)]
    Form(#[from] FormError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Isa(#[from] IsaError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single run either yields a record, fails recoverably (propagated into
/// the result dictionary) or fails structurally.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Measure(MeasureError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Loads every `.insn` file below `dir`, one instruction template per
/// line. The template text doubles as the instruction identifier.
pub fn load_insn_files(dir: &Path) -> Result<BTreeMap<String, InsnForm>, DriverError> {
    fn walk(dir: &Path, forms: &mut BTreeMap<String, InsnForm>) -> Result<(), DriverError> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, forms)?;
            } else if path.extension().is_some_and(|ext| ext == "insn") {
                for line in fs::read_to_string(&path)?.lines() {
                    if line.is_empty() {
                        continue;
                    }
                    forms.insert(line.to_owned(), InsnForm::parse(line)?);
                }
            }
        }
        Ok(())
    }
    let mut forms = BTreeMap::new();
    walk(dir, &mut forms)?;
    Ok(forms)
}

fn read_frequency(settings: &Settings) -> std::io::Result<f64> {
    if settings.no_root {
        return Ok(-1.0);
    }
    let content = fs::read_to_string(settings.scaling_cur_freq())?;
    content
        .lines()
        .next()
        .and_then(|line| line.trim().parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty cpufreq file"))
}

/// Lower median: the `(n-1)/2`-th element of the sorted values.
fn median_low(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("cycle counts are not NaN"));
    sorted[(sorted.len() - 1) / 2]
}

/// Renders and executes one measurement loop.
pub fn run_once(
    settings: &Settings,
    isa: &dyn Isa,
    forms: &BTreeMap<String, InsnForm>,
    iseq: &[String],
    num_insns_per_iteration: u64,
    num_total_dynamic_insns: u64,
) -> Result<RunRecord, RunError> {
    let testcase: Vec<&InsnForm> = iseq
        .iter()
        .map(|name| {
            forms
                .get(name)
                .ok_or_else(|| DriverError::UnknownInsn(name.clone()))
        })
        .collect::<Result<_, _>>()?;
    if testcase.is_empty() {
        return Err(DriverError::EmptySequence.into());
    }

    let frequency = read_frequency(settings).map_err(DriverError::Io)?;

    log::info!(
        "running experiment of length {} at {} kHz: {} total dynamic instructions, {} per iteration",
        testcase.len(),
        frequency,
        num_total_dynamic_insns,
        num_insns_per_iteration
    );

    let (program, num_testcase_instances, num_iterations) = render_program(
        settings,
        isa,
        &testcase,
        frequency,
        num_insns_per_iteration,
        num_total_dynamic_insns,
    )?;

    let bmk_src = settings.benchmark_src();
    let bmk_bin = settings.benchmark_bin();
    fs::write(&bmk_src, program).map_err(DriverError::Io)?;

    let mut compile = Command::new(&settings.cc);
    compile
        .arg(&bmk_src)
        .arg("-fomit-frame-pointer")
        .arg("-o")
        .arg(&bmk_bin);
    for flag in isa.additional_cc_flags() {
        compile.arg(flag);
    }
    let compiled = compile.output().map_err(DriverError::Io)?;
    if !compiled.status.success() {
        log::error!(
            "compilation failed:\n{}",
            String::from_utf8_lossy(&compiled.stderr)
        );
        return Err(RunError::Measure(MeasureError::CompileFailed));
    }

    isa.prepare_binary(&bmk_bin).map_err(DriverError::Io)?;

    let command = isa.create_command(settings, &bmk_bin);
    let executed = Command::new(&command[0])
        .args(&command[1..])
        .output()
        .map_err(DriverError::Io)?;
    if !executed.status.success() {
        log::error!(
            "execution failed:\n{}",
            String::from_utf8_lossy(&executed.stderr)
        );
        return Err(RunError::Measure(MeasureError::ExecFailed));
    }

    let stdout = String::from_utf8_lossy(&executed.stdout);
    let raw = isa
        .extract_result(&stdout, num_testcase_instances)
        .map_err(RunError::Measure)?;

    if isa.is_simulated() {
        return Ok(RunRecord {
            benchtime: raw.benchtime.unwrap_or(0.0),
            cycles: raw.cycles,
            meas_freq: raw.meas_freq.unwrap_or(0),
            freq_before: 0.0,
            freq_after: 0.0,
            tp_before: 0.0,
            tp_after: 0.0,
            tp_uncertainty: 0.0,
        });
    }

    let frequency_after = read_frequency(settings).map_err(DriverError::Io)?;
    log::debug!(
        "frequency after experiment: {} (difference {})",
        frequency_after,
        (frequency_after - frequency).abs()
    );

    let benchtime = raw.benchtime.unwrap_or(0.0);
    let record = gated_record(
        benchtime,
        raw.cycles,
        raw.meas_freq.unwrap_or(0),
        frequency,
        frequency_after,
        num_iterations,
        num_testcase_instances,
    );
    log::debug!(
        "throughput before/after: {} / {} (uncertainty {:.2}%)",
        record.tp_before,
        record.tp_after,
        record.tp_uncertainty * 100.0
    );
    Ok(record)
}

/// Recomputes the throughput under the before- and after-frequencies and
/// derives the relative mismatch used as the stability gate.
fn gated_record(
    benchtime: f64,
    cycles: f64,
    meas_freq: i64,
    freq_before: f64,
    freq_after: f64,
    num_iterations: u64,
    num_testcase_instances: u64,
) -> RunRecord {
    let denom = (num_iterations * num_testcase_instances) as f64 * 1000.0;
    let tp_before = benchtime * freq_before / denom;
    let tp_after = benchtime * freq_after / denom;
    let tp_uncertainty = if tp_before + tp_after == 0.0 {
        f64::INFINITY
    } else {
        2.0 * (tp_before - tp_after).abs() / (tp_before + tp_after)
    };
    RunRecord {
        benchtime,
        cycles,
        meas_freq,
        freq_before,
        freq_after,
        tp_before,
        tp_after,
        tp_uncertainty,
    }
}

fn build_loop<'a>(
    isa: &dyn Isa,
    testcase: &[&'a InsnForm],
    num_insns_per_iteration: u64,
) -> Result<(Vec<InsnInstance<'a>>, u64), RunError> {
    let len = testcase.len() as u64;
    let num_testcase_instances = num_insns_per_iteration.div_ceil(len);
    let mut instances = Vec::with_capacity((num_testcase_instances * len) as usize);
    for _ in 0..num_testcase_instances {
        for form in testcase {
            instances.push(form.instantiate());
        }
    }
    Allocator::new(isa)
        .allocate(&mut instances)
        .map_err(DriverError::Alloc)?;
    Ok((instances, num_testcase_instances))
}

fn render_program(
    settings: &Settings,
    isa: &dyn Isa,
    testcase: &[&InsnForm],
    frequency: f64,
    num_insns_per_iteration: u64,
    num_total_dynamic_insns: u64,
) -> Result<(String, u64, u64), RunError> {
    let (instances, num_testcase_instances) =
        build_loop(isa, testcase, num_insns_per_iteration)?;

    let actual_insns_per_iteration = instances.len() as u64;
    let num_iterations = num_total_dynamic_insns / actual_insns_per_iteration;
    if num_iterations >= 1 << 32 {
        return Err(DriverError::TooManyIterations(num_iterations).into());
    }

    let loop_body = instances
        .iter()
        .map(|inst| inst.code_line())
        .collect::<Result<Vec<_>, _>>()
        .map_err(DriverError::Form)?
        .join("\n");

    let regfile = isa.register_file();
    let mut used_regs = String::new();
    let mut init_code = String::new();
    for reg in regfile.clobber_list() {
        used_regs.push_str(&format!(", \"{reg}\""));
        init_code.push_str(&isa.init_code_for_register(reg).map_err(DriverError::Isa)?);
    }

    let membasereg = regfile
        .memory_base("64")
        .ok_or(DriverError::MissingReservedRegister("memory base"))?;
    let div_reg = regfile
        .div_register("64")
        .ok_or(DriverError::MissingReservedRegister("divisor"))?;

    let lower16 = num_iterations & 0xFFFF;
    let upper16 = (num_iterations >> 16) & 0xFFFF;

    let program = fill_template(
        isa.program_frame(),
        &[
            ("num_iterations", num_iterations.to_string()),
            ("frequency", frequency.to_string()),
            (
                "num_instances_per_iteration",
                num_testcase_instances.to_string(),
            ),
            ("loop_body", loop_body),
            ("init_code", init_code),
            ("lower16bit", lower16.to_string()),
            ("upper16bit", upper16.to_string()),
            ("used_regs", used_regs),
            ("membasereg", membasereg.to_owned()),
            ("div_reg", div_reg.to_owned()),
            (
                "freq_path",
                settings.scaling_cur_freq().display().to_string(),
            ),
        ],
    );
    Ok((program, num_testcase_instances, num_iterations))
}

/// The long-lived measurement driver behind the RPC service.
pub struct Driver {
    settings: Settings,
    isa: Box<dyn Isa>,
    forms: BTreeMap<String, InsnForm>,
    num_ports: u32,
    params: MachineParams,
}

impl Driver {
    pub fn new(
        settings: Settings,
        isa: Box<dyn Isa>,
        forms: BTreeMap<String, InsnForm>,
        num_ports: u32,
        params: MachineParams,
    ) -> Self {
        Driver {
            settings,
            isa,
            forms,
            num_ports,
            params,
        }
    }

    pub fn insns(&self) -> Vec<String> {
        self.forms.keys().cloned().collect()
    }

    pub fn num_ports(&self) -> u32 {
        self.num_ports
    }

    pub fn description(&self) -> String {
        format!("portbench ({}) processor", self.isa.name())
    }

    fn check_insns(&self, iseq: &[String]) -> Result<(), DriverError> {
        if iseq.is_empty() {
            return Err(DriverError::EmptySequence);
        }
        for name in iseq {
            if !self.forms.contains_key(name) {
                return Err(DriverError::UnknownInsn(name.clone()));
            }
        }
        Ok(())
    }

    /// Resolves the loop parameters for one experiment: explicit overrides
    /// win, a target time triggers a short probe run to scale the dynamic
    /// instruction count, and everything else falls back to the machine
    /// calibration.
    fn resolve_run_parameters(
        &self,
        iseq: &[String],
        opts: &RunOptions,
    ) -> Result<(u64, u64), RunError> {
        let num_insns_per_iteration = opts
            .num_insns_per_iteration
            .unwrap_or(self.params.num_insns_per_iteration);
        if self.isa.is_simulated() {
            let ntdi = opts
                .num_total_dynamic_insns
                .unwrap_or(self.params.num_total_dynamic_insns);
            return Ok((num_insns_per_iteration, ntdi));
        }

        let mut num_total_dynamic_insns = opts.num_total_dynamic_insns;
        if let Some(target_time_us) = opts.target_time_us {
            if num_total_dynamic_insns.is_some() {
                return Err(DriverError::ConflictingOptions.into());
            }
            let test_num_dyn = self.params.num_total_dynamic_insns / 20;
            let probe = run_once(
                &self.settings,
                self.isa.as_ref(),
                &self.forms,
                iseq,
                num_insns_per_iteration,
                test_num_dyn,
            )?;
            let scaled = (test_num_dyn as f64 * target_time_us) / probe.benchtime;
            num_total_dynamic_insns = Some(scaled.round() as u64);
        }

        Ok((
            num_insns_per_iteration,
            num_total_dynamic_insns.unwrap_or(self.params.num_total_dynamic_insns),
        ))
    }

    /// Runs one experiment with repetitions and the frequency-stability
    /// gate. Recoverable failures come back inside the result.
    pub fn run_experiment(
        &self,
        iseq: &[String],
        opts: &RunOptions,
    ) -> Result<ExpResult, DriverError> {
        self.check_insns(iseq)?;
        let (nipi, ntdi) = match self.resolve_run_parameters(iseq, opts) {
            Ok(params) => params,
            Err(RunError::Measure(err)) => return Ok(ExpResult::failed(err)),
            Err(RunError::Driver(err)) => return Err(err),
        };
        let repetitions = opts
            .repetitions
            .unwrap_or(self.settings.default_num_repetitions);
        let max_uncertainty = opts
            .max_uncertainty
            .unwrap_or(self.settings.default_max_uncertainty);

        let mut runs = Vec::with_capacity(repetitions as usize);
        for _ in 0..repetitions {
            match run_once(
                &self.settings,
                self.isa.as_ref(),
                &self.forms,
                iseq,
                nipi,
                ntdi,
            ) {
                Ok(record) => runs.push(record),
                Err(RunError::Measure(err)) => return Ok(ExpResult::failed(err)),
                Err(RunError::Driver(err)) => return Err(err),
            }
        }

        Ok(aggregate_runs(runs, repetitions, max_uncertainty))
    }

    /// Renders the allocated loop body without running it.
    pub fn gen_code(
        &self,
        iseq: &[String],
        opts: &RunOptions,
    ) -> Result<(String, u64), DriverError> {
        self.check_insns(iseq)?;
        let (nipi, _) = match self.resolve_run_parameters(iseq, opts) {
            Ok(params) => params,
            Err(RunError::Measure(err)) => return Err(DriverError::ProbeFailed(err)),
            Err(RunError::Driver(err)) => return Err(err),
        };
        let testcase: Vec<&InsnForm> = iseq
            .iter()
            .map(|name| self.forms.get(name).expect("checked above"))
            .collect();
        let (instances, num_testcase_instances) =
            build_loop(self.isa.as_ref(), &testcase, nipi).map_err(|err| match err {
                RunError::Driver(e) => e,
                RunError::Measure(e) => DriverError::ProbeFailed(e),
            })?;
        let code = instances
            .iter()
            .map(|inst| inst.render())
            .collect::<Result<Vec<_>, _>>()?
            .join("\n");
        Ok((code, num_testcase_instances))
    }
}

/// Applies the uncertainty gate: strictly more than half of the runs must
/// be stable, and the reported cycle count is the (lower) median of the
/// stable ones.
fn aggregate_runs(runs: Vec<RunRecord>, repetitions: u32, max_uncertainty: f64) -> ExpResult {
    let (valid, invalid): (Vec<RunRecord>, Vec<RunRecord>) = runs
        .into_iter()
        .partition(|r| r.tp_uncertainty < max_uncertainty);

    let mut res = ExpResult::default();
    if valid.len() <= (repetitions / 2) as usize {
        res.error_cause = Some(MeasureError::Unstable.to_string());
    } else {
        res.cycles = Some(median_low(valid.iter().map(|r| r.cycles)));
    }
    res.valid_runs = valid;
    res.invalid_runs = invalid;
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cycles: f64, tp_uncertainty: f64) -> RunRecord {
        RunRecord {
            benchtime: 1.0,
            cycles,
            meas_freq: 3_000_000,
            freq_before: 3_000_000.0,
            freq_after: 3_000_000.0,
            tp_before: 3000.0,
            tp_after: 3000.0,
            tp_uncertainty,
        }
    }

    #[test]
    fn uncertainty_formula() {
        let rec = gated_record(1.0, 3000.0, 3_000_000, 3_000_000.0, 3_030_000.0, 1, 1);
        assert_eq!(rec.tp_before, 3000.0);
        assert_eq!(rec.tp_after, 3030.0);
        assert!((rec.tp_uncertainty - 0.00995).abs() < 1e-5);
        // valid at a loose gate, invalid at a tight one
        assert!(rec.tp_uncertainty < 0.025);
        assert!(rec.tp_uncertainty >= 0.005);
    }

    #[test]
    fn degenerate_throughputs_are_invalid() {
        let rec = gated_record(0.0, 0.0, 0, 0.0, 0.0, 1, 1);
        assert!(rec.tp_uncertainty.is_infinite());
        let res = aggregate_runs(vec![rec; 5], 5, 0.05);
        assert_eq!(res.cycles, None);
        assert_eq!(
            res.error_cause.as_deref(),
            Some("frequency too unreliable for measurements, try more repetitions")
        );
        assert_eq!(res.invalid_runs.len(), 5);
    }

    #[test]
    fn median_of_valid_runs() {
        let runs = vec![
            record(1.0, 0.01),
            record(1.1, 0.01),
            record(99.0, 0.09),
            record(1.2, 0.01),
            record(1.3, 0.01),
        ];
        let res = aggregate_runs(runs, 5, 0.05);
        assert_eq!(res.cycles, Some(1.1));
        assert_eq!(res.valid_runs.len(), 4);
        assert_eq!(res.invalid_runs.len(), 1);
        assert_eq!(res.invalid_runs[0].cycles, 99.0);
    }

    #[test]
    fn more_than_half_must_be_valid() {
        let runs = vec![
            record(1.0, 0.01),
            record(1.1, 0.01),
            record(2.0, 0.09),
            record(2.1, 0.09),
            record(2.2, 0.09),
        ];
        let res = aggregate_runs(runs, 5, 0.05);
        assert_eq!(res.cycles, None);
        let runs = vec![
            record(1.0, 0.01),
            record(1.1, 0.01),
            record(1.2, 0.01),
            record(2.1, 0.09),
            record(2.2, 0.09),
        ];
        let res = aggregate_runs(runs, 5, 0.05);
        assert_eq!(res.cycles, Some(1.1));
    }

    #[test]
    fn gate_is_strict() {
        // tp_uncertainty exactly at the limit counts as invalid.
        let runs = vec![record(1.0, 0.05); 5];
        let res = aggregate_runs(runs, 5, 0.05);
        assert_eq!(res.cycles, None);
    }

    #[test]
    fn insn_files_are_loaded_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("x86_64");
        fs::create_dir(&sub).unwrap();
        fs::write(
            sub.join("base.insn"),
            "add ((REG:W:G:64)), ((REG:R:G:64))\nnop\n",
        )
        .unwrap();
        fs::write(sub.join("notes.txt"), "ignored").unwrap();
        let forms = load_insn_files(dir.path()).unwrap();
        assert_eq!(forms.len(), 2);
        assert!(forms.contains_key("nop"));
        assert!(forms.contains_key("add ((REG:W:G:64)), ((REG:R:G:64))"));
    }

    #[test]
    fn bad_insn_files_are_structural_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.insn"), "add ((WAT:64))\n").unwrap();
        assert!(matches!(
            load_insn_files(dir.path()),
            Err(DriverError::Form(_))
        ));
    }

    #[test]
    fn rendered_program_has_no_holes_left() {
        let mut settings = Settings::new(5, 42424, "./input".into());
        settings.no_root = true;
        let isa = crate::isa::create_isa("x86_64").unwrap();
        let form = InsnForm::parse("add ((REG:W:G:64)), ((REG:R:G:64)), ((IMM:8))").unwrap();
        let testcase = vec![&form];
        let (program, instances, iterations) =
            render_program(&settings, isa.as_ref(), &testcase, -1.0, 100, 1_000_000).unwrap();
        assert_eq!(instances, 100);
        assert_eq!(iterations, 10_000);
        for hole in [
            "{num_iterations}",
            "{frequency}",
            "{loop_body}",
            "{init_code}",
            "{used_regs}",
            "{membasereg}",
            "{div_reg}",
            "{freq_path}",
            "{num_instances_per_iteration}",
        ] {
            assert!(!program.contains(hole), "{hole} not substituted");
        }
        assert!(program.contains("add rbx, rsi, 44"));
        assert!(program.contains("mov r15, 10000"));
        assert!(program.contains(", \"rbx\""));
    }
}
