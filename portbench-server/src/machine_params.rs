//! Machine-dependent loop parameters, determined once by direct
//! measurement and cached next to the benchmark artifacts.

use std::collections::BTreeMap;
use std::fs;
use std::time::Instant;

use serde_derive::{Deserialize, Serialize};

use crate::driver::{run_once, DriverError, RunError};
use crate::insn_form::InsnForm;
use crate::isa::Isa;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineParams {
    /// How many dynamic instructions one measurement loop executes in
    /// total, sized so a loop runs for roughly the target wall time.
    pub num_total_dynamic_insns: u64,
    /// Loop body length at which the front end stops being the bottleneck.
    pub num_insns_per_iteration: u64,
}

/// Parameters used for simulated back-ends, where loop sizing is
/// meaningless.
pub const SIMULATED_PARAMS: MachineParams = MachineParams {
    num_total_dynamic_insns: 10,
    num_insns_per_iteration: 10,
};

fn unwrap_calibration(run: Result<port_mapping::experiment::RunRecord, RunError>) -> Result<port_mapping::experiment::RunRecord, DriverError> {
    match run {
        Ok(record) => Ok(record),
        Err(RunError::Driver(err)) => Err(err),
        Err(RunError::Measure(err)) => Err(DriverError::ProbeFailed(err)),
    }
}

/// Returns the cached parameters, or measures and caches them. A prior
/// cache file is kept as `params.json.bak` when recalibrating.
pub fn load_or_calibrate(
    settings: &Settings,
    isa: &dyn Isa,
    forms: &BTreeMap<String, InsnForm>,
) -> Result<MachineParams, DriverError> {
    let params_file = settings.machine_params_file();
    if params_file.is_file() && !settings.recalibrate {
        let params: MachineParams = serde_json::from_str(&fs::read_to_string(&params_file)?)
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unreadable {}: {e}", params_file.display()),
                )
            })?;
        log::info!(
            "loaded machine parameters: {} dynamic instructions, {} per iteration",
            params.num_total_dynamic_insns,
            params.num_insns_per_iteration
        );
        return Ok(params);
    }

    assert!(
        forms.len() >= 5,
        "at least 5 instructions are required for calibration"
    );

    let num_total_dynamic_insns = determine_num_total_dynamic_insns(settings, isa, forms)?;
    let num_insns_per_iteration =
        determine_num_insns_per_iteration(settings, isa, forms, num_total_dynamic_insns)?;
    let params = MachineParams {
        num_total_dynamic_insns,
        num_insns_per_iteration,
    };

    if params_file.is_file() {
        fs::rename(&params_file, params_file.with_extension("json.bak"))?;
    }
    let body = serde_json::to_string(&params).map_err(std::io::Error::from)?;
    fs::write(&params_file, body)?;
    log::info!(
        "calibrated machine parameters: {} dynamic instructions, {} per iteration",
        params.num_total_dynamic_insns,
        params.num_insns_per_iteration
    );
    Ok(params)
}

/// Scales a fixed large dynamic instruction count so that one loop takes
/// about the target wall time. The minimum time across samples and probe
/// instructions rejects outliers.
fn determine_num_total_dynamic_insns(
    settings: &Settings,
    isa: &dyn Isa,
    forms: &BTreeMap<String, InsnForm>,
) -> Result<u64, DriverError> {
    const PROBE_LOOP_LENGTH: u64 = 200;
    const PROBE_DYNAMIC_INSNS: u64 = 1_000_000_000;
    const SAMPLES_PER_INSN: u32 = 11;

    log::info!(
        "determining the dynamic instruction count for {}s loops",
        settings.loop_target_time
    );

    let mut min_time = f64::INFINITY;
    for insn in forms.keys().take(5) {
        for _ in 0..SAMPLES_PER_INSN {
            let record = unwrap_calibration(run_once(
                settings,
                isa,
                forms,
                std::slice::from_ref(insn),
                PROBE_LOOP_LENGTH,
                PROBE_DYNAMIC_INSNS,
            ))?;
            min_time = min_time.min(record.benchtime / 1_000_000.0);
        }
    }

    let num = ((settings.loop_target_time / min_time) * PROBE_DYNAMIC_INSNS as f64).round() as u64;
    log::info!("determined the total number of dynamic instructions to be {num}");
    Ok(num)
}

/// Coarse sweep over loop body lengths followed by a fine sweep around the
/// coarse minimum.
fn determine_num_insns_per_iteration(
    settings: &Settings,
    isa: &dyn Isa,
    forms: &BTreeMap<String, InsnForm>,
    num_total_dynamic_insns: u64,
) -> Result<u64, DriverError> {
    let config = settings.setup_config();
    let started = Instant::now();
    log::info!("determining the number of instructions per iteration");

    let probe_seq: Vec<String> = forms.keys().take(5).cloned().collect();

    let sweep = |start: u64, end: u64, step: u64| -> Result<u64, DriverError> {
        let mut best: Option<(u64, f64)> = None;
        let mut length = start;
        while length < end {
            let mut cycles = f64::INFINITY;
            for _ in 0..config.num_samples {
                let record = unwrap_calibration(run_once(
                    settings,
                    isa,
                    forms,
                    &probe_seq,
                    length,
                    num_total_dynamic_insns,
                ))?;
                cycles = cycles.min(record.cycles);
            }
            if best.is_none() || cycles < best.unwrap().1 {
                best = Some((length, cycles));
            }
            length += step;
        }
        Ok(best.expect("sweep ranges are non-empty").0)
    };

    let coarse = sweep(
        config.start_loop_length,
        config.end_loop_length,
        config.step_width,
    )?;
    // Keep the fine sweep's window inside the probed range.
    let coarse = coarse.max(config.start_loop_length + config.step_width);
    log::info!("number of instructions per iteration is around {coarse}");

    let fine = sweep(
        coarse - config.step_width,
        coarse + config.step_width,
        config.fine_grained_step_width,
    )?;
    log::info!(
        "number of instructions per iteration fixed at {fine} (took {:.1}s)",
        started.elapsed().as_secs_f64()
    );
    Ok(fine)
}
