use std::path::{Path, PathBuf};

/// Parameters of the loop-length calibration sweep.
#[derive(Debug, Clone, Copy)]
pub struct SetupConfig {
    pub start_loop_length: u64,
    pub end_loop_length: u64,
    pub step_width: u64,
    pub fine_grained_step_width: u64,
    pub num_samples: u32,
}

pub const DEFAULT_SETUP: SetupConfig = SetupConfig {
    start_loop_length: 100,
    end_loop_length: 10000,
    step_width: 1000,
    fine_grained_step_width: 500,
    num_samples: 5,
};

pub const PRECISE_SETUP: SetupConfig = SetupConfig {
    start_loop_length: 100,
    end_loop_length: 70000,
    step_width: 500,
    fine_grained_step_width: 25,
    num_samples: 11,
};

/// Server-wide configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// The core experiments are pinned to.
    pub core: u32,
    /// Skip everything that needs the cpufreq sysfs files.
    pub no_root: bool,
    pub precise_setup: bool,
    /// Redo the machine calibration even if a cached one exists.
    pub recalibrate: bool,
    /// Directory with per-ISA `.insn` instruction-form files.
    pub input_dir: PathBuf,
    /// Scratch directory for benchmark source, binary and calibration.
    /// Keyed by the listening port so instances don't collide.
    pub output_dir: PathBuf,
    pub cc: PathBuf,
    pub iaca_path: PathBuf,
    pub llvm_mca_path: PathBuf,
    /// Target wall time per measurement loop, in seconds.
    pub loop_target_time: f64,
    pub default_num_repetitions: u32,
    pub default_max_uncertainty: f64,
}

impl Settings {
    pub fn new(core: u32, port: u16, input_dir: PathBuf) -> Self {
        let cc = std::env::var_os("CC")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("gcc"));
        let iaca_path = std::env::var_os("IACA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/opt/deps/iaca"));
        let llvm_mca_path = std::env::var_os("LLVM_MCA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/opt/deps/llvm-project/build/bin"));
        Settings {
            core,
            no_root: false,
            precise_setup: false,
            recalibrate: false,
            input_dir,
            output_dir: PathBuf::from(format!("/tmp/portbench_{port}")),
            cc,
            iaca_path,
            llvm_mca_path,
            loop_target_time: 0.4,
            default_num_repetitions: 5,
            default_max_uncertainty: 0.05,
        }
    }

    pub fn setup_config(&self) -> SetupConfig {
        if self.precise_setup {
            PRECISE_SETUP
        } else {
            DEFAULT_SETUP
        }
    }

    pub fn benchmark_src(&self) -> PathBuf {
        self.output_dir.join("benchmark.c")
    }

    pub fn benchmark_bin(&self) -> PathBuf {
        self.output_dir.join("benchmark")
    }

    pub fn machine_params_file(&self) -> PathBuf {
        self.output_dir.join("params.json")
    }

    fn cpufreq_file(&self, name: &str) -> PathBuf {
        Path::new(&format!(
            "/sys/devices/system/cpu/cpu{}/cpufreq",
            self.core
        ))
        .join(name)
    }

    pub fn scaling_governor(&self) -> PathBuf {
        self.cpufreq_file("scaling_governor")
    }

    pub fn scaling_max_freq(&self) -> PathBuf {
        self.cpufreq_file("scaling_max_freq")
    }

    pub fn scaling_min_freq(&self) -> PathBuf {
        self.cpufreq_file("scaling_min_freq")
    }

    pub fn scaling_cur_freq(&self) -> PathBuf {
        self.cpufreq_file("scaling_cur_freq")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_keyed_by_port_and_core() {
        let settings = Settings::new(5, 42424, PathBuf::from("./input"));
        assert_eq!(
            settings.benchmark_src(),
            PathBuf::from("/tmp/portbench_42424/benchmark.c")
        );
        assert_eq!(
            settings.machine_params_file(),
            PathBuf::from("/tmp/portbench_42424/params.json")
        );
        assert_eq!(
            settings.scaling_cur_freq(),
            PathBuf::from("/sys/devices/system/cpu/cpu5/cpufreq/scaling_cur_freq")
        );
    }
}
