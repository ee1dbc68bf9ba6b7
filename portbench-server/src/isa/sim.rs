//! Simulated back-ends: instead of running the produced binary on real
//! hardware, the benchmark kernel is compiled without linking and handed to
//! an external throughput estimator whose textual output is parsed.

use std::ffi::OsString;
use std::path::Path;

use regex::Regex;

use port_mapping::experiment::MeasureError;

use super::{Isa, IsaError, RawMeasurement};
use crate::register_file::{RegisterFile, AARCH64_REGISTERS, X86_64_REGISTERS};
use crate::settings::Settings;

// The kernel variant fed to the estimators, bracketed by the IACA and
// llvm-mca region markers.
const X86_64_SIM_FRAME: &str = r##"
void *aligned_alloc(long unsigned int alignment, long unsigned int size);

int kernel(int n) {
    void * memt = aligned_alloc(4096, 4096);
    register void * mem asm("{membasereg}") = memt;
    register long long div asm("{div_reg}") = 44; // initialize the non-zero divisor register
    __asm__ __volatile__ (
        "movl $111, %%ebx\n" // IACA start marker
        ".byte 0x64, 0x67, 0x90\n"
        "   .intel_syntax noprefix\n"
        "# LLVM-MCA-BEGIN\n"
{loop_body}
        "# LLVM-MCA-END\n"
        "   .att_syntax\n"
        "movl $222, %%ebx\n" // IACA end marker
        ".byte 0x64, 0x67, 0x90\n"
    : /* no output */
    : "r" (mem), /* input for memory operands */
      "r" (div)  /* input for divisor operands */
    : "ebx", "rax", "rdx" {used_regs}, "memory"
    );
    return 0;
}
"##;

const AARCH64_SIM_FRAME: &str = r##"
void *aligned_alloc(long unsigned int alignment, long unsigned int size);

int kernel(int n) {
    void * memt = aligned_alloc(4096, 4096);
    register void * mem asm("{membasereg}") = memt;
    register long long div asm("{div_reg}") = 44; // initialize the non-zero divisor register
    __asm__ __volatile__ (
        "# LLVM-MCA-BEGIN\n"
{loop_body}
        "# LLVM-MCA-END\n"
    : /* no output */
    : "r" (mem), /* input for memory operands */
      "r" (div)  /* input for divisor operands */
    : "x0" {used_regs}, "memory"
    );
    return 0;
}
"##;

enum SimTool {
    Iaca,
    Ithemal,
    LlvmMca {
        mca_args: &'static [&'static str],
        /// The compiler emits `// LLVM-...` comments for this target; the
        /// markers must be rewritten to `#` comments before llvm-mca sees
        /// them.
        rewrite_markers: bool,
    },
}

pub struct SimIsa {
    name: &'static str,
    insn_dir: &'static str,
    register_file: &'static RegisterFile,
    frame: &'static str,
    cc_flags: &'static [&'static str],
    tool: SimTool,
    tool_label: &'static str,
    parse_re: Regex,
    /// Ithemal and llvm-mca report cycles for 100 iterations of the block.
    divide_by_100: bool,
}

pub fn build_iaca() -> Box<dyn Isa> {
    Box::new(SimIsa {
        name: "IACAx86_64",
        insn_dir: "x86_64",
        register_file: &X86_64_REGISTERS,
        frame: X86_64_SIM_FRAME,
        cc_flags: &["-c"],
        tool: SimTool::Iaca,
        tool_label: "iaca",
        parse_re: Regex::new(r"Block Throughput: (\d+\.\d+)").expect("valid regex"),
        divide_by_100: false,
    })
}

pub fn build_ithemal() -> Box<dyn Isa> {
    Box::new(SimIsa {
        name: "Ithemalx86_64",
        insn_dir: "x86_64",
        register_file: &X86_64_REGISTERS,
        frame: X86_64_SIM_FRAME,
        cc_flags: &["-c"],
        tool: SimTool::Ithemal,
        tool_label: "ithemal",
        parse_re: Regex::new(r"(\d+\.\d+)").expect("valid regex"),
        divide_by_100: true,
    })
}

pub fn build_mca_skylake() -> Box<dyn Isa> {
    Box::new(SimIsa {
        name: "LLVMMCA_SKLx86_64",
        insn_dir: "x86_64",
        register_file: &X86_64_REGISTERS,
        frame: X86_64_SIM_FRAME,
        cc_flags: &["-c", "-S", "--target=x86_64"],
        tool: SimTool::LlvmMca {
            mca_args: &["-march=x86-64", "-mcpu=skylake"],
            rewrite_markers: false,
        },
        tool_label: "llvm-mca",
        parse_re: Regex::new(r"Total Cycles:\s*(\d+)").expect("valid regex"),
        divide_by_100: true,
    })
}

pub fn build_mca_znver1() -> Box<dyn Isa> {
    Box::new(SimIsa {
        name: "LLVMMCA_ZENPx86_64",
        insn_dir: "x86_64",
        register_file: &X86_64_REGISTERS,
        frame: X86_64_SIM_FRAME,
        cc_flags: &["-c", "-S", "--target=x86_64"],
        tool: SimTool::LlvmMca {
            mca_args: &["-march=x86-64", "-mcpu=znver1"],
            rewrite_markers: false,
        },
        tool_label: "llvm-mca",
        parse_re: Regex::new(r"Total Cycles:\s*(\d+)").expect("valid regex"),
        divide_by_100: true,
    })
}

pub fn build_mca_a72() -> Box<dyn Isa> {
    Box::new(SimIsa {
        name: "LLVMMCA_A72_ARM",
        insn_dir: "aarch64",
        register_file: &AARCH64_REGISTERS,
        frame: AARCH64_SIM_FRAME,
        cc_flags: &["-c", "-S", "--target=aarch64"],
        tool: SimTool::LlvmMca {
            mca_args: &["-march=aarch64", "-mcpu=cortex-a72"],
            rewrite_markers: true,
        },
        tool_label: "llvm-mca",
        parse_re: Regex::new(r"Total Cycles:\s*(\d+)").expect("valid regex"),
        divide_by_100: true,
    })
}

impl Isa for SimIsa {
    fn name(&self) -> &'static str {
        self.name
    }

    fn insn_dir(&self) -> &'static str {
        self.insn_dir
    }

    fn register_file(&self) -> &'static RegisterFile {
        self.register_file
    }

    fn program_frame(&self) -> &str {
        self.frame
    }

    fn init_code_for_register(&self, _reg: &str) -> Result<String, IsaError> {
        Ok(String::new())
    }

    fn additional_cc_flags(&self) -> &'static [&'static str] {
        self.cc_flags
    }

    fn is_simulated(&self) -> bool {
        true
    }

    fn prepare_binary(&self, bmk_bin: &Path) -> std::io::Result<()> {
        if let SimTool::LlvmMca {
            rewrite_markers: true,
            ..
        } = self.tool
        {
            let asm = std::fs::read_to_string(bmk_bin)?;
            std::fs::write(bmk_bin, asm.replace("// LLVM", "# LLVM"))?;
        }
        Ok(())
    }

    fn create_command(&self, settings: &Settings, bmk_bin: &Path) -> Vec<OsString> {
        let mut command: Vec<OsString> = Vec::new();
        match &self.tool {
            SimTool::Iaca => {
                command.push(settings.iaca_path.join("iaca").into_os_string());
            }
            SimTool::Ithemal => {
                command.push("/home/ithemal/ithemal/learning/pytorch/ithemal/predict.py".into());
                command.push("--model".into());
                command.push("/home/ithemal/ithemal/skylake/predictor.dump".into());
                command.push("--model-data".into());
                command.push("/home/ithemal/ithemal/skylake/trained.mdl".into());
                command.push("--file".into());
            }
            SimTool::LlvmMca { mca_args, .. } => {
                command.push(settings.llvm_mca_path.join("llvm-mca").into_os_string());
                for arg in *mca_args {
                    command.push((*arg).into());
                }
            }
        }
        command.push(bmk_bin.as_os_str().to_owned());
        command
    }

    fn extract_result(
        &self,
        stdout: &str,
        num_testcase_instances: u64,
    ) -> Result<RawMeasurement, MeasureError> {
        let caps = self
            .parse_re
            .captures(stdout)
            .ok_or_else(|| MeasureError::ToolOutputMissing {
                tool: self.tool_label.to_owned(),
            })?;
        let mut total: f64 = caps[1].parse().map_err(|_| MeasureError::ToolOutputMissing {
            tool: self.tool_label.to_owned(),
        })?;
        if self.divide_by_100 {
            total /= 100.0;
        }
        Ok(RawMeasurement {
            benchtime: None,
            cycles: total / num_testcase_instances as f64,
            meas_freq: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iaca_output_parsing() {
        let isa = build_iaca();
        let raw = isa
            .extract_result("Throughput Analysis Report\nBlock Throughput: 12.50 Cycles\n", 10)
            .unwrap();
        assert_eq!(raw.cycles, 1.25);
        assert_eq!(raw.benchtime, None);

        let err = isa.extract_result("nothing to see here", 10).unwrap_err();
        assert_eq!(
            err,
            MeasureError::ToolOutputMissing {
                tool: "iaca".to_owned()
            }
        );
        assert_eq!(err.to_string(), "throughput missing in iaca output");
    }

    #[test]
    fn llvm_mca_output_parsing() {
        let isa = build_mca_skylake();
        let raw = isa
            .extract_result("Iterations: 100\nTotal Cycles: 5000\nTotal uOps: 400\n", 10)
            .unwrap();
        // 5000 cycles over 100 block iterations and 10 testcase instances.
        assert_eq!(raw.cycles, 5.0);
    }

    #[test]
    fn ithemal_output_is_a_bare_float() {
        let isa = build_ithemal();
        let raw = isa.extract_result("250.00\n", 1).unwrap();
        assert_eq!(raw.cycles, 2.5);
    }

    #[test]
    fn simulated_isas_have_no_init_code() {
        let isa = build_mca_a72();
        assert_eq!(isa.init_code_for_register("x5").unwrap(), "");
        assert!(isa.is_simulated());
    }
}
