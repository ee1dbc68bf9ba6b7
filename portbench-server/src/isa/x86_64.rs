use super::{Isa, IsaError, NATIVE_PROGRAM_FRAME};
use crate::register_file::{RegisterFile, X86_64_REGISTERS};

const INIT_VAL: i64 = 42;

const INCLUDES: &str = "#include <xmmintrin.h>";

// Executed before time measurement starts.
const ASM_INIT: &str =
    "    _mm_setcsr( _mm_getcsr() | (1<<15) | (1<<6)); // disable denormal floats";

const ASM_LOOP: &str = r#"    __asm__ __volatile__ (
        "   .intel_syntax noprefix\n"
{init_code}
        "   mov r15, {num_iterations}\n"
        "   mov rcx, 4\n"  // prepare shift amount
        "   .p2align 4,,15\n"
        "TestbenchLabel:\n"
        // benchmarked instructions begin
{loop_body}
        // benchmarked instructions end
        "   sub r15, 1\n"
        "   jnz TestbenchLabel\n"
        "   .att_syntax\n"
        : /* no output */
        : "r" (mem), /* input for memory operands */
          "r" (div)  /* input for divisor operands */
        : "r15", "rcx", "rax", "rdx" {used_regs}
    );"#;

pub struct X86_64Isa {
    frame: String,
}

pub fn build() -> Box<dyn Isa> {
    let warmup = ASM_LOOP
        .replace("{num_iterations}", "1000")
        .replace("TestbenchLabel", "WarmupLabel");
    let frame = NATIVE_PROGRAM_FRAME
        .replacen("{INCLUDES}", INCLUDES, 1)
        .replacen("{ASM_INIT}", ASM_INIT, 1)
        .replacen("{ASM_INSTRUCTIONS}", ASM_LOOP, 1)
        .replacen("{WARMUP_CODE}", &warmup, 1);
    Box::new(X86_64Isa { frame })
}

impl Isa for X86_64Isa {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn insn_dir(&self) -> &'static str {
        "x86_64"
    }

    fn register_file(&self) -> &'static RegisterFile {
        &X86_64_REGISTERS
    }

    fn program_frame(&self) -> &str {
        &self.frame
    }

    fn init_code_for_register(&self, reg: &str) -> Result<String, IsaError> {
        if reg.starts_with('r') {
            return Ok(format!("        \"   mov {reg}, {INIT_VAL}\\n\"\n"));
        }
        if reg.starts_with("ymm") {
            // Seed the vector register by broadcasting a scalar.
            let xmm_reg = reg.replacen('y', "x", 1);
            return Ok(format!(
                r#"
        "   mov r15d, {INIT_VAL}\n"
        "   vcvtsi2ss {xmm_reg}, {xmm_reg}, r15d\n"
        "   vpermilps {xmm_reg}, {xmm_reg}, 0\n"
        "   vinsertf128 {reg}, {reg}, {xmm_reg}, 1\n""#,
            ));
        }
        Err(IsaError::NoInitCode(reg.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_keeps_per_run_holes_only() {
        let isa = build();
        let frame = isa.program_frame();
        assert!(!frame.contains("{INCLUDES}"));
        assert!(!frame.contains("{ASM_INIT}"));
        assert!(!frame.contains("{ASM_INSTRUCTIONS}"));
        assert!(!frame.contains("{WARMUP_CODE}"));
        assert!(frame.contains("{num_iterations}"));
        assert!(frame.contains("{loop_body}"));
        assert!(frame.contains("{used_regs}"));
        assert!(frame.contains("{membasereg}"));
        assert!(frame.contains("WarmupLabel"));
        assert!(frame.contains("TestbenchLabel"));
    }

    #[test]
    fn general_register_init() {
        let isa = build();
        let code = isa.init_code_for_register("rbx").unwrap();
        assert_eq!(code, "        \"   mov rbx, 42\\n\"\n");
    }

    #[test]
    fn vector_register_init_broadcasts() {
        let isa = build();
        let code = isa.init_code_for_register("ymm3").unwrap();
        assert!(code.contains("vcvtsi2ss xmm3, xmm3, r15d"));
        assert!(code.contains("vinsertf128 ymm3, ymm3, xmm3, 1"));
    }

    #[test]
    fn unknown_registers_have_no_init_code() {
        let isa = build();
        assert!(isa.init_code_for_register("zmm0").is_err());
    }
}
