use super::{Isa, IsaError, NATIVE_PROGRAM_FRAME};
use crate::register_file::{RegisterFile, AARCH64_REGISTERS};

const INCLUDES: &str = "";

// Enable flush-to-zero for denormal floats before measuring.
const ASM_INIT: &str = r#"    __asm__ __volatile__ (
        "   mrs x0, FPCR \n" // Read Floating-point Control Register
        "   orr x0, x0, 0x1000000 \n" // set bit 24, enable flush-to-zero mode for denormal floats
        "   msr FPCR, x0 \n" // Write Floating-point Control Register
        : /* no output */
        : /* no input */
        : "x0"
    );"#;

// The iteration count arrives as two 16-bit halves because mov/movk build
// the 32-bit counter immediate.
const ASM_LOOP: &str = r#"    __asm__ __volatile__ (
{init_code}
        "   mov w0, #0 \n"
        "   mov w1, #{lower16bit} \n"
        "   movk w1, #{upper16bit}, LSL #16 \n"
        "   b .TestbenchLabel1 \n"
        "   .p2align 4,,15\n"
        ".TestbenchLabel2: \n"
{loop_body}
        "   add w0, w0, #1 \n"
        ".TestbenchLabel1: \n"
        "   cmp w0, w1 \n"
        "   blt .TestbenchLabel2 \n"
        : /* no output */
        : "r" (mem), /* input for memory operands */
          "r" (div)  /* input for divisor operands */
        : "x0", "x1" {used_regs}
    );"#;

pub struct AArch64Isa {
    frame: String,
}

pub fn build() -> Box<dyn Isa> {
    let frame = NATIVE_PROGRAM_FRAME
        .replacen("{INCLUDES}", INCLUDES, 1)
        .replacen("{ASM_INIT}", ASM_INIT, 1)
        .replacen("{ASM_INSTRUCTIONS}", ASM_LOOP, 1)
        .replacen("{WARMUP_CODE}", "", 1);
    Box::new(AArch64Isa { frame })
}

impl Isa for AArch64Isa {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn insn_dir(&self) -> &'static str {
        "aarch64"
    }

    fn register_file(&self) -> &'static RegisterFile {
        &AARCH64_REGISTERS
    }

    fn program_frame(&self) -> &str {
        &self.frame
    }

    fn init_code_for_register(&self, reg: &str) -> Result<String, IsaError> {
        if reg.starts_with('x') {
            return Ok(format!("\"    mov {reg}, #42\\n\"\n"));
        }
        if reg.starts_with('v') {
            return Ok(format!("\"    fmov {reg}.4s, 24.0\\n\"\n"));
        }
        Err(IsaError::NoInitCode(reg.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_built_from_16bit_halves() {
        let isa = build();
        let frame = isa.program_frame();
        assert!(frame.contains("{lower16bit}"));
        assert!(frame.contains("{upper16bit}"));
        assert!(!frame.contains("{ASM_INSTRUCTIONS}"));
    }

    #[test]
    fn register_init_code() {
        let isa = build();
        assert_eq!(
            isa.init_code_for_register("x7").unwrap(),
            "\"    mov x7, #42\\n\"\n"
        );
        assert_eq!(
            isa.init_code_for_register("v12").unwrap(),
            "\"    fmov v12.4s, 24.0\\n\"\n"
        );
        assert!(isa.init_code_for_register("q0").is_err());
    }
}
