//! Fixed per-ISA register tables.
//!
//! Each category ("G" for general purpose, "V"/"F" for vector, plus the
//! reserved "MEM" and "DIV" singletons) lists register groups; a group maps
//! operand widths to the register's textual name at that width and carries
//! the representation used in the compiler's clobber list. Reserved
//! registers (memory base, divisor, loop control) have no clobber repr:
//! they are hardwired into the program frame.

/// One architectural register, indexable by operand width.
pub struct RegisterGroup {
    /// (width, name) pairs, e.g. `("64", "rax"), ("32", "eax")`.
    pub names: &'static [(&'static str, &'static str)],
    /// Clobber-list spelling, or `None` for reserved registers.
    pub repr: Option<&'static str>,
}

impl RegisterGroup {
    pub fn at_width(&self, width: &str) -> Option<&'static str> {
        self.names
            .iter()
            .find(|(w, _)| *w == width)
            .map(|(_, name)| *name)
    }
}

pub struct RegisterFile {
    pub categories: &'static [(&'static str, &'static [RegisterGroup])],
}

impl RegisterFile {
    pub fn category(&self, name: &str) -> Option<&'static [RegisterGroup]> {
        self.categories
            .iter()
            .find(|(cat, _)| *cat == name)
            .map(|(_, groups)| *groups)
    }

    fn reserved(&self, category: &str, width: &str) -> Option<&'static str> {
        self.category(category)?.first()?.at_width(width)
    }

    /// The reserved base register for memory operands.
    pub fn memory_base(&self, width: &str) -> Option<&'static str> {
        self.reserved("MEM", width)
    }

    /// The reserved non-zero divisor register.
    pub fn div_register(&self, width: &str) -> Option<&'static str> {
        self.reserved("DIV", width)
    }

    /// Every register the generated assembly may write, in the spelling the
    /// compiler's clobber list expects. Reserved registers are excluded.
    pub fn clobber_list(&self) -> Vec<&'static str> {
        let mut res = Vec::new();
        for (_, groups) in self.categories {
            for group in *groups {
                if let Some(repr) = group.repr {
                    res.push(repr);
                }
            }
        }
        res
    }
}

// rax/rcx/rdx, rsp/rbp and r13-r15 are left out: they are taken by the
// program frame, the divisor register, the memory base register and gcc.
pub static X86_64_REGISTERS: RegisterFile = RegisterFile {
    categories: &[
        (
            "G",
            &[
                RegisterGroup { names: &[("64", "rbx"), ("32", "ebx")], repr: Some("rbx") },
                RegisterGroup { names: &[("64", "rsi"), ("32", "esi")], repr: Some("rsi") },
                RegisterGroup { names: &[("64", "rdi"), ("32", "edi")], repr: Some("rdi") },
                RegisterGroup { names: &[("64", "r8"), ("32", "r8d")], repr: Some("r8") },
                RegisterGroup { names: &[("64", "r9"), ("32", "r9d")], repr: Some("r9") },
                RegisterGroup { names: &[("64", "r10"), ("32", "r10d")], repr: Some("r10") },
                RegisterGroup { names: &[("64", "r11"), ("32", "r11d")], repr: Some("r11") },
                RegisterGroup { names: &[("64", "r12"), ("32", "r12d")], repr: Some("r12") },
            ],
        ),
        (
            "V",
            &[
                RegisterGroup { names: &[("256", "ymm0"), ("128", "xmm0")], repr: Some("ymm0") },
                RegisterGroup { names: &[("256", "ymm1"), ("128", "xmm1")], repr: Some("ymm1") },
                RegisterGroup { names: &[("256", "ymm2"), ("128", "xmm2")], repr: Some("ymm2") },
                RegisterGroup { names: &[("256", "ymm3"), ("128", "xmm3")], repr: Some("ymm3") },
                RegisterGroup { names: &[("256", "ymm4"), ("128", "xmm4")], repr: Some("ymm4") },
                RegisterGroup { names: &[("256", "ymm5"), ("128", "xmm5")], repr: Some("ymm5") },
                RegisterGroup { names: &[("256", "ymm6"), ("128", "xmm6")], repr: Some("ymm6") },
                RegisterGroup { names: &[("256", "ymm7"), ("128", "xmm7")], repr: Some("ymm7") },
                RegisterGroup { names: &[("256", "ymm8"), ("128", "xmm8")], repr: Some("ymm8") },
                RegisterGroup { names: &[("256", "ymm9"), ("128", "xmm9")], repr: Some("ymm9") },
                RegisterGroup { names: &[("256", "ymm10"), ("128", "xmm10")], repr: Some("ymm10") },
                RegisterGroup { names: &[("256", "ymm11"), ("128", "xmm11")], repr: Some("ymm11") },
                RegisterGroup { names: &[("256", "ymm12"), ("128", "xmm12")], repr: Some("ymm12") },
                RegisterGroup { names: &[("256", "ymm13"), ("128", "xmm13")], repr: Some("ymm13") },
                RegisterGroup { names: &[("256", "ymm14"), ("128", "xmm14")], repr: Some("ymm14") },
                RegisterGroup { names: &[("256", "ymm15"), ("128", "xmm15")], repr: Some("ymm15") },
            ],
        ),
        (
            "DIV",
            &[RegisterGroup { names: &[("64", "r13"), ("32", "r13d")], repr: None }],
        ),
        (
            "MEM",
            &[RegisterGroup { names: &[("64", "r14"), ("32", "r14d")], repr: None }],
        ),
    ],
};

// x0/x1 belong to the program frame, x28/x29 are the memory base and
// divisor registers, x30/x31 are the link and zero/sp registers.
pub static AARCH64_REGISTERS: RegisterFile = RegisterFile {
    categories: &[
        (
            "G",
            &[
                RegisterGroup { names: &[("64", "x2"), ("32", "w2")], repr: Some("x2") },
                RegisterGroup { names: &[("64", "x3"), ("32", "w3")], repr: Some("x3") },
                RegisterGroup { names: &[("64", "x4"), ("32", "w4")], repr: Some("x4") },
                RegisterGroup { names: &[("64", "x5"), ("32", "w5")], repr: Some("x5") },
                RegisterGroup { names: &[("64", "x6"), ("32", "w6")], repr: Some("x6") },
                RegisterGroup { names: &[("64", "x7"), ("32", "w7")], repr: Some("x7") },
                RegisterGroup { names: &[("64", "x8"), ("32", "w8")], repr: Some("x8") },
                RegisterGroup { names: &[("64", "x9"), ("32", "w9")], repr: Some("x9") },
                RegisterGroup { names: &[("64", "x10"), ("32", "w10")], repr: Some("x10") },
                RegisterGroup { names: &[("64", "x11"), ("32", "w11")], repr: Some("x11") },
                RegisterGroup { names: &[("64", "x12"), ("32", "w12")], repr: Some("x12") },
                RegisterGroup { names: &[("64", "x13"), ("32", "w13")], repr: Some("x13") },
                RegisterGroup { names: &[("64", "x14"), ("32", "w14")], repr: Some("x14") },
                RegisterGroup { names: &[("64", "x15"), ("32", "w15")], repr: Some("x15") },
                RegisterGroup { names: &[("64", "x16"), ("32", "w16")], repr: Some("x16") },
                RegisterGroup { names: &[("64", "x17"), ("32", "w17")], repr: Some("x17") },
                RegisterGroup { names: &[("64", "x18"), ("32", "w18")], repr: Some("x18") },
                RegisterGroup { names: &[("64", "x19"), ("32", "w19")], repr: Some("x19") },
                RegisterGroup { names: &[("64", "x20"), ("32", "w20")], repr: Some("x20") },
                RegisterGroup { names: &[("64", "x21"), ("32", "w21")], repr: Some("x21") },
                RegisterGroup { names: &[("64", "x22"), ("32", "w22")], repr: Some("x22") },
                RegisterGroup { names: &[("64", "x23"), ("32", "w23")], repr: Some("x23") },
                RegisterGroup { names: &[("64", "x24"), ("32", "w24")], repr: Some("x24") },
                RegisterGroup { names: &[("64", "x25"), ("32", "w25")], repr: Some("x25") },
                RegisterGroup { names: &[("64", "x26"), ("32", "w26")], repr: Some("x26") },
                RegisterGroup { names: &[("64", "x27"), ("32", "w27")], repr: Some("x27") },
            ],
        ),
        (
            "F",
            &[
                RegisterGroup { names: &[("VEC", "v0"), ("128", "q0"), ("64", "d0"), ("32", "s0"), ("16", "h0"), ("8", "b0")], repr: Some("v0") },
                RegisterGroup { names: &[("VEC", "v1"), ("128", "q1"), ("64", "d1"), ("32", "s1"), ("16", "h1"), ("8", "b1")], repr: Some("v1") },
                RegisterGroup { names: &[("VEC", "v2"), ("128", "q2"), ("64", "d2"), ("32", "s2"), ("16", "h2"), ("8", "b2")], repr: Some("v2") },
                RegisterGroup { names: &[("VEC", "v3"), ("128", "q3"), ("64", "d3"), ("32", "s3"), ("16", "h3"), ("8", "b3")], repr: Some("v3") },
                RegisterGroup { names: &[("VEC", "v4"), ("128", "q4"), ("64", "d4"), ("32", "s4"), ("16", "h4"), ("8", "b4")], repr: Some("v4") },
                RegisterGroup { names: &[("VEC", "v5"), ("128", "q5"), ("64", "d5"), ("32", "s5"), ("16", "h5"), ("8", "b5")], repr: Some("v5") },
                RegisterGroup { names: &[("VEC", "v6"), ("128", "q6"), ("64", "d6"), ("32", "s6"), ("16", "h6"), ("8", "b6")], repr: Some("v6") },
                RegisterGroup { names: &[("VEC", "v7"), ("128", "q7"), ("64", "d7"), ("32", "s7"), ("16", "h7"), ("8", "b7")], repr: Some("v7") },
                RegisterGroup { names: &[("VEC", "v8"), ("128", "q8"), ("64", "d8"), ("32", "s8"), ("16", "h8"), ("8", "b8")], repr: Some("v8") },
                RegisterGroup { names: &[("VEC", "v9"), ("128", "q9"), ("64", "d9"), ("32", "s9"), ("16", "h9"), ("8", "b9")], repr: Some("v9") },
                RegisterGroup { names: &[("VEC", "v10"), ("128", "q10"), ("64", "d10"), ("32", "s10"), ("16", "h10"), ("8", "b10")], repr: Some("v10") },
                RegisterGroup { names: &[("VEC", "v11"), ("128", "q11"), ("64", "d11"), ("32", "s11"), ("16", "h11"), ("8", "b11")], repr: Some("v11") },
                RegisterGroup { names: &[("VEC", "v12"), ("128", "q12"), ("64", "d12"), ("32", "s12"), ("16", "h12"), ("8", "b12")], repr: Some("v12") },
                RegisterGroup { names: &[("VEC", "v13"), ("128", "q13"), ("64", "d13"), ("32", "s13"), ("16", "h13"), ("8", "b13")], repr: Some("v13") },
                RegisterGroup { names: &[("VEC", "v14"), ("128", "q14"), ("64", "d14"), ("32", "s14"), ("16", "h14"), ("8", "b14")], repr: Some("v14") },
                RegisterGroup { names: &[("VEC", "v15"), ("128", "q15"), ("64", "d15"), ("32", "s15"), ("16", "h15"), ("8", "b15")], repr: Some("v15") },
                RegisterGroup { names: &[("VEC", "v16"), ("128", "q16"), ("64", "d16"), ("32", "s16"), ("16", "h16"), ("8", "b16")], repr: Some("v16") },
                RegisterGroup { names: &[("VEC", "v17"), ("128", "q17"), ("64", "d17"), ("32", "s17"), ("16", "h17"), ("8", "b17")], repr: Some("v17") },
                RegisterGroup { names: &[("VEC", "v18"), ("128", "q18"), ("64", "d18"), ("32", "s18"), ("16", "h18"), ("8", "b18")], repr: Some("v18") },
                RegisterGroup { names: &[("VEC", "v19"), ("128", "q19"), ("64", "d19"), ("32", "s19"), ("16", "h19"), ("8", "b19")], repr: Some("v19") },
                RegisterGroup { names: &[("VEC", "v20"), ("128", "q20"), ("64", "d20"), ("32", "s20"), ("16", "h20"), ("8", "b20")], repr: Some("v20") },
                RegisterGroup { names: &[("VEC", "v21"), ("128", "q21"), ("64", "d21"), ("32", "s21"), ("16", "h21"), ("8", "b21")], repr: Some("v21") },
                RegisterGroup { names: &[("VEC", "v22"), ("128", "q22"), ("64", "d22"), ("32", "s22"), ("16", "h22"), ("8", "b22")], repr: Some("v22") },
                RegisterGroup { names: &[("VEC", "v23"), ("128", "q23"), ("64", "d23"), ("32", "s23"), ("16", "h23"), ("8", "b23")], repr: Some("v23") },
                RegisterGroup { names: &[("VEC", "v24"), ("128", "q24"), ("64", "d24"), ("32", "s24"), ("16", "h24"), ("8", "b24")], repr: Some("v24") },
                RegisterGroup { names: &[("VEC", "v25"), ("128", "q25"), ("64", "d25"), ("32", "s25"), ("16", "h25"), ("8", "b25")], repr: Some("v25") },
                RegisterGroup { names: &[("VEC", "v26"), ("128", "q26"), ("64", "d26"), ("32", "s26"), ("16", "h26"), ("8", "b26")], repr: Some("v26") },
                RegisterGroup { names: &[("VEC", "v27"), ("128", "q27"), ("64", "d27"), ("32", "s27"), ("16", "h27"), ("8", "b27")], repr: Some("v27") },
                RegisterGroup { names: &[("VEC", "v28"), ("128", "q28"), ("64", "d28"), ("32", "s28"), ("16", "h28"), ("8", "b28")], repr: Some("v28") },
                RegisterGroup { names: &[("VEC", "v29"), ("128", "q29"), ("64", "d29"), ("32", "s29"), ("16", "h29"), ("8", "b29")], repr: Some("v29") },
                RegisterGroup { names: &[("VEC", "v30"), ("128", "q30"), ("64", "d30"), ("32", "s30"), ("16", "h30"), ("8", "b30")], repr: Some("v30") },
                RegisterGroup { names: &[("VEC", "v31"), ("128", "q31"), ("64", "d31"), ("32", "s31"), ("16", "h31"), ("8", "b31")], repr: Some("v31") },
            ],
        ),
        (
            "DIV",
            &[RegisterGroup { names: &[("64", "x29"), ("32", "w29")], repr: None }],
        ),
        (
            "MEM",
            &[RegisterGroup { names: &[("64", "x28"), ("32", "w28")], repr: None }],
        ),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_reserved_registers() {
        assert_eq!(X86_64_REGISTERS.memory_base("64"), Some("r14"));
        assert_eq!(X86_64_REGISTERS.memory_base("32"), Some("r14d"));
        assert_eq!(X86_64_REGISTERS.div_register("64"), Some("r13"));
    }

    #[test]
    fn clobber_lists_exclude_reserved_registers() {
        let clobbers = X86_64_REGISTERS.clobber_list();
        assert!(clobbers.contains(&"rbx"));
        assert!(clobbers.contains(&"ymm15"));
        assert!(!clobbers.contains(&"r13"));
        assert!(!clobbers.contains(&"r14"));
        assert_eq!(clobbers.len(), 8 + 16);

        let clobbers = AARCH64_REGISTERS.clobber_list();
        assert_eq!(clobbers.len(), 26 + 32);
        assert!(!clobbers.contains(&"x28"));
        assert!(!clobbers.contains(&"x29"));
    }

    #[test]
    fn aarch64_width_indexing() {
        let f = AARCH64_REGISTERS.category("F").unwrap();
        assert_eq!(f[3].at_width("VEC"), Some("v3"));
        assert_eq!(f[3].at_width("32"), Some("s3"));
        assert_eq!(f[3].at_width("256"), None);
    }
}
