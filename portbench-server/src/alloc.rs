//! Operand allocation for benchmark loops.
//!
//! The allocator separates the definition and the use of registers as far
//! as possible: writing operands are assigned first from a rotating write
//! index, then the read index is reset to the write index, so the register
//! an instruction just wrote is the *last* candidate for the next reads.
//! Memory offsets rotate in 64-byte steps so successive accesses do not
//! alias.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::insn_form::{InsnInstance, Placeholder, PlaceholderKind};
use crate::isa::Isa;

pub const MEM_OFFSET_STEP: u64 = 64;
pub const MEM_OFFSET_MAX: u64 = 4032;

/// The constant used for all immediate operands and the divisor register.
pub const IMMEDIATE_VALUE: i64 = 44;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("register file has no category {0:?}")]
    UnknownCategory(String),

    #[error("no register of category {category:?} at width {width:?}")]
    NoRegisterAtWidth { category: String, width: String },

    #[error("no reserved {kind} register at width {width:?}")]
    NoReservedRegister { kind: &'static str, width: String },

    #[error("writing placeholder {placeholder:?} is not a register")]
    NonRegisterWrite { placeholder: String },
}

pub struct Allocator<'a> {
    isa: &'a dyn Isa,
    next_mem_offset: u64,
    write_indices: FxHashMap<String, usize>,
    read_indices: FxHashMap<String, usize>,
}

impl<'a> Allocator<'a> {
    pub fn new(isa: &'a dyn Isa) -> Self {
        Allocator {
            isa,
            next_mem_offset: MEM_OFFSET_STEP,
            write_indices: FxHashMap::default(),
            read_indices: FxHashMap::default(),
        }
    }

    /// The next memory offset. Consecutive calls are spread far enough
    /// apart to keep successive memory accesses independent, wrapping
    /// after [`MEM_OFFSET_MAX`].
    pub fn mem_offset(&mut self) -> u64 {
        let res = self.next_mem_offset;
        if self.next_mem_offset >= MEM_OFFSET_MAX {
            self.next_mem_offset = MEM_OFFSET_STEP;
        } else {
            self.next_mem_offset += MEM_OFFSET_STEP;
        }
        res
    }

    fn register(
        &mut self,
        category: &str,
        width: &str,
        write: bool,
    ) -> Result<&'static str, AllocError> {
        let groups = self
            .isa
            .register_file()
            .category(category)
            .ok_or_else(|| AllocError::UnknownCategory(category.to_owned()))?;
        let indices = if write {
            &mut self.write_indices
        } else {
            &mut self.read_indices
        };
        let index = indices.entry(category.to_owned()).or_insert(0);
        let group = &groups[*index];
        *index = (*index + 1) % groups.len();
        group
            .at_width(width)
            .ok_or_else(|| AllocError::NoRegisterAtWidth {
                category: category.to_owned(),
                width: width.to_owned(),
            })
    }

    /// Makes the next register to read the one after the next register to
    /// write.
    fn reset_read_registers(&mut self) {
        for (category, _) in self.isa.register_file().categories {
            let write = self.write_indices.get(*category).copied().unwrap_or(0);
            self.read_indices.insert((*category).to_owned(), write);
        }
    }

    fn reserved(&self, kind: &'static str, width: &str) -> Result<&'static str, AllocError> {
        let regfile = self.isa.register_file();
        let reg = match kind {
            "memory base" => regfile.memory_base(width),
            _ => regfile.div_register(width),
        };
        reg.ok_or_else(|| AllocError::NoReservedRegister {
            kind,
            width: width.to_owned(),
        })
    }

    /// Assigns concrete operands to every placeholder of the sequence.
    pub fn allocate(&mut self, iseq: &mut [InsnInstance<'_>]) -> Result<(), AllocError> {
        for inst in iseq.iter_mut() {
            let placeholders: Vec<Placeholder> = inst.form().placeholders().to_vec();

            // Writing operands first, so reads never start on a register
            // written by this very instruction.
            for ph in placeholders.iter().filter(|ph| ph.is_writing()) {
                let category = ph.reg_category().ok_or_else(|| AllocError::NonRegisterWrite {
                    placeholder: format!("{:?}", ph.kind),
                })?;
                let reg = self.register(category, &ph.width, true)?;
                inst.assign(ph.idx, reg.to_owned());
            }

            self.reset_read_registers();

            for ph in placeholders.iter().filter(|ph| !ph.is_writing()) {
                let operand = match &ph.kind {
                    PlaceholderKind::Immediate => self.isa.as_imm(IMMEDIATE_VALUE),
                    PlaceholderKind::MemOffset => self.mem_offset().to_string(),
                    PlaceholderKind::MemBase => self.reserved("memory base", &ph.width)?.to_owned(),
                    PlaceholderKind::Divisor => self.reserved("divisor", &ph.width)?.to_owned(),
                    PlaceholderKind::Register { category, .. } => {
                        self.register(category, &ph.width, false)?.to_owned()
                    }
                };
                inst.assign(ph.idx, operand);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn_form::InsnForm;
    use crate::isa::create_isa;

    fn x86() -> Box<dyn Isa> {
        create_isa("x86_64").expect("x86_64 is registered")
    }

    #[test]
    fn write_then_wrapped_read() {
        let isa = x86();
        let form = InsnForm::parse("add ((REG:W:G:64)), ((REG:R:G:64)), ((IMM:8))").unwrap();
        let mut iseq = vec![form.instantiate()];
        let mut alloc = Allocator::new(isa.as_ref());
        alloc.allocate(&mut iseq).unwrap();
        // First write takes rbx; the read index is then reset to the write
        // index, so the first read lands on rsi.
        assert_eq!(iseq[0].render().unwrap(), "add rbx, rsi, 44");
    }

    #[test]
    fn writes_rotate_through_the_pool() {
        let isa = x86();
        let form = InsnForm::parse("add ((REG:W:G:64)), ((REG:R:G:64))").unwrap();
        let mut iseq: Vec<_> = (0..3).map(|_| form.instantiate()).collect();
        let mut alloc = Allocator::new(isa.as_ref());
        alloc.allocate(&mut iseq).unwrap();
        assert_eq!(iseq[0].render().unwrap(), "add rbx, rsi");
        assert_eq!(iseq[1].render().unwrap(), "add rsi, rdi");
        assert_eq!(iseq[2].render().unwrap(), "add rdi, r8");
    }

    #[test]
    fn mem_offsets_step_and_wrap() {
        let isa = x86();
        let mut alloc = Allocator::new(isa.as_ref());
        let first_twelve: Vec<u64> = (0..12).map(|_| alloc.mem_offset()).collect();
        let expected: Vec<u64> = (1..=12).map(|i| i * 64).collect();
        assert_eq!(first_twelve, expected);
        assert_eq!(*first_twelve.last().unwrap(), 768);

        // 63 distinct offsets fit below the wrap point; call 64 wraps.
        let mut alloc = Allocator::new(isa.as_ref());
        let mut offset = 0;
        for _ in 0..64 {
            offset = alloc.mem_offset();
        }
        assert_eq!(offset, 64);
    }

    #[test]
    fn reserved_operands_resolve_at_width() {
        let isa = x86();
        let form = InsnForm::parse("mov ((REG:W:G:32)), dword ptr [((MEM:64)) + ((MIMM:8))]")
            .unwrap();
        let mut iseq = vec![form.instantiate()];
        let mut alloc = Allocator::new(isa.as_ref());
        alloc.allocate(&mut iseq).unwrap();
        assert_eq!(iseq[0].render().unwrap(), "mov ebx, dword ptr [r14 + 64]");

        let form = InsnForm::parse("div ((DIV:32))").unwrap();
        let mut iseq = vec![form.instantiate()];
        let mut alloc = Allocator::new(isa.as_ref());
        alloc.allocate(&mut iseq).unwrap();
        assert_eq!(iseq[0].render().unwrap(), "div r13d");
    }

    #[test]
    fn unknown_categories_are_structural_errors() {
        let isa = x86();
        let form = InsnForm::parse("bad ((REG:R:Z:64))").unwrap();
        let mut iseq = vec![form.instantiate()];
        let mut alloc = Allocator::new(isa.as_ref());
        assert_eq!(
            alloc.allocate(&mut iseq),
            Err(AllocError::UnknownCategory("Z".to_owned()))
        );

        let form = InsnForm::parse("bad ((REG:R:G:512))").unwrap();
        let mut iseq = vec![form.instantiate()];
        let mut alloc = Allocator::new(isa.as_ref());
        assert!(matches!(
            alloc.allocate(&mut iseq),
            Err(AllocError::NoRegisterAtWidth { .. })
        ));
    }
}
