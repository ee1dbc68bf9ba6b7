//! Instruction templates with typed operand placeholders.
//!
//! A template like `add ((REG:W:G:64)), ((REG:R:G:64)), ((IMM:8))` is
//! scanned for `((...))` delimiters; the placeholder bodies describe what
//! kind of operand goes in each hole. The register allocator assigns
//! concrete operand strings to an instance, which then renders to the
//! final assembly line.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(\(([A-Za-z0-9_:]+)\)\)").expect("placeholder regex is valid"))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormError {
    #[error("invalid placeholder {body:?}: {what}")]
    BadPlaceholder { body: String, what: String },

    #[error("placeholder {idx} of {form:?} was never assigned an operand")]
    UnassignedOperand { idx: usize, form: String },
}

fn bad(body: &str, what: impl Into<String>) -> FormError {
    FormError::BadPlaceholder {
        body: body.to_owned(),
        what: what.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderKind {
    /// Literal constant, possibly with an ISA-specific prefix.
    Immediate,
    /// Offset into the scratch memory block, rotated between accesses.
    MemOffset,
    /// The reserved memory base register.
    MemBase,
    /// The reserved non-zero divisor register.
    Divisor,
    /// A register drawn from the category's pool.
    Register {
        category: String,
        is_reading: bool,
        is_writing: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// 0-based position in textual order.
    pub idx: usize,
    pub kind: PlaceholderKind,
    pub width: String,
}

impl Placeholder {
    fn parse(idx: usize, body: &str) -> Result<Self, FormError> {
        let elems: Vec<&str> = body.split(':').collect();
        let kind = match elems[0] {
            "IMM" | "MIMM" | "MEM" | "DIV" => {
                if elems.len() != 2 {
                    return Err(bad(body, "expected exactly one parameter (the width)"));
                }
                match elems[0] {
                    "IMM" => PlaceholderKind::Immediate,
                    "MIMM" => PlaceholderKind::MemOffset,
                    "MEM" => PlaceholderKind::MemBase,
                    _ => PlaceholderKind::Divisor,
                }
            }
            "REG" => {
                if elems.len() != 4 {
                    return Err(bad(body, "expected REG:<RW flags>:<category>:<width>"));
                }
                let flags = elems[1];
                if flags.is_empty()
                    || flags.len() > 2
                    || !flags.chars().all(|c| c == 'R' || c == 'W')
                    || (flags.len() == 2 && flags.chars().nth(0) == flags.chars().nth(1))
                {
                    return Err(bad(body, "RW flags must be a non-empty subset of {R,W}"));
                }
                PlaceholderKind::Register {
                    category: elems[2].to_owned(),
                    is_reading: flags.contains('R'),
                    is_writing: flags.contains('W'),
                }
            }
            other => return Err(bad(body, format!("unknown placeholder kind {other:?}"))),
        };
        Ok(Placeholder {
            idx,
            kind,
            width: elems[elems.len() - 1].to_owned(),
        })
    }

    pub fn is_writing(&self) -> bool {
        matches!(
            self.kind,
            PlaceholderKind::Register {
                is_writing: true,
                ..
            }
        )
    }

    pub fn is_reading(&self) -> bool {
        matches!(
            self.kind,
            PlaceholderKind::Register {
                is_reading: true,
                ..
            }
        )
    }

    pub fn is_register(&self) -> bool {
        matches!(self.kind, PlaceholderKind::Register { .. })
    }

    pub fn reg_category(&self) -> Option<&str> {
        match &self.kind {
            PlaceholderKind::Register { category, .. } => Some(category),
            _ => None,
        }
    }
}

/// A parsed instruction template. The template string doubles as the
/// instruction's identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsnForm {
    text: String,
    placeholders: Vec<Placeholder>,
}

impl InsnForm {
    pub fn parse(text: &str) -> Result<Self, FormError> {
        let placeholders = placeholder_re()
            .captures_iter(text)
            .enumerate()
            .map(|(idx, caps)| Placeholder::parse(idx, caps.get(1).expect("group 1 exists").as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InsnForm {
            text: text.to_owned(),
            placeholders,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    pub fn instantiate(&self) -> InsnInstance<'_> {
        InsnInstance {
            form: self,
            operands: vec![None; self.placeholders.len()],
        }
    }
}

/// One concrete occurrence of an instruction form inside a benchmark loop.
#[derive(Debug, Clone)]
pub struct InsnInstance<'a> {
    form: &'a InsnForm,
    operands: Vec<Option<String>>,
}

impl<'a> InsnInstance<'a> {
    pub fn form(&self) -> &'a InsnForm {
        self.form
    }

    pub fn assign(&mut self, idx: usize, operand: String) {
        self.operands[idx] = Some(operand);
    }

    /// Substitutes every placeholder, left to right, with its operand.
    pub fn render(&self) -> Result<String, FormError> {
        let mut next = 0usize;
        let mut missing = None;
        let rendered = placeholder_re().replace_all(&self.form.text, |_: &regex::Captures| {
            let idx = next;
            next += 1;
            match &self.operands[idx] {
                Some(op) => op.clone(),
                None => {
                    missing.get_or_insert(idx);
                    String::new()
                }
            }
        });
        match missing {
            Some(idx) => Err(FormError::UnassignedOperand {
                idx,
                form: self.form.text.clone(),
            }),
            None => Ok(rendered.into_owned()),
        }
    }

    /// The rendered instruction as a C string literal line for the inline
    /// assembly block.
    pub fn code_line(&self) -> Result<String, FormError> {
        Ok(format!("        \"{}\\n\"", self.render()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_placeholder_template() {
        let form = InsnForm::parse("add ((REG:W:G:64)), ((REG:R:G:64)), ((IMM:8))").unwrap();
        let phs = form.placeholders();
        assert_eq!(phs.len(), 3);

        assert_eq!(phs[0].idx, 0);
        assert!(phs[0].is_writing() && !phs[0].is_reading());
        assert_eq!(phs[0].reg_category(), Some("G"));
        assert_eq!(phs[0].width, "64");

        assert_eq!(phs[1].idx, 1);
        assert!(!phs[1].is_writing() && phs[1].is_reading());

        assert_eq!(phs[2].idx, 2);
        assert_eq!(phs[2].kind, PlaceholderKind::Immediate);
        assert_eq!(phs[2].width, "8");
    }

    #[test]
    fn rw_marks_both_directions() {
        let form = InsnForm::parse("inc ((REG:RW:G:64))").unwrap();
        let ph = &form.placeholders()[0];
        assert!(ph.is_writing() && ph.is_reading());
    }

    #[test]
    fn memory_and_divisor_kinds() {
        let form =
            InsnForm::parse("mov ((REG:W:G:32)), dword ptr [((MEM:64)) + ((MIMM:8))]").unwrap();
        assert_eq!(form.placeholders()[1].kind, PlaceholderKind::MemBase);
        assert_eq!(form.placeholders()[2].kind, PlaceholderKind::MemOffset);
        let form = InsnForm::parse("div ((DIV:64))").unwrap();
        assert_eq!(form.placeholders()[0].kind, PlaceholderKind::Divisor);
    }

    #[test]
    fn malformed_placeholders_are_rejected() {
        for bad_template in [
            "add ((FOO:64))",
            "add ((IMM:8:9))",
            "add ((REG:G:64))",
            "add ((REG::G:64))",
            "add ((REG:RWX:G:64))",
            "add ((REG:RR:G:64))",
        ] {
            assert!(
                matches!(
                    InsnForm::parse(bad_template),
                    Err(FormError::BadPlaceholder { .. })
                ),
                "{bad_template} should not parse"
            );
        }
    }

    #[test]
    fn templates_without_placeholders_are_fine() {
        let form = InsnForm::parse("nop").unwrap();
        assert!(form.placeholders().is_empty());
        assert_eq!(form.instantiate().render().unwrap(), "nop");
    }

    #[test]
    fn rendering_replaces_left_to_right() {
        let form = InsnForm::parse("add ((REG:W:G:64)), ((REG:R:G:64)), ((IMM:8))").unwrap();
        let mut inst = form.instantiate();
        inst.assign(0, "rbx".to_owned());
        inst.assign(1, "rsi".to_owned());
        inst.assign(2, "44".to_owned());
        let rendered = inst.render().unwrap();
        assert_eq!(rendered, "add rbx, rsi, 44");
        assert!(!rendered.contains("((") && !rendered.contains("))"));
        assert_eq!(inst.code_line().unwrap(), "        \"add rbx, rsi, 44\\n\"");
    }

    #[test]
    fn unassigned_operands_fail_rendering() {
        let form = InsnForm::parse("add ((REG:W:G:64)), ((IMM:8))").unwrap();
        let mut inst = form.instantiate();
        inst.assign(0, "rbx".to_owned());
        assert_eq!(
            inst.render(),
            Err(FormError::UnassignedOperand {
                idx: 1,
                form: form.text().to_owned()
            })
        );
    }
}
