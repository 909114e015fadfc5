//! Listing parser.

use crate::core::{ScheduleResult, SchedulerError};
use crate::machine::{Guard, Machine, RegisterRef};
use crate::program::{BasicBlock, FuTerminal, Move, Procedure, Terminal};
use hashbrown::HashMap;

/// Parse every procedure of `text` against `machine`.
pub fn parse_listing(text: &str, machine: &Machine) -> ScheduleResult<Vec<Procedure>> {
    let mut parser = Parser::new(text, machine);
    parser
        .parse()
        .map_err(|reason| SchedulerError::Listing {
            line: parser.line,
            reason,
        })
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
    machine: &'a Machine,
}

/// A block address waiting for its label to be defined.
#[derive(Debug)]
struct Resolve<'a> {
    label: &'a str,
    block: usize,
    instruction: usize,
    slot: usize,
    source: bool,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str, machine: &'a Machine) -> Self {
        Self {
            text,
            pos: 0,
            line: 1,
            machine,
        }
    }

    fn parse(&mut self) -> Result<Vec<Procedure>, String> {
        let mut procedures = Vec::new();
        self.skip_whitespace(true);
        while !self.is_eof() {
            let procedure = self.parse_procedure()?;
            if procedures.iter().any(|p: &Procedure| p.name == procedure.name) {
                return Err(format!("Duplicate procedure '{}'", procedure.name));
            }
            log::debug!(
                "Parsed procedure {} with {} blocks",
                procedure.name,
                procedure.blocks.len()
            );
            procedures.push(procedure);
            self.skip_whitespace(true);
        }
        Ok(procedures)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            if ch == '\n' {
                self.line += 1;
            }
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Skip blanks on the current line only.
    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), String> {
        if !self.try_read(ch) {
            return Err(format!("Expected '{}' but found {:?}", ch, self.current_char()));
        }
        Ok(())
    }

    fn expect_line_end(&mut self) -> Result<(), String> {
        self.skip_whitespace(false);
        match self.current_char() {
            None => Ok(()),
            Some('\n') => {
                self.advance();
                Ok(())
            }
            Some(ch) => Err(format!("Unexpected '{}' at end of line", ch)),
        }
    }

    fn read_identifier(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace(false);
        let start = self.pos;
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            Some(ch) => return Err(format!("Expected identifier but found '{}'", ch)),
            None => return Err("Expected identifier but found EOF".to_string()),
        }
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    /// Signed decimal or `0x` hex number.
    fn read_number(&mut self) -> Result<i64, String> {
        self.skip_whitespace(false);
        let negative = self.current_char() == Some('-');
        if negative {
            self.advance();
        }
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() {
                self.advance();
            } else {
                break;
            }
        }
        let digits = &self.text[start..self.pos];
        let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            Some(hex) => i64::from_str_radix(hex, 16),
            None => digits.parse(),
        }
        .map_err(|e| format!("Invalid number '{}': {}", digits, e))?;
        Ok(if negative { -value } else { value })
    }

    fn read_index<T: TryFrom<i64>>(&mut self, what: &str) -> Result<T, String> {
        let value = self.read_number()?;
        T::try_from(value).map_err(|_| format!("{} {} out of range", what, value))
    }

    fn parse_procedure(&mut self) -> Result<Procedure, String> {
        let keyword = self.read_identifier()?;
        if keyword != "proc" {
            return Err(format!("Expected 'proc' but found '{}'", keyword));
        }
        let name = self.read_identifier()?;
        self.expect('{')?;
        self.expect_line_end()?;

        let mut procedure = Procedure {
            name: name.to_string(),
            blocks: Vec::new(),
        };
        let mut labels: HashMap<&'a str, usize> = HashMap::new();
        let mut resolves: Vec<Resolve<'a>> = Vec::new();

        loop {
            self.skip_whitespace(true);
            match self.current_char() {
                None => return Err(format!("Unterminated procedure '{}'", name)),
                Some('}') => {
                    self.advance();
                    break;
                }
                _ => {}
            }
            if let Some(label) = self.try_label() {
                if labels.insert(label, procedure.blocks.len()).is_some() {
                    return Err(format!("Duplicate block label '{}'", label));
                }
                let mut block = BasicBlock::new(label);
                let saved = self.pos;
                match self.read_identifier() {
                    Ok("loop") => block.is_loop = true,
                    _ => self.pos = saved,
                }
                self.expect_line_end()?;
                procedure.blocks.push(block);
                continue;
            }
            let Some(block) = procedure.blocks.len().checked_sub(1) else {
                return Err("Moves before the first block label".to_string());
            };
            let instruction = procedure.blocks[block].instructions.len();
            let moves = self.parse_instruction(block, instruction, &mut resolves)?;
            procedure.blocks[block].instructions.push(moves);
        }

        for resolve in resolves {
            let Some(index) = labels.get(resolve.label).copied() else {
                self.line = resolve.line;
                return Err(format!("Unknown block label '{}'", resolve.label));
            };
            let mv = &mut procedure.blocks[resolve.block].instructions[resolve.instruction][resolve.slot];
            let terminal = Terminal::InstructionAddress(index as u32);
            if resolve.source {
                mv.source = terminal;
            } else {
                mv.destination = terminal;
            }
        }
        Ok(procedure)
    }

    /// `label:` at the start of a line; the position is restored otherwise.
    fn try_label(&mut self) -> Option<&'a str> {
        let saved = self.pos;
        if let Ok(name) = self.read_identifier() {
            if self.current_char() == Some(':') {
                self.advance();
                return Some(name);
            }
        }
        self.pos = saved;
        None
    }

    fn parse_instruction(
        &mut self,
        block: usize,
        instruction: usize,
        resolves: &mut Vec<Resolve<'a>>,
    ) -> Result<Vec<Move>, String> {
        let mut moves = Vec::new();
        loop {
            let guard = self.parse_guard()?;
            let (source, source_label) = self.parse_terminal()?;
            self.expect('-')?;
            self.expect('>')?;
            let (destination, destination_label) = self.parse_terminal()?;
            if matches!(
                destination,
                Terminal::Immediate(_) | Terminal::InstructionAddress(_) | Terminal::Address(_)
            ) {
                return Err("Move writes a constant".to_string());
            }
            for (label, source) in [(source_label, true), (destination_label, false)] {
                if let Some(label) = label {
                    resolves.push(Resolve {
                        label,
                        block,
                        instruction,
                        slot: moves.len(),
                        source,
                        line: self.line,
                    });
                }
            }
            moves.push(Move::guarded(source, destination, guard));
            if !self.try_read(',') {
                break;
            }
        }
        self.expect_line_end()?;
        Ok(moves)
    }

    fn parse_guard(&mut self) -> Result<Guard, String> {
        self.skip_whitespace(false);
        let inverted = match self.current_char() {
            Some('?') => false,
            Some('!') => true,
            _ => return Ok(Guard::Unconditional),
        };
        self.advance();
        match self.parse_terminal()? {
            (Terminal::Register(reg), None) => Ok(Guard::Register { reg, inverted }),
            _ => Err("Guards must name a register".to_string()),
        }
    }

    /// A terminal, plus the label of an `@label` address still to be resolved.
    fn parse_terminal(&mut self) -> Result<(Terminal, Option<&'a str>), String> {
        self.skip_whitespace(false);
        match self.current_char() {
            Some('#') => {
                self.advance();
                Ok((Terminal::Immediate(self.read_number()?), None))
            }
            Some('&') => {
                self.advance();
                Ok((Terminal::Address(self.read_number()?), None))
            }
            Some('@') => {
                self.advance();
                let label = self.read_identifier()?;
                Ok((Terminal::InstructionAddress(0), Some(label)))
            }
            _ => {
                let first = self.read_identifier()?;
                if first == "ra" && self.current_char() != Some('.') {
                    return Ok((Terminal::ReturnAddress, None));
                }
                self.expect_dot()?;
                Ok((self.parse_dotted(first)?, None))
            }
        }
    }

    fn expect_dot(&mut self) -> Result<(), String> {
        if self.current_char() != Some('.') {
            return Err(format!("Expected '.' but found {:?}", self.current_char()));
        }
        self.advance();
        Ok(())
    }

    /// `RF.i`, `IU.i`, `op.k` or `FU.op.k`, with the first name and dot consumed.
    fn parse_dotted(&mut self, first: &'a str) -> Result<Terminal, String> {
        let m = self.machine;
        if let Some(rf) = m.rf_by_name(first) {
            let index: u16 = self.read_index("Register index")?;
            if index >= m.register_file(rf).size {
                return Err(format!("{}.{} is out of range", first, index));
            }
            return Ok(Terminal::Register(RegisterRef::new(rf, index)));
        }
        if let Some(iu) = m.iu_by_name(first) {
            let index: u16 = self.read_index("Immediate register index")?;
            if index >= m.immediate_unit(iu).registers {
                return Err(format!("{}.{} is out of range", first, index));
            }
            return Ok(Terminal::ImmediateRegister { iu, index });
        }
        if let Some(fu) = m.fu_by_name(first) {
            let op_name = self.read_identifier()?;
            self.expect_dot()?;
            let mut terminal = self.operand(op_name)?;
            let Terminal::FuPort(ft) = &mut terminal else {
                return Err(format!("{}.{} is not an operand", first, op_name));
            };
            if !m.function_unit(fu).supports(ft.operation) {
                return Err(format!("{} does not implement {}", first, op_name));
            }
            ft.unit = Some(fu);
            return Ok(terminal);
        }
        self.operand(first)
    }

    fn operand(&mut self, op_name: &str) -> Result<Terminal, String> {
        let operation = self
            .machine
            .operation_by_name(op_name)
            .ok_or_else(|| format!("Unknown unit, register file or operation '{}'", op_name))?;
        let operand: u8 = self.read_index("Operand")?;
        let info = self.machine.operation(operation);
        if operand == 0 || operand > info.inputs + info.outputs {
            return Err(format!("{} has no operand {}", op_name, operand));
        }
        Ok(Terminal::FuPort(FuTerminal {
            operation,
            operand,
            unit: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::presets;

    #[test]
    fn test_parse_blocks_and_moves() {
        let m = presets::minimal().unwrap();
        let text = r#"
; two blocks
proc main {
entry:
    #5 -> RF.1
    RF.1 -> add.1, RF.2 -> add.2   ; one instruction
    ?BOOL.0 add.3 -> RF.3
body: loop
    !BOOL.1 @body -> jump.1
}
"#;
        let procs = parse_listing(text, &m).unwrap();
        assert_eq!(procs.len(), 1);
        let p = &procs[0];
        assert_eq!(p.name, "main");
        assert_eq!(p.blocks.len(), 2);
        assert_eq!(p.blocks[0].label, "entry");
        assert!(!p.blocks[0].is_loop);
        assert!(p.blocks[1].is_loop);
        assert_eq!(p.blocks[0].instructions.len(), 3);
        assert_eq!(p.blocks[0].instructions[1].len(), 2);
        assert_eq!(p.blocks[0].instructions[0][0].source, Terminal::Immediate(5));

        let guarded = p.blocks[0].instructions[2][0];
        assert_eq!(
            guarded.guard,
            Guard::Register {
                reg: RegisterRef::new(m.rf_by_name("BOOL").unwrap(), 0),
                inverted: false
            }
        );
        let jump = p.blocks[1].instructions[0][0];
        assert_eq!(jump.source, Terminal::InstructionAddress(1));
        assert!(jump.guard.is_inverted());
    }

    #[test]
    fn test_forward_label_and_terminal_kinds() {
        let m = presets::minimal().unwrap();
        let text = r#"
proc f {
a:
    @b -> jump.1
b:
    ra -> RF.1
    &-16 -> ldw.1
    #0x10 -> RF.2
    ALU.add.3 -> RF.4
}
"#;
        let procs = parse_listing(text, &m).unwrap();
        let blocks = &procs[0].blocks;
        assert_eq!(blocks[0].instructions[0][0].source, Terminal::InstructionAddress(1));
        assert_eq!(blocks[1].instructions[0][0].source, Terminal::ReturnAddress);
        assert_eq!(blocks[1].instructions[1][0].source, Terminal::Address(-16));
        assert_eq!(blocks[1].instructions[2][0].source, Terminal::Immediate(16));
        let bound = blocks[1].instructions[3][0].source.fu_terminal().copied().unwrap();
        assert_eq!(bound.unit, m.fu_by_name("ALU"));
        assert_eq!(bound.operand, 3);
    }

    #[test]
    fn test_errors_carry_line() {
        let m = presets::minimal().unwrap();
        let cases = [
            ("proc p {\nentry:\n    RF.99 -> RF.1\n}\n", 3),
            ("proc p {\n    RF.1 -> RF.2\n}\n", 2),
            ("proc p {\nentry:\n    RF.1 -> nosuch.1\n}\n", 3),
            ("proc p {\nentry:\n    @nowhere -> jump.1\n}\n", 3),
            ("proc p {\nentry:\n    RF.1 -> #3\n}\n", 3),
            ("proc p {\nentry:\n    RF.1 -> add.4\n}\n", 3),
        ];
        for (text, line) in cases {
            match parse_listing(text, &m) {
                Err(SchedulerError::Listing { line: l, .. }) => assert_eq!(l, line, "{}", text),
                other => panic!("expected a listing error for {:?}, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let m = presets::minimal().unwrap();
        let text = "proc p {\na:\na:\n}\n";
        assert!(parse_listing(text, &m).is_err());
    }
}
