//! Parser for the JIR text format.

use super::*;

/// Parse `text` into a verified module.
pub fn parse_module(default_name: &str, text: &str) -> JitResult<Module> {
    Parser::new(default_name, text).parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    module: Module,

    // Per-function maps
    blocks: HashMap<&'a str, BlockId>,
    block_bodies: Vec<Option<Block>>,
    block_names: Vec<&'a str>,
    values: HashMap<&'a str, ValueId>,
    value_names: Vec<String>,
    defined_values: HashSet<ValueId>,
    value_resolves: Vec<Resolve<'a>>,
}

/// A value used before its definition.
#[derive(Debug)]
struct Resolve<'a> {
    name: &'a str,
    line: usize,
    value: ValueId,
}

impl<'a> Parser<'a> {
    fn new(default_name: &str, text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            module: Module::new(default_name),
            blocks: HashMap::new(),
            block_bodies: Vec::new(),
            block_names: Vec::new(),
            values: HashMap::new(),
            value_names: Vec::new(),
            defined_values: HashSet::new(),
            value_resolves: Vec::new(),
        }
    }

    fn parse(mut self) -> JitResult<Module> {
        self.skip_whitespace();

        while !self.is_eof() {
            let keyword = self.read_identifier()?;
            match keyword {
                "module" => {
                    let name = self.read_identifier()?;
                    self.module.set_name(name);
                }
                "global" => self.parse_global()?,
                "extern" => {
                    let name = self.read_identifier()?;
                    self.module.declare_external(name);
                }
                "define" => self.parse_function()?,
                other => return Err(self.error(format!("unexpected `{other}` at top level"))),
            }
            self.skip_whitespace();
        }

        log::trace!(
            "parsed module `{}`: {} function(s), {} global(s)",
            self.module.name(),
            self.module.functions().len(),
            self.module.globals().len()
        );

        self.module.verify()?;
        Ok(self.module)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn line(&self) -> usize {
        self.text[..self.pos].matches('\n').count() + 1
    }

    fn error(&self, message: impl Into<String>) -> JitError {
        JitError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Skip comment line
                while let Some(ch) = self.current_char() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Skip blanks without leaving the current line.
    fn skip_blanks(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ' ' || ch == '\t' || ch == '\r' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.current_char()
    }

    fn try_read(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> JitResult<()> {
        if !self.try_read(ch) {
            let found = match self.current_char() {
                Some(c) => format!("'{c}'"),
                None => "end of input".to_string(),
            };
            return Err(self.error(format!("expected '{ch}' but found {found}")));
        }
        Ok(())
    }

    fn read_identifier(&mut self) -> JitResult<&'a str> {
        self.skip_whitespace();
        let start = self.pos;

        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' || ch == '.' => {}
            Some(ch) => return Err(self.error(format!("expected identifier but found '{ch}'"))),
            None => return Err(self.error("expected identifier but found end of input")),
        }

        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '$' {
                self.advance();
            } else {
                break;
            }
        }

        Ok(&self.text[start..self.pos])
    }

    fn read_number(&mut self) -> JitResult<i64> {
        self.skip_whitespace();
        let negative = self.current_char() == Some('-');
        if negative {
            self.advance();
        }

        let is_hex = self.text[self.pos..].starts_with("0x") || self.text[self.pos..].starts_with("0X");
        if is_hex {
            self.pos += 2;
        }

        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if (is_hex && ch.is_ascii_hexdigit()) || ch.is_ascii_digit() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let digits: String = self.text[start..self.pos].chars().filter(|&c| c != '_').collect();
        if digits.is_empty() {
            return Err(self.error("expected number"));
        }

        let magnitude = if is_hex {
            u64::from_str_radix(&digits, 16).map(|v| v as i64)
        } else {
            digits.parse::<u64>().map(|v| v as i64)
        }
        .map_err(|e| self.error(format!("invalid number `{digits}`: {e}")))?;

        Ok(if negative { magnitude.wrapping_neg() } else { magnitude })
    }

    fn read_symbol_ref(&mut self) -> JitResult<&'a str> {
        self.expect('@')?;
        self.read_identifier()
    }

    fn read_block_ref(&mut self) -> JitResult<BlockId> {
        self.expect('^')?;
        let name = self.read_identifier()?;
        Ok(self.block_id(name))
    }

    /// Optional `hidden` marker before a definition name. A symbol may itself
    /// be called `hidden`, in which case `terminator` directly follows it.
    fn read_linkage_and_name(&mut self, terminator: char) -> JitResult<(Linkage, &'a str)> {
        let first = self.read_identifier()?;
        if first == "hidden" && self.peek() != Some(terminator) {
            let name = self.read_identifier()?;
            Ok((Linkage::Hidden, name))
        } else {
            Ok((Linkage::Exported, first))
        }
    }

    fn parse_global(&mut self) -> JitResult<()> {
        let (linkage, name) = self.read_linkage_and_name('=')?;
        self.expect('=')?;
        let init = self.read_number()?;
        self.module.add_global(Global {
            name: name.to_string(),
            linkage,
            init,
        });
        Ok(())
    }

    fn block_id(&mut self, name: &'a str) -> BlockId {
        if let Some(&id) = self.blocks.get(name) {
            return id;
        }
        let id = BlockId(self.block_bodies.len() as u32);
        self.blocks.insert(name, id);
        self.block_bodies.push(None);
        self.block_names.push(name);
        id
    }

    fn new_value(&mut self, name: &'a str) -> ValueId {
        let id = ValueId(self.value_names.len() as u32);
        self.values.insert(name, id);
        self.value_names.push(name.to_string());
        id
    }

    fn define_value(&mut self, name: &'a str) -> JitResult<ValueId> {
        let id = match self.values.get(name) {
            Some(&id) if self.defined_values.contains(&id) => {
                return Err(self.error(format!("value %{name} is defined twice")));
            }
            Some(&id) => id,
            None => self.new_value(name),
        };
        self.defined_values.insert(id);
        Ok(id)
    }

    fn use_value(&mut self, name: &'a str) -> ValueId {
        if let Some(&id) = self.values.get(name) {
            return id;
        }
        let value = self.new_value(name);
        self.value_resolves.push(Resolve {
            name,
            line: self.line(),
            value,
        });
        value
    }

    fn read_operand(&mut self) -> JitResult<Operand> {
        match self.peek() {
            Some('%') => {
                self.advance();
                let name = self.read_identifier()?;
                Ok(Operand::Value(self.use_value(name)))
            }
            Some(ch) if ch == '-' || ch.is_ascii_digit() => {
                let value = self.read_number()?;
                Ok(Operand::Const(self.module.context_mut().intern_const(value)))
            }
            Some(ch) => Err(self.error(format!("expected operand but found '{ch}'"))),
            None => Err(self.error("expected operand but found end of input")),
        }
    }

    fn read_operand_pair(&mut self) -> JitResult<(Operand, Operand)> {
        let lhs = self.read_operand()?;
        self.expect(',')?;
        let rhs = self.read_operand()?;
        Ok((lhs, rhs))
    }

    fn parse_function(&mut self) -> JitResult<()> {
        self.blocks.clear();
        self.block_bodies.clear();
        self.block_names.clear();
        self.values.clear();
        self.value_names.clear();
        self.defined_values.clear();
        self.value_resolves.clear();

        let (linkage, name) = self.read_linkage_and_name('(')?;
        let name = name.to_string();

        self.expect('(')?;
        let mut params = Vec::new();
        if !self.try_read(')') {
            loop {
                self.expect('%')?;
                let param = self.read_identifier()?;
                params.push(self.define_value(param)?);
                if self.try_read(',') {
                    continue;
                }
                self.expect(')')?;
                break;
            }
        }

        self.expect('{')?;
        while !self.try_read('}') {
            if self.is_eof() {
                return Err(self.error(format!("unterminated body of `{name}`")));
            }
            self.parse_block()?;
        }

        for resolve in &self.value_resolves {
            if !self.defined_values.contains(&resolve.value) {
                return Err(JitError::Parse {
                    line: resolve.line,
                    message: format!("use of undefined value %{}", resolve.name),
                });
            }
        }

        let bodies = std::mem::take(&mut self.block_bodies);
        let mut blocks = Vec::with_capacity(bodies.len());
        for (idx, body) in bodies.into_iter().enumerate() {
            match body {
                Some(block) => blocks.push(block),
                None => {
                    return Err(self.error(format!(
                        "`{}` references undefined block ^{}",
                        name, self.block_names[idx]
                    )))
                }
            }
        }

        self.module.add_function(Function {
            name,
            linkage,
            params,
            value_names: std::mem::take(&mut self.value_names),
            blocks,
        });
        Ok(())
    }

    fn parse_block(&mut self) -> JitResult<()> {
        let label = self.read_identifier()?;
        self.expect(':')?;
        let id = self.block_id(label);
        if self.block_bodies[id.0 as usize].is_some() {
            return Err(self.error(format!("block `{label}` is defined twice")));
        }

        let mut insts = Vec::new();
        loop {
            if self.peek() == Some('}') || self.is_eof() {
                return Err(self.error(format!("block `{label}` does not end with a terminator")));
            }
            let inst = self.parse_instruction(label)?;
            let done = inst.kind.is_terminator();
            insts.push(inst);
            if done {
                break;
            }
        }

        self.block_bodies[id.0 as usize] = Some(Block {
            name: label.to_string(),
            insts,
        });
        Ok(())
    }

    fn parse_instruction(&mut self, block: &str) -> JitResult<Inst> {
        if self.try_read('%') {
            let name = self.read_identifier()?;
            self.expect('=')?;
            let result = self.define_value(name)?;
            let opcode = self.read_identifier()?;
            let kind = self.parse_value_instruction(opcode)?;
            return Ok(Inst {
                result: Some(result),
                kind,
            });
        }

        let opcode = self.read_identifier()?;
        if self.peek() == Some(':') {
            return Err(self.error(format!("block `{block}` does not end with a terminator")));
        }

        let kind = match opcode {
            "ret" => {
                self.skip_blanks();
                match self.current_char() {
                    Some(ch) if ch == '%' || ch == '-' || ch.is_ascii_digit() => {
                        InstKind::Ret(Some(self.read_operand()?))
                    }
                    _ => InstKind::Ret(None),
                }
            }
            "br" => InstKind::Br(self.read_block_ref()?),
            "condbr" => {
                let cond = self.read_operand()?;
                self.expect(',')?;
                let then_block = self.read_block_ref()?;
                self.expect(',')?;
                let else_block = self.read_block_ref()?;
                InstKind::CondBr {
                    cond,
                    then_block,
                    else_block,
                }
            }
            "store" => {
                let global = self.read_symbol_ref()?.to_string();
                self.expect(',')?;
                let value = self.read_operand()?;
                InstKind::Store { global, value }
            }
            "call" => self.parse_call()?,
            other => return Err(self.error(format!("unknown instruction `{other}`"))),
        };
        Ok(Inst { result: None, kind })
    }

    fn parse_value_instruction(&mut self, opcode: &str) -> JitResult<InstKind> {
        if let Some(op) = BinaryOp::from_name(opcode) {
            let (lhs, rhs) = self.read_operand_pair()?;
            return Ok(InstKind::Binary { op, lhs, rhs });
        }

        let kind = match opcode {
            "icmp" => {
                let pred_name = self.read_identifier()?;
                let pred = IntPredicate::from_name(pred_name)
                    .ok_or_else(|| self.error(format!("unknown predicate `{pred_name}`")))?;
                let (lhs, rhs) = self.read_operand_pair()?;
                InstKind::Icmp { pred, lhs, rhs }
            }
            "copy" => InstKind::Copy(self.read_operand()?),
            "call" => self.parse_call()?,
            "load" => InstKind::Load {
                global: self.read_symbol_ref()?.to_string(),
            },
            "addr" => InstKind::AddrOf {
                symbol: self.read_symbol_ref()?.to_string(),
            },
            "phi" => {
                let mut incoming = Vec::new();
                loop {
                    self.expect('[')?;
                    let value = self.read_operand()?;
                    self.expect(',')?;
                    let pred = self.read_block_ref()?;
                    self.expect(']')?;
                    incoming.push((value, pred));
                    if !self.try_read(',') {
                        break;
                    }
                }
                InstKind::Phi { incoming }
            }
            other => return Err(self.error(format!("`{other}` does not produce a value"))),
        };
        Ok(kind)
    }

    fn parse_call(&mut self) -> JitResult<InstKind> {
        let callee = self.read_symbol_ref()?.to_string();
        self.expect('(')?;
        let mut args = Vec::new();
        if !self.try_read(')') {
            loop {
                args.push(self.read_operand()?);
                if self.try_read(',') {
                    continue;
                }
                self.expect(')')?;
                break;
            }
        }
        Ok(InstKind::Call { callee, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_function() {
        let ir = r#"
; multiply two numbers
module arith
define mul(%a, %b) {
entry:
    %r = mul %a, %b
    ret %r
}
"#;
        let module = parse_module("fallback", ir).unwrap();
        assert_eq!(module.name(), "arith");
        assert_eq!(module.functions().len(), 1);

        let func = &module.functions()[0];
        assert_eq!(func.name, "mul");
        assert_eq!(func.params, vec![ValueId(0), ValueId(1)]);
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(
            func.blocks[0].insts[0].kind,
            InstKind::Binary {
                op: BinaryOp::Mul,
                lhs: Operand::Value(ValueId(0)),
                rhs: Operand::Value(ValueId(1)),
            }
        );
    }

    #[test]
    fn test_forward_references_in_loop() {
        let ir = r#"
define count(%n) {
entry:
    br ^loop
loop:
    %i = phi [0, ^entry], [%next, ^loop]
    %next = add %i, 1
    %done = icmp sge %next, %n
    condbr %done, ^exit, ^loop
exit:
    ret %next
}
"#;
        let module = parse_module("m", ir).unwrap();
        let func = &module.functions()[0];
        assert_eq!(func.blocks.len(), 3);
        assert_eq!(func.blocks[1].name, "loop");

        let InstKind::Phi { incoming } = &func.blocks[1].insts[0].kind else {
            panic!("expected phi");
        };
        let next = func.value_names.iter().position(|n| n == "next").unwrap();
        assert_eq!(incoming[1], (Operand::Value(ValueId(next as u32)), BlockId(1)));
    }

    #[test]
    fn test_constants_and_externals() {
        let ir = r#"
extern puts
global hidden limit = 0x10
define hidden(%x) {
entry:
    %a = add %x, -3
    %b = call @puts(%a)
    ret
}
"#;
        let module = parse_module("m", ir).unwrap();
        assert_eq!(module.globals()[0].init, 16);
        assert_eq!(module.globals()[0].linkage, Linkage::Hidden);
        assert_eq!(module.functions()[0].name, "hidden");
        assert_eq!(module.functions()[0].linkage, Linkage::Exported);
        assert_eq!(module.context().constant(ConstId(0)), -3);
        assert_eq!(module.external_references(), vec!["puts".to_string()]);
    }

    #[test]
    fn test_undefined_value_reports_line() {
        let ir = "define f() {\nentry:\n    %x = add %y, 1\n    ret %x\n}\n";
        let err = parse_module("m", ir).unwrap_err();
        assert_eq!(
            err,
            JitError::Parse {
                line: 3,
                message: "use of undefined value %y".to_string()
            }
        );
    }

    #[test]
    fn test_undefined_block() {
        let ir = "define f() {\nentry:\n    br ^nowhere\n}\n";
        let err = parse_module("m", ir).unwrap_err();
        assert!(err.to_string().contains("^nowhere"));
    }

    #[test]
    fn test_missing_terminator() {
        let ir = "define f() {\nentry:\n    %x = add 1, 2\nnext:\n    ret %x\n}\n";
        let err = parse_module("m", ir).unwrap_err();
        assert!(err.to_string().contains("does not end with a terminator"));
    }

    #[test]
    fn test_duplicate_value_definition() {
        let ir = "define f(%a) {\nentry:\n    %a = add 1, 2\n    ret %a\n}\n";
        assert!(matches!(parse_module("m", ir), Err(JitError::Parse { .. })));
    }

    #[test]
    fn test_too_many_params_fails_verification() {
        let ir = "define f(%a, %b, %c, %d, %e, %f, %g) {\nentry:\n    ret %a\n}\n";
        assert!(matches!(
            parse_module("m", ir),
            Err(JitError::InvalidModule { .. })
        ));
    }
}
