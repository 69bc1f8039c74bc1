// File: src/compiler.rs
//
// Single-pass Pratt compiler: parses and emits bytecode in the same pass,
// no AST (spec §4.2, §9 "single-pass compilation"). Two cooperating types:
// `Parser<'src>` owns the token cursor and is recreated fresh for each
// source file (including imported ones); `Compiler` owns the lexically
// scoped, lifetime-free state (locals, upvalues, class context, the
// import cycle stack) that must survive across an `import` boundary.
// Splitting it this way sidesteps a self-referential-struct problem that
// would otherwise show up the moment an imported file needs its own
// `Scanner` while semantic state from the importing file stays live.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::chunk::OpCode;
use crate::lexer::{Scanner, Token, TokenKind};
use crate::value::{GcRef, ObjData, ObjFunction, UpvalueDesc, Value};
use crate::vm::Vm;

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment,
    Conditional,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Conditional,
            Precedence::Conditional => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

fn has_prefix(kind: TokenKind) -> bool {
    use TokenKind::*;
    matches!(
        kind,
        LeftParen | Minus | Bang | Number | String | True | False | Nil | Identifier | This
            | Super
            | LeftBracket
    )
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        LeftParen | Dot | LeftBracket => Precedence::Call,
        Minus | Plus => Precedence::Term,
        Slash | Star => Precedence::Factor,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        DotDot => Precedence::Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        Question => Precedence::Conditional,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct LocalVar {
    name: String,
    /// -1 while the initializer is still being compiled (read-before-init
    /// is a compile error, spec §4.2).
    depth: i32,
    is_captured: bool,
    is_const: bool,
}

struct LoopCtx {
    loop_start: usize,
    scope_depth: usize,
    break_jumps: Vec<usize>,
}

struct ClassState {
    has_superclass: bool,
}

struct FuncState {
    function: GcRef,
    function_type: FunctionType,
    locals: Vec<LocalVar>,
    scope_depth: usize,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopCtx>,
}

impl FuncState {
    fn new(function_type: FunctionType, function: GcRef) -> Self {
        // Slot 0 is reserved: the receiver for methods, an unnameable
        // placeholder otherwise. Never assigned by user code either way.
        let receiver_name =
            if matches!(function_type, FunctionType::Method | FunctionType::Initializer) {
                "this"
            } else {
                ""
            };
        FuncState {
            function,
            function_type,
            locals: vec![LocalVar {
                name: receiver_name.to_string(),
                depth: 0,
                is_captured: false,
                is_const: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }
}

enum VarTarget {
    Local,
    Global(u16),
}

/// Token cursor over one source file. Recreated per imported file; never
/// stored anywhere longer-lived than the grammar function that needs it.
struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        let scanner = Scanner::new(source);
        // `current`/`previous` are placeholders only: nothing reads them
        // before the caller's first `advance()` scans the real leading
        // token into `current` (cpplox's `compiler.cpp` primes the parser
        // the same way, in `compile()` rather than here).
        let placeholder = Token { kind: TokenKind::Error, lexeme: "", line: 0 };
        Parser { scanner, current: placeholder, previous: placeholder, had_error: false, panic_mode: false }
    }

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    /// `[line N] Error<at X>: message` (spec.md §7), printed directly
    /// rather than through `errors::RuffError` — the literal format is
    /// part of the contract and the fancier colored Display is reserved
    /// for runtime errors.
    fn error_at(&mut self, token: Token<'_>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        match token.kind {
            TokenKind::Eof => eprintln!("[line {}] Error at end: {}", token.line, message),
            TokenKind::Error => eprintln!("[line {}] Error: {}", token.line, message),
            _ => eprintln!("[line {}] Error at '{}': {}", token.line, token.lexeme, message),
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Switch
                | TokenKind::Import => return,
                _ => {}
            }
            self.advance();
        }
    }
}

/// Reborrows a compiling function's payload with a lifetime chosen by the
/// caller. Sound because `ObjFunction`'s fields are mutated only here,
/// single-threaded, for as long as the function is being compiled — unlike
/// every other heap object, it carries no `Cell`/`RefCell` of its own.
fn function_mut(f: GcRef) -> &'static mut ObjFunction {
    let ptr = f.as_ptr();
    match unsafe { &mut (*ptr).data } {
        ObjData::Function(func) => func,
        _ => unreachable!("compiler GcRef always names a Function"),
    }
}

/// Lifetime-free semantic state, shared across an `import` boundary: the
/// currently-compiling function chain, class-compilation context, the
/// loading stack for circular-import detection, and the `base_dir` that
/// relative import paths resolve against.
pub struct Compiler<'vm> {
    vm: &'vm mut Vm,
    funcs: Vec<FuncState>,
    classes: Vec<ClassState>,
    import_stack: Vec<PathBuf>,
    base_dir: Option<PathBuf>,
    const_globals: HashSet<String>,
}

impl<'vm> Compiler<'vm> {
    fn new(vm: &'vm mut Vm, base_dir: Option<PathBuf>) -> Self {
        let function = vm.alloc_object(ObjData::Function(ObjFunction::new(None)));
        vm.compiler_roots.borrow_mut().push(function);
        Compiler {
            vm,
            funcs: vec![FuncState::new(FunctionType::Script, function)],
            classes: Vec::new(),
            import_stack: Vec::new(),
            base_dir,
            const_globals: HashSet::new(),
        }
    }

    fn current_function(&self) -> GcRef {
        self.funcs.last().unwrap().function
    }

    fn current_chunk_len(&self) -> usize {
        function_mut(self.current_function()).chunk.code.len()
    }

    // --- emission ---

    fn emit_byte(&mut self, byte: u8, line: u32) {
        function_mut(self.current_function()).chunk.write(byte, line);
    }

    fn emit_bytes(&mut self, a: u8, b: u8, line: u32) {
        self.emit_byte(a, line);
        self.emit_byte(b, line);
    }

    fn emit_u16(&mut self, value: u16, line: u32) {
        self.emit_byte((value >> 8) as u8, line);
        self.emit_byte((value & 0xff) as u8, line);
    }

    fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit_byte(op as u8, line);
        self.emit_byte(0xff, line);
        self.emit_byte(0xff, line);
        self.current_chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize, parser: &mut Parser) {
        let jump = self.current_chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            parser.error("Too much code to jump over.");
            return;
        }
        function_mut(self.current_function()).chunk.patch_u16(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32, parser: &mut Parser) {
        self.emit_byte(OpCode::Loop as u8, line);
        let offset = self.current_chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            parser.error("Loop body too large.");
        }
        self.emit_u16(offset as u16, line);
    }

    fn emit_constant(&mut self, value: Value, line: u32, parser: &mut Parser) {
        let idx = function_mut(self.current_function()).chunk.add_constant(value);
        if idx < 256 {
            self.emit_bytes(OpCode::Constant as u8, idx as u8, line);
        } else if idx <= u16::MAX as usize {
            self.emit_byte(OpCode::ConstantLong as u8, line);
            self.emit_u16(idx as u16, line);
        } else {
            parser.error("Too many constants in one chunk.");
        }
    }

    /// Property/class/method/super/del names are always a single-byte
    /// constant index — `vm.rs`'s `read_string!` never reads the long form.
    fn identifier_constant(&mut self, name: &[u8], parser: &mut Parser) -> u8 {
        let name_ref = self.vm.intern(name);
        let idx = function_mut(self.current_function()).chunk.add_constant(Value::Obj(name_ref));
        if idx > u8::MAX as usize {
            parser.error("Too many constants in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn global_slot(&mut self, name: &[u8]) -> u16 {
        let name_ref = self.vm.intern(name);
        self.vm.globals.slot_for(name_ref) as u16
    }

    fn emit_closure(&mut self, compiled: GcRef, line: u32, parser: &mut Parser) {
        let idx = function_mut(self.current_function()).chunk.add_constant(Value::Obj(compiled));
        if idx > u8::MAX as usize {
            parser.error("Too many constants in one chunk.");
            return;
        }
        self.emit_byte(OpCode::Closure as u8, line);
        self.emit_byte(idx as u8, line);
        let upvalues = function_mut(compiled).upvalues.clone();
        for up in upvalues {
            self.emit_byte(u8::from(up.is_local), line);
            self.emit_byte(up.index, line);
        }
    }

    fn emit_return(&mut self, line: u32) {
        if self.funcs.last().unwrap().function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0, line);
        } else {
            self.emit_byte(OpCode::Nil as u8, line);
        }
        self.emit_byte(OpCode::Return as u8, line);
    }

    fn end_compiler(&mut self, parser: &mut Parser) -> GcRef {
        let line = parser.previous.line;
        self.emit_return(line);
        let func_state = self.funcs.pop().unwrap();
        function_mut(func_state.function).upvalues = func_state.upvalues;
        self.vm.compiler_roots.borrow_mut().pop();
        func_state.function
    }

    // --- locals & upvalues ---

    fn add_local(&mut self, name: String, is_const: bool, parser: &mut Parser) {
        let too_many = self.funcs.last().unwrap().locals.len() >= u8::MAX as usize + 1;
        if too_many {
            parser.error("Too many local variables in function.");
            return;
        }
        self.funcs.last_mut().unwrap().locals.push(LocalVar {
            name,
            depth: -1,
            is_captured: false,
            is_const,
        });
    }

    fn declare_variable(&mut self, parser: &mut Parser, is_const: bool) {
        let name = parser.previous.lexeme.to_string();
        let mut dup = false;
        {
            let func = self.funcs.last().unwrap();
            let depth = func.scope_depth;
            for local in func.locals.iter().rev() {
                if local.depth != -1 && (local.depth as usize) < depth {
                    break;
                }
                if local.name == name {
                    dup = true;
                    break;
                }
            }
        }
        if dup {
            parser.error("Already a variable with this name in this scope.");
        }
        self.add_local(name, is_const, parser);
    }

    fn mark_initialized(&mut self) {
        let depth = self.funcs.last().unwrap().scope_depth;
        if depth == 0 {
            return;
        }
        self.funcs.last_mut().unwrap().locals.last_mut().unwrap().depth = depth as i32;
    }

    fn resolve_local(&mut self, func_idx: usize, name: &str, parser: &mut Parser) -> Option<(u8, bool)> {
        let mut found: Option<(usize, i32, bool)> = None;
        {
            let func = &self.funcs[func_idx];
            for (i, local) in func.locals.iter().enumerate().rev() {
                if local.name == name {
                    found = Some((i, local.depth, local.is_const));
                    break;
                }
            }
        }
        found.map(|(idx, depth, is_const)| {
            if depth == -1 {
                parser.error("Can't read local variable in its own initializer.");
            }
            (idx as u8, is_const)
        })
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &str, parser: &mut Parser) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        let enclosing_idx = func_idx - 1;
        if let Some((local_idx, _)) = self.resolve_local(enclosing_idx, name, parser) {
            self.funcs[enclosing_idx].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(func_idx, local_idx, true, parser));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing_idx, name, parser) {
            return Some(self.add_upvalue(func_idx, up_idx, false, parser));
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool, parser: &mut Parser) -> u8 {
        {
            let existing = &self.funcs[func_idx].upvalues;
            for (i, up) in existing.iter().enumerate() {
                if up.index == index && up.is_local == is_local {
                    return i as u8;
                }
            }
        }
        if self.funcs[func_idx].upvalues.len() >= u8::MAX as usize + 1 {
            parser.error("Too many closure variables in function.");
            return 0;
        }
        self.funcs[func_idx].upvalues.push(UpvalueDesc { index, is_local });
        (self.funcs[func_idx].upvalues.len() - 1) as u8
    }

    fn begin_scope(&mut self) {
        self.funcs.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        self.funcs.last_mut().unwrap().scope_depth -= 1;
        let depth = self.funcs.last().unwrap().scope_depth as i32;
        loop {
            let should_pop =
                matches!(self.funcs.last().unwrap().locals.last(), Some(l) if l.depth > depth);
            if !should_pop {
                break;
            }
            let is_captured = self.funcs.last_mut().unwrap().locals.pop().unwrap().is_captured;
            if is_captured {
                self.emit_byte(OpCode::CloseUpvalue as u8, line);
            } else {
                self.emit_byte(OpCode::Pop as u8, line);
            }
        }
    }

    fn pop_locals_above(&mut self, depth: usize, line: u32) {
        let count = self
            .funcs
            .last()
            .unwrap()
            .locals
            .iter()
            .filter(|l| l.depth > depth as i32)
            .count();
        for _ in 0..count {
            self.emit_byte(OpCode::Pop as u8, line);
        }
    }

    fn emit_get_named(&mut self, name: &str, line: u32, parser: &mut Parser) {
        let func_idx = self.funcs.len() - 1;
        if let Some((slot, _)) = self.resolve_local(func_idx, name, parser) {
            self.emit_bytes(OpCode::GetLocal as u8, slot, line);
            return;
        }
        if let Some(up_idx) = self.resolve_upvalue(func_idx, name, parser) {
            self.emit_bytes(OpCode::GetUpvalue as u8, up_idx, line);
            return;
        }
        let slot = self.global_slot(name.as_bytes());
        self.emit_byte(OpCode::GetGlobal as u8, line);
        self.emit_u16(slot, line);
    }

    fn named_variable(&mut self, parser: &mut Parser, name: &str, can_assign: bool) {
        let line = parser.previous.line;
        let func_idx = self.funcs.len() - 1;
        if let Some((slot, is_const)) = self.resolve_local(func_idx, name, parser) {
            if can_assign && parser.match_token(TokenKind::Equal) {
                if is_const {
                    parser.error("Cannot assign to a const-declared variable.");
                }
                self.expression(parser);
                self.emit_bytes(OpCode::SetLocal as u8, slot, line);
            } else {
                self.emit_bytes(OpCode::GetLocal as u8, slot, line);
            }
            return;
        }
        if let Some(up_idx) = self.resolve_upvalue(func_idx, name, parser) {
            if can_assign && parser.match_token(TokenKind::Equal) {
                self.expression(parser);
                self.emit_bytes(OpCode::SetUpvalue as u8, up_idx, line);
            } else {
                self.emit_bytes(OpCode::GetUpvalue as u8, up_idx, line);
            }
            return;
        }
        let slot = self.global_slot(name.as_bytes());
        let is_const = self.const_globals.contains(name);
        if can_assign && parser.match_token(TokenKind::Equal) {
            if is_const {
                parser.error("Cannot assign to a const-declared variable.");
            }
            self.expression(parser);
            self.emit_byte(OpCode::SetGlobal as u8, line);
            self.emit_u16(slot, line);
        } else {
            self.emit_byte(OpCode::GetGlobal as u8, line);
            self.emit_u16(slot, line);
        }
    }

    // --- Pratt core ---

    fn expression(&mut self, parser: &mut Parser) {
        self.parse_precedence(parser, Precedence::Assignment);
    }

    fn parse_precedence(&mut self, parser: &mut Parser, precedence: Precedence) {
        parser.advance();
        if !has_prefix(parser.previous.kind) {
            parser.error("Expect expression.");
            return;
        }
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix(parser.previous.kind, parser, can_assign);

        while precedence <= infix_precedence(parser.current.kind) {
            parser.advance();
            self.infix(parser.previous.kind, parser, can_assign);
        }

        if can_assign && parser.match_token(TokenKind::Equal) {
            parser.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, parser: &mut Parser, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.grouping(parser),
            TokenKind::Minus | TokenKind::Bang => self.unary(parser),
            TokenKind::Number => self.number(parser),
            TokenKind::String => self.string(parser),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(parser),
            TokenKind::Identifier => self.variable(parser, can_assign),
            TokenKind::This => self.this_(parser),
            TokenKind::Super => self.super_(parser),
            TokenKind::LeftBracket => self.collection(parser),
            _ => parser.error("Expect expression."),
        }
    }

    fn infix(&mut self, kind: TokenKind, parser: &mut Parser, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(parser),
            TokenKind::Dot => self.dot(parser, can_assign),
            TokenKind::LeftBracket => self.random_access(parser),
            TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::Slash
            | TokenKind::Star
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(parser),
            TokenKind::DotDot => self.range_(parser),
            TokenKind::And => self.and_(parser),
            TokenKind::Or => self.or_(parser),
            TokenKind::Question => self.conditional(parser),
            _ => unreachable!("infix dispatch on a non-infix token"),
        }
    }

    // --- expression rules ---

    fn grouping(&mut self, parser: &mut Parser) {
        self.expression(parser);
        parser.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, parser: &mut Parser) {
        let op_kind = parser.previous.kind;
        let line = parser.previous.line;
        self.parse_precedence(parser, Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_byte(OpCode::Negate as u8, line),
            TokenKind::Bang => self.emit_byte(OpCode::Not as u8, line),
            _ => unreachable!(),
        }
    }

    fn number(&mut self, parser: &mut Parser) {
        let value: f64 = parser.previous.lexeme.parse().unwrap_or(0.0);
        let line = parser.previous.line;
        self.emit_constant(Value::Number(value), line, parser);
    }

    fn string(&mut self, parser: &mut Parser) {
        let lexeme = parser.previous.lexeme;
        let bytes = lexeme.as_bytes()[1..lexeme.len() - 1].to_vec();
        let line = parser.previous.line;
        let obj = self.vm.intern(&bytes);
        self.emit_constant(Value::Obj(obj), line, parser);
    }

    fn literal(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        match parser.previous.kind {
            TokenKind::False => self.emit_byte(OpCode::False as u8, line),
            TokenKind::True => self.emit_byte(OpCode::True as u8, line),
            TokenKind::Nil => self.emit_byte(OpCode::Nil as u8, line),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, parser: &mut Parser, can_assign: bool) {
        let name = parser.previous.lexeme.to_string();
        self.named_variable(parser, &name, can_assign);
    }

    fn this_(&mut self, parser: &mut Parser) {
        if self.classes.is_empty() {
            parser.error("Can't use 'this' outside of a class.");
        }
        let line = parser.previous.line;
        self.emit_get_named("this", line, parser);
    }

    fn super_(&mut self, parser: &mut Parser) {
        if self.classes.is_empty() {
            parser.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            parser.error("Can't use 'super' in a class with no superclass.");
        }
        parser.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        parser.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_bytes = parser.previous.lexeme.as_bytes().to_vec();
        let line = parser.previous.line;
        let name_idx = self.identifier_constant(&name_bytes, parser);
        self.emit_get_named("this", line, parser);
        if parser.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list(parser);
            self.emit_get_named("super", line, parser);
            self.emit_byte(OpCode::SuperInvoke as u8, line);
            self.emit_byte(name_idx, line);
            self.emit_byte(argc, line);
        } else {
            self.emit_get_named("super", line, parser);
            self.emit_byte(OpCode::GetSuper as u8, line);
            self.emit_byte(name_idx, line);
        }
    }

    fn binary(&mut self, parser: &mut Parser) {
        let op_kind = parser.previous.kind;
        let line = parser.previous.line;
        let prec = infix_precedence(op_kind);
        self.parse_precedence(parser, prec.next());
        match op_kind {
            TokenKind::Plus => self.emit_byte(OpCode::Add as u8, line),
            TokenKind::Minus => self.emit_byte(OpCode::Subtract as u8, line),
            TokenKind::Star => self.emit_byte(OpCode::Multiply as u8, line),
            TokenKind::Slash => self.emit_byte(OpCode::Divide as u8, line),
            TokenKind::EqualEqual => self.emit_byte(OpCode::Equal as u8, line),
            TokenKind::BangEqual => {
                self.emit_byte(OpCode::Equal as u8, line);
                self.emit_byte(OpCode::Not as u8, line);
            }
            TokenKind::Greater => self.emit_byte(OpCode::Greater as u8, line),
            TokenKind::GreaterEqual => {
                self.emit_byte(OpCode::Less as u8, line);
                self.emit_byte(OpCode::Not as u8, line);
            }
            TokenKind::Less => self.emit_byte(OpCode::Less as u8, line),
            TokenKind::LessEqual => {
                self.emit_byte(OpCode::Greater as u8, line);
                self.emit_byte(OpCode::Not as u8, line);
            }
            _ => unreachable!(),
        }
    }

    /// `lo..hi` (spec.md's instruction list names `RANGE`) builds a
    /// standalone Collection; it is not slice syntax, matching the VM's
    /// `RANGE` handler which takes no target operand at all.
    fn range_(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        self.parse_precedence(parser, Precedence::Comparison.next());
        self.emit_byte(OpCode::Range as u8, line);
    }

    fn and_(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        let end_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_byte(OpCode::Pop as u8, line);
        self.parse_precedence(parser, Precedence::And);
        self.patch_jump(end_jump, parser);
    }

    fn or_(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        let else_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        let end_jump = self.emit_jump(OpCode::Jump, line);
        self.patch_jump(else_jump, parser);
        self.emit_byte(OpCode::Pop as u8, line);
        self.parse_precedence(parser, Precedence::Or);
        self.patch_jump(end_jump, parser);
    }

    /// `a ? b : c` evaluates all three operands eagerly, in source order,
    /// then a single no-operand `CONDITIONAL` picks one (matches the VM's
    /// handler: pop else, pop then, pop cond — no jumps involved).
    fn conditional(&mut self, parser: &mut Parser) {
        self.parse_precedence(parser, Precedence::Conditional);
        parser.consume(TokenKind::Colon, "Expect ':' after then-branch of conditional expression.");
        self.parse_precedence(parser, Precedence::Assignment);
        let line = parser.previous.line;
        self.emit_byte(OpCode::Conditional as u8, line);
    }

    fn call(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        let argc = self.argument_list(parser);
        self.emit_bytes(OpCode::Call as u8, argc, line);
    }

    fn argument_list(&mut self, parser: &mut Parser) -> u8 {
        let mut count: u16 = 0;
        if !parser.check(TokenKind::RightParen) {
            loop {
                self.expression(parser);
                if count == 255 {
                    parser.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !parser.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        parser.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot(&mut self, parser: &mut Parser, can_assign: bool) {
        parser.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_bytes = parser.previous.lexeme.as_bytes().to_vec();
        let line = parser.previous.line;
        let name_idx = self.identifier_constant(&name_bytes, parser);
        if can_assign && parser.match_token(TokenKind::Equal) {
            self.expression(parser);
            self.emit_bytes(OpCode::SetProperty as u8, name_idx, line);
        } else if parser.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list(parser);
            self.emit_byte(OpCode::Invoke as u8, line);
            self.emit_byte(name_idx, line);
            self.emit_byte(argc, line);
        } else {
            self.emit_bytes(OpCode::GetProperty as u8, name_idx, line);
        }
    }

    fn collection(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        let mut count: u16 = 0;
        if !parser.check(TokenKind::RightBracket) {
            loop {
                self.expression(parser);
                count += 1;
                if !parser.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        parser.consume(TokenKind::RightBracket, "Expect ']' after collection elements.");
        self.emit_byte(OpCode::Collection as u8, line);
        self.emit_u16(count, line);
    }

    /// `a[i]`; no operand bytes follow `RANDOM_ACCESS` — both the target
    /// and the index come off the operand stack (matches `vm.rs` exactly).
    /// There is deliberately no index-assignment form: `a[i] = v` is not
    /// supported, only the `.set(i, v)` collection method.
    fn random_access(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        self.expression(parser);
        parser.consume(TokenKind::RightBracket, "Expect ']' after index.");
        self.emit_byte(OpCode::RandomAccess as u8, line);
    }

    // --- statements ---

    fn declaration(&mut self, parser: &mut Parser) {
        if parser.match_token(TokenKind::Class) {
            self.class_declaration(parser);
        } else if parser.match_token(TokenKind::Fun) {
            self.fun_declaration(parser);
        } else if parser.match_token(TokenKind::Var) {
            self.var_declaration(parser, false);
        } else if parser.match_token(TokenKind::Const) {
            self.var_declaration(parser, true);
        } else if parser.match_token(TokenKind::Import) {
            self.import_statement(parser);
        } else {
            self.statement(parser);
        }
        if parser.panic_mode {
            parser.synchronize();
        }
    }

    fn statement(&mut self, parser: &mut Parser) {
        if parser.match_token(TokenKind::Print) {
            self.print_statement(parser);
        } else if parser.match_token(TokenKind::If) {
            self.if_statement(parser);
        } else if parser.match_token(TokenKind::While) {
            self.while_statement(parser);
        } else if parser.match_token(TokenKind::For) {
            self.for_statement(parser);
        } else if parser.match_token(TokenKind::Switch) {
            self.switch_statement(parser);
        } else if parser.match_token(TokenKind::Return) {
            self.return_statement(parser);
        } else if parser.match_token(TokenKind::Break) {
            self.break_statement(parser);
        } else if parser.match_token(TokenKind::Continue) {
            self.continue_statement(parser);
        } else if parser.match_token(TokenKind::Delete) {
            self.delete_statement(parser);
        } else if parser.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(parser);
            self.end_scope(parser);
        } else {
            self.expression_statement(parser);
        }
    }

    fn block(&mut self, parser: &mut Parser) {
        while !parser.check(TokenKind::RightBrace) && !parser.check(TokenKind::Eof) {
            self.declaration(parser);
        }
        parser.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        self.expression(parser);
        parser.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print as u8, line);
    }

    fn expression_statement(&mut self, parser: &mut Parser) {
        self.expression(parser);
        let line = parser.previous.line;
        parser.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop as u8, line);
    }

    fn if_statement(&mut self, parser: &mut Parser) {
        parser.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression(parser);
        parser.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let line = parser.previous.line;
        let then_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_byte(OpCode::Pop as u8, line);
        self.statement(parser);
        let else_jump = self.emit_jump(OpCode::Jump, parser.previous.line);
        self.patch_jump(then_jump, parser);
        self.emit_byte(OpCode::Pop as u8, parser.previous.line);
        if parser.match_token(TokenKind::Else) {
            self.statement(parser);
        }
        self.patch_jump(else_jump, parser);
    }

    fn while_statement(&mut self, parser: &mut Parser) {
        let loop_start = self.current_chunk_len();
        let scope_depth = self.funcs.last().unwrap().scope_depth;
        self.funcs.last_mut().unwrap().loops.push(LoopCtx {
            loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });

        parser.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression(parser);
        parser.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let line = parser.previous.line;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit_byte(OpCode::Pop as u8, line);
        self.statement(parser);
        self.emit_loop(loop_start, parser.previous.line, parser);
        self.patch_jump(exit_jump, parser);
        self.emit_byte(OpCode::Pop as u8, parser.previous.line);

        let loop_ctx = self.funcs.last_mut().unwrap().loops.pop().unwrap();
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump, parser);
        }
    }

    fn for_statement(&mut self, parser: &mut Parser) {
        self.begin_scope();
        parser.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if parser.match_token(TokenKind::Semicolon) {
            // no initializer clause
        } else if parser.match_token(TokenKind::Var) {
            self.var_declaration(parser, false);
        } else {
            self.expression_statement(parser);
        }

        let mut loop_start = self.current_chunk_len();
        let mut exit_jump: Option<usize> = None;
        if !parser.match_token(TokenKind::Semicolon) {
            self.expression(parser);
            parser.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            let line = parser.previous.line;
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse, line));
            self.emit_byte(OpCode::Pop as u8, line);
        }

        if !parser.check(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump, parser.previous.line);
            let increment_start = self.current_chunk_len();
            self.expression(parser);
            let line = parser.previous.line;
            self.emit_byte(OpCode::Pop as u8, line);
            parser.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start, line, parser);
            loop_start = increment_start;
            self.patch_jump(body_jump, parser);
        } else {
            parser.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
        }

        let scope_depth = self.funcs.last().unwrap().scope_depth;
        self.funcs.last_mut().unwrap().loops.push(LoopCtx {
            loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });
        self.statement(parser);
        self.emit_loop(loop_start, parser.previous.line, parser);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit, parser);
            self.emit_byte(OpCode::Pop as u8, parser.previous.line);
        }

        let loop_ctx = self.funcs.last_mut().unwrap().loops.pop().unwrap();
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump, parser);
        }

        self.end_scope(parser);
    }

    /// `DUP` + per-case `EQUAL` + `JUMP_IF_FALSE` chain; every path (a
    /// matched case, an unmatched case with a default, an unmatched case
    /// with none) leaves the stack exactly as it found it.
    fn switch_statement(&mut self, parser: &mut Parser) {
        parser.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression(parser);
        parser.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        parser.consume(TokenKind::LeftBrace, "Expect '{' before switch body.");

        let mut end_jumps: Vec<usize> = Vec::new();
        let mut next_case_jump: Option<usize> = None;
        let mut saw_default = false;

        while parser.match_token(TokenKind::Case) {
            if let Some(jump) = next_case_jump.take() {
                self.patch_jump(jump, parser);
                self.emit_byte(OpCode::Pop as u8, parser.previous.line);
            }
            let line = parser.previous.line;
            self.emit_byte(OpCode::Dup as u8, line);
            self.expression(parser);
            parser.consume(TokenKind::Colon, "Expect ':' after case value.");
            self.emit_byte(OpCode::Equal as u8, line);
            next_case_jump = Some(self.emit_jump(OpCode::JumpIfFalse, line));
            self.emit_byte(OpCode::Pop as u8, line); // comparison result, match path
            self.emit_byte(OpCode::Pop as u8, line); // switch subject, no longer needed
            while !parser.check(TokenKind::Case)
                && !parser.check(TokenKind::Default)
                && !parser.check(TokenKind::RightBrace)
            {
                self.statement(parser);
            }
            end_jumps.push(self.emit_jump(OpCode::Jump, parser.previous.line));
        }

        if let Some(jump) = next_case_jump.take() {
            self.patch_jump(jump, parser);
            self.emit_byte(OpCode::Pop as u8, parser.previous.line);
        }

        if parser.match_token(TokenKind::Default) {
            saw_default = true;
            parser.consume(TokenKind::Colon, "Expect ':' after 'default'.");
            self.emit_byte(OpCode::Pop as u8, parser.previous.line);
            while !parser.check(TokenKind::RightBrace) && !parser.check(TokenKind::Eof) {
                self.statement(parser);
            }
        }

        if !saw_default {
            self.emit_byte(OpCode::Pop as u8, parser.previous.line);
        }

        for jump in end_jumps {
            self.patch_jump(jump, parser);
        }

        parser.consume(TokenKind::RightBrace, "Expect '}' after switch body.");
    }

    fn break_statement(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        parser.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.funcs.last().unwrap().loops.is_empty() {
            parser.error("Can't use 'break' outside of a loop.");
            return;
        }
        let loop_depth = self.funcs.last().unwrap().loops.last().unwrap().scope_depth;
        self.pop_locals_above(loop_depth, line);
        let jump = self.emit_jump(OpCode::Jump, line);
        self.funcs.last_mut().unwrap().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        parser.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        if self.funcs.last().unwrap().loops.is_empty() {
            parser.error("Can't use 'continue' outside of a loop.");
            return;
        }
        let loop_ctx_depth = self.funcs.last().unwrap().loops.last().unwrap().scope_depth;
        self.pop_locals_above(loop_ctx_depth, line);
        let loop_start = self.funcs.last().unwrap().loops.last().unwrap().loop_start;
        self.emit_loop(loop_start, line, parser);
    }

    fn return_statement(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        if self.funcs.last().unwrap().function_type == FunctionType::Script {
            parser.error("Can't return from top-level code.");
        }
        if parser.match_token(TokenKind::Semicolon) {
            self.emit_return(line);
            return;
        }
        if self.funcs.last().unwrap().function_type == FunctionType::Initializer {
            parser.error("Can't return a value from an initializer.");
        }
        self.expression(parser);
        parser.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        self.emit_byte(OpCode::Return as u8, parser.previous.line);
    }

    /// `delete a.b.c;` — a restricted grammar (identifier-or-`this`
    /// receiver, then a `.name` chain) rather than arbitrary-expression-
    /// then-final-dot, matching the single-byte `DEL` operand `vm.rs`
    /// expects (a plain name constant, no argc).
    fn delete_statement(&mut self, parser: &mut Parser) {
        let line = parser.previous.line;
        if parser.match_token(TokenKind::This) {
            self.emit_get_named("this", line, parser);
        } else {
            parser.consume(TokenKind::Identifier, "Expect identifier or 'this' after 'delete'.");
            let name = parser.previous.lexeme.to_string();
            self.named_variable(parser, &name, false);
        }
        parser.consume(TokenKind::Dot, "Expect '.' after delete target.");
        parser.consume(TokenKind::Identifier, "Expect property name.");
        loop {
            let name_bytes = parser.previous.lexeme.as_bytes().to_vec();
            let op_line = parser.previous.line;
            let name_idx = self.identifier_constant(&name_bytes, parser);
            if parser.match_token(TokenKind::Dot) {
                self.emit_bytes(OpCode::GetProperty as u8, name_idx, op_line);
                parser.consume(TokenKind::Identifier, "Expect property name.");
                continue;
            }
            parser.consume(TokenKind::Semicolon, "Expect ';' after delete statement.");
            self.emit_bytes(OpCode::Del as u8, name_idx, op_line);
            break;
        }
    }

    fn import_statement(&mut self, parser: &mut Parser) {
        parser.consume(TokenKind::String, "Expect a string literal path after 'import'.");
        let lexeme = parser.previous.lexeme;
        let raw_path = lexeme[1..lexeme.len() - 1].to_string();
        parser.consume(TokenKind::Semicolon, "Expect ';' after import path.");

        let resolved =
            match crate::module::resolve(self.base_dir.as_deref(), &raw_path, &self.import_stack) {
                Ok(r) => r,
                Err(msg) => {
                    parser.error(&msg);
                    return;
                }
            };

        self.import_stack.push(resolved.canonical_path.clone());
        let saved_base = self.base_dir.clone();
        self.base_dir = resolved.canonical_path.parent().map(|p| p.to_path_buf());

        let mut sub_parser = Parser::new(&resolved.source);
        sub_parser.advance();
        while !sub_parser.match_token(TokenKind::Eof) {
            self.declaration(&mut sub_parser);
        }
        if sub_parser.had_error {
            parser.had_error = true;
        }

        self.base_dir = saved_base;
        self.import_stack.pop();
    }

    // --- declarations ---

    fn parse_variable(&mut self, parser: &mut Parser, error_msg: &str, is_const: bool) -> VarTarget {
        parser.consume(TokenKind::Identifier, error_msg);
        if self.funcs.last().unwrap().scope_depth > 0 {
            self.declare_variable(parser, is_const);
            return VarTarget::Local;
        }
        let name = parser.previous.lexeme.to_string();
        if is_const {
            self.const_globals.insert(name.clone());
        }
        let slot = self.global_slot(name.as_bytes());
        VarTarget::Global(slot)
    }

    fn define_variable(&mut self, target: VarTarget, line: u32) {
        match target {
            VarTarget::Local => self.mark_initialized(),
            VarTarget::Global(slot) => {
                self.emit_byte(OpCode::DefineGlobal as u8, line);
                self.emit_u16(slot, line);
            }
        }
    }

    fn var_declaration(&mut self, parser: &mut Parser, is_const: bool) {
        let target = self.parse_variable(parser, "Expect variable name.", is_const);
        if parser.match_token(TokenKind::Equal) {
            self.expression(parser);
        } else {
            if is_const {
                parser.error("Const declaration requires an initializer.");
            }
            let line = parser.previous.line;
            self.emit_byte(OpCode::Nil as u8, line);
        }
        let line = parser.previous.line;
        parser.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(target, line);
    }

    /// Parses a single default-argument value: a literal constant,
    /// optionally unary-negated if numeric (spec.md §4.2 expansion).
    /// Deliberately does not call `expression` — no bytecode is emitted,
    /// the `Value` is stored directly on `ObjFunction.defaults`.
    fn default_literal(&mut self, parser: &mut Parser) -> Value {
        let negate = parser.match_token(TokenKind::Minus);
        if parser.match_token(TokenKind::Number) {
            let n: f64 = parser.previous.lexeme.parse().unwrap_or(0.0);
            Value::Number(if negate { -n } else { n })
        } else if negate {
            parser.error("Expect a number after unary '-' in a default argument.");
            Value::Nil
        } else if parser.match_token(TokenKind::String) {
            let lexeme = parser.previous.lexeme;
            let bytes = &lexeme.as_bytes()[1..lexeme.len() - 1];
            Value::Obj(self.vm.intern(bytes))
        } else if parser.match_token(TokenKind::True) {
            Value::Bool(true)
        } else if parser.match_token(TokenKind::False) {
            Value::Bool(false)
        } else if parser.match_token(TokenKind::Nil) {
            Value::Nil
        } else {
            parser.error("Default argument must be a literal constant.");
            Value::Nil
        }
    }

    fn function(&mut self, parser: &mut Parser, function_type: FunctionType, name: &str) -> GcRef {
        let name_ref = self.vm.intern_str(name);
        let function = self.vm.alloc_object(ObjData::Function(ObjFunction::new(Some(name_ref))));
        self.vm.compiler_roots.borrow_mut().push(function);
        self.funcs.push(FuncState::new(function_type, function));
        self.begin_scope();

        parser.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !parser.check(TokenKind::RightParen) {
            let mut saw_default = false;
            loop {
                let arity = function_mut(self.current_function()).arity;
                if arity >= 255 {
                    parser.error("Can't have more than 255 parameters.");
                }
                parser.consume(TokenKind::Identifier, "Expect parameter name.");
                self.declare_variable(parser, false);
                self.mark_initialized();
                function_mut(self.current_function()).arity += 1;

                if parser.match_token(TokenKind::Equal) {
                    saw_default = true;
                    let value = self.default_literal(parser);
                    let f = function_mut(self.current_function());
                    f.default_count += 1;
                    f.defaults.push(value);
                } else if saw_default {
                    parser.error("Parameters without defaults cannot follow parameters with defaults.");
                }

                if !parser.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        parser.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        parser.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block(parser);

        self.end_compiler(parser)
    }

    fn fun_declaration(&mut self, parser: &mut Parser) {
        let target = self.parse_variable(parser, "Expect function name.", false);
        if matches!(target, VarTarget::Local) {
            self.mark_initialized();
        }
        let name = parser.previous.lexeme.to_string();
        let line = parser.previous.line;
        let compiled = self.function(parser, FunctionType::Function, &name);
        self.emit_closure(compiled, line, parser);
        self.define_variable(target, line);
    }

    fn method(&mut self, parser: &mut Parser) {
        parser.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = parser.previous.lexeme.to_string();
        let line = parser.previous.line;
        let name_idx = self.identifier_constant(method_name.as_bytes(), parser);
        let function_type =
            if method_name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        let compiled = self.function(parser, function_type, &method_name);
        self.emit_closure(compiled, line, parser);
        self.emit_byte(OpCode::Method as u8, line);
        self.emit_byte(name_idx, line);
    }

    /// `class C < Super { ... }` (spec §4.2): CLASS, optional INHERIT
    /// (copying superclass methods downward — terminates cleanly, no
    /// fallthrough into GET_SUPER, per REDESIGN FLAG a), then METHOD per
    /// member. `init` doubles as the recorded initializer.
    fn class_declaration(&mut self, parser: &mut Parser) {
        parser.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = parser.previous.lexeme.to_string();
        let line = parser.previous.line;
        let name_idx = self.identifier_constant(class_name.as_bytes(), parser);

        let target = if self.funcs.last().unwrap().scope_depth > 0 {
            self.declare_variable(parser, false);
            VarTarget::Local
        } else {
            let slot = self.global_slot(class_name.as_bytes());
            VarTarget::Global(slot)
        };

        self.emit_byte(OpCode::Class as u8, line);
        self.emit_byte(name_idx, line);
        self.define_variable(target, line);

        self.classes.push(ClassState { has_superclass: false });

        if parser.match_token(TokenKind::Less) {
            parser.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = parser.previous.lexeme.to_string();
            if super_name == class_name {
                parser.error("A class can't inherit from itself.");
            }
            self.named_variable(parser, &super_name, false);
            self.begin_scope();
            self.add_local("super".to_string(), false, parser);
            self.mark_initialized();

            self.named_variable(parser, &class_name, false);
            self.emit_byte(OpCode::Inherit as u8, parser.previous.line);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(parser, &class_name, false);
        parser.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !parser.check(TokenKind::RightBrace) && !parser.check(TokenKind::Eof) {
            self.method(parser);
        }
        parser.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop as u8, parser.previous.line);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope(parser);
        }
        self.classes.pop();
    }
}

/// `compile(source) -> Function | error` (spec §4.2). `base_dir` anchors
/// relative `import` paths; `None` means resolve against the process's
/// current directory (the REPL and `Vm::interpret`'s default).
pub fn compile(vm: &mut Vm, source: &str, base_dir: Option<PathBuf>) -> Option<GcRef> {
    let mut compiler = Compiler::new(vm, base_dir);
    let mut parser = Parser::new(source);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        compiler.declaration(&mut parser);
    }
    let function = compiler.end_compiler(&mut parser);
    if parser.had_error {
        None
    } else {
        Some(function)
    }
}
