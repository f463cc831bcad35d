use crate::error::{CompileError, ErrorBag};
use crate::lexer::{Token, TOKEN_COMMENT, TOKEN_END, TOKEN_WHITESPACE};
use crate::table::{LalrTable, ParseAction};

/// Ceiling on driver steps; tripping it means the tables are malformed.
const MAX_STEPS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Token,
    NonTerminal,
}

/// Concrete syntax tree node. `literal` is only meaningful for token
/// nodes; `line` is inherited from the first child that knows one.
#[derive(Debug, Clone)]
pub struct SyntaxNode {
    pub name: String,
    pub kind: NodeKind,
    pub literal: String,
    pub children: Vec<SyntaxNode>,
    pub line: usize,
}

impl SyntaxNode {
    pub fn from_token(token: &Token) -> SyntaxNode {
        SyntaxNode {
            name: token.name.clone(),
            kind: NodeKind::Token,
            literal: token.literal.clone(),
            children: Vec::new(),
            line: token.line,
        }
    }

    pub fn non_terminal(name: &str, children: Vec<SyntaxNode>) -> SyntaxNode {
        let line = children.iter().map(|c| c.line).find(|&l| l > 0).unwrap_or(0);
        SyntaxNode {
            name: name.to_string(),
            kind: NodeKind::NonTerminal,
            literal: String::new(),
            children,
            line,
        }
    }

    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn child(&self, i: usize) -> &SyntaxNode {
        &self.children[i]
    }

    /// Indented dump used by the `-i` intermediate listing.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        match self.kind {
            NodeKind::Token => out.push_str(&format!("{} {:?}\n", self.name, self.literal)),
            NodeKind::NonTerminal => out.push_str(&format!("{}\n", self.name)),
        }
        for child in &self.children {
            child.dump_into(out, depth + 1);
        }
    }
}

/// Discard trivia before driving the tables: comments that end in a
/// newline decay to newline whitespace, remaining comments and all
/// whitespace are dropped. Line numbers already live on the tokens, so
/// the newlines have nothing left to contribute afterwards.
pub fn strip_trivia(tokens: &[Token]) -> Vec<Token> {
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        if token.name == TOKEN_COMMENT || token.name == TOKEN_WHITESPACE {
            continue;
        }
        out.push(token.clone());
    }
    out
}

/// Table-driven LALR(1) parser.
pub struct Parser<'a> {
    table: &'a LalrTable,
}

impl<'a> Parser<'a> {
    pub fn new(table: &'a LalrTable) -> Parser<'a> {
        Parser { table }
    }

    /// Run the driver over a token stream (which must end in `SP_END`).
    /// With `bag` set, tokens that provoke a syntax error are dropped and
    /// parsing continues; without it the first error aborts.
    pub fn parse(
        &self,
        tokens: &[Token],
        mut bag: Option<&mut ErrorBag>,
    ) -> Result<SyntaxNode, CompileError> {
        let tokens = strip_trivia(tokens);

        let mut state_stack: Vec<usize> = vec![self.table.start_state()];
        let mut node_stack: Vec<SyntaxNode> = Vec::new();
        let mut pos = 0usize;
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > MAX_STEPS {
                return Err(CompileError::Internal(
                    "parser exceeded its step limit; the tables are malformed".to_string(),
                ));
            }

            let token = tokens.get(pos).ok_or_else(|| {
                CompileError::Internal("token stream ended without SP_END".to_string())
            })?;
            let symbol = match self.table.token_symbol(token) {
                Some(s) => s,
                None => {
                    return Err(CompileError::Table(format!(
                        "token {} is not in the grammar's symbol set",
                        token.name
                    )))
                }
            };
            let state = *state_stack.last().unwrap();

            match self.table.action(state, symbol) {
                ParseAction::Shift(next) => {
                    node_stack.push(SyntaxNode::from_token(token));
                    state_stack.push(next);
                    pos += 1;
                }
                ParseAction::Reduce(p) => {
                    let producer = self.table.producers.get(p).ok_or_else(|| {
                        CompileError::Internal(format!("reduce to unknown production {}", p))
                    })?;
                    let count = self.table.rhs_len(producer);
                    if node_stack.len() < count {
                        return Err(CompileError::Internal(format!(
                            "reduce by production {} needs {} symbols, stack has {}",
                            p,
                            count,
                            node_stack.len()
                        )));
                    }

                    let children = node_stack.split_off(node_stack.len() - count);
                    state_stack.truncate(state_stack.len() - count);

                    let lhs_name = self.table.symbol_name(producer.lhs);
                    let node = run_action(&producer.action, lhs_name, children)?;

                    let top = *state_stack.last().unwrap();
                    let next = self.table.goto(top, producer.lhs).ok_or_else(|| {
                        CompileError::Internal(format!(
                            "no GOTO from state {} on {}",
                            top, lhs_name
                        ))
                    })?;
                    node_stack.push(node);
                    state_stack.push(next);
                }
                ParseAction::Accept => {
                    if node_stack.len() != 1 {
                        return Err(CompileError::Internal(format!(
                            "accept with {} nodes on the stack",
                            node_stack.len()
                        )));
                    }
                    return Ok(node_stack.pop().unwrap());
                }
                ParseAction::None => {
                    let err = CompileError::Syntax {
                        line: token.line,
                        column: token.column,
                        state,
                        token: token.name.clone(),
                    };
                    match bag.as_deref_mut() {
                        Some(bag) if token.name != TOKEN_END => {
                            bag.push(err);
                            pos += 1;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }
}

/// Interpret one semantic action against the popped children.
///
/// The action language is `$$ = <expr>;` where `<expr>` is either `$n`
/// (the n-th right-hand-side entry, 1-indexed) or
/// `newNode('name', <expr>, ...)`. An empty action defaults to wrapping
/// every child under the production's left-hand side.
fn run_action(
    action: &str,
    lhs: &str,
    children: Vec<SyntaxNode>,
) -> Result<SyntaxNode, CompileError> {
    let text = action.trim();
    if text.is_empty() {
        return Ok(SyntaxNode::non_terminal(lhs, children));
    }

    let mut cursor = ActionCursor {
        chars: text.chars().collect(),
        pos: 0,
        action: text,
    };
    cursor.expect_str("$$")?;
    cursor.expect_char('=')?;
    let node = cursor.parse_expr(&children)?;
    cursor.skip_ws();
    if cursor.peek() == Some(';') {
        cursor.pos += 1;
    }
    cursor.skip_ws();
    if cursor.pos != cursor.chars.len() {
        return Err(CompileError::Table(format!(
            "trailing junk in semantic action {:?}",
            cursor.action
        )));
    }
    Ok(node)
}

struct ActionCursor<'a> {
    chars: Vec<char>,
    pos: usize,
    action: &'a str,
}

impl<'a> ActionCursor<'a> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().map_or(false, |c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect_char(&mut self, c: char) -> Result<(), CompileError> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", c)))
        }
    }

    fn expect_str(&mut self, s: &str) -> Result<(), CompileError> {
        self.skip_ws();
        for c in s.chars() {
            if self.peek() == Some(c) {
                self.pos += 1;
            } else {
                return Err(self.error(&format!("expected {:?}", s)));
            }
        }
        Ok(())
    }

    fn error(&self, what: &str) -> CompileError {
        CompileError::Table(format!(
            "bad semantic action {:?}: {} at offset {}",
            self.action, what, self.pos
        ))
    }

    fn parse_expr(&mut self, children: &[SyntaxNode]) -> Result<SyntaxNode, CompileError> {
        self.skip_ws();
        match self.peek() {
            Some('$') => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                let n: usize = digits
                    .parse()
                    .map_err(|_| self.error("expected $<number>"))?;
                if n == 0 || n > children.len() {
                    return Err(self.error(&format!(
                        "${} out of range for {} children",
                        n,
                        children.len()
                    )));
                }
                Ok(children[n - 1].clone())
            }
            Some('n') => {
                self.expect_str("newNode")?;
                self.expect_char('(')?;
                let name = self.parse_string()?;
                let mut kids = Vec::new();
                loop {
                    self.skip_ws();
                    match self.peek() {
                        Some(',') => {
                            self.pos += 1;
                            kids.push(self.parse_expr(children)?);
                        }
                        Some(')') => {
                            self.pos += 1;
                            break;
                        }
                        _ => return Err(self.error("expected ',' or ')'")),
                    }
                }
                Ok(SyntaxNode::non_terminal(&name, kids))
            }
            _ => Err(self.error("expected $n or newNode(...)")),
        }
    }

    fn parse_string(&mut self) -> Result<String, CompileError> {
        self.skip_ws();
        let quote = match self.peek() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.error("expected a quoted name")),
        };
        self.pos += 1;
        let start = self.pos;
        while self.peek().map_or(false, |c| c != quote) {
            self.pos += 1;
        }
        if self.peek() != Some(quote) {
            return Err(self.error("unterminated quoted name"));
        }
        let s: String = self.chars[start..self.pos].iter().collect();
        self.pos += 1;
        Ok(s)
    }
}
