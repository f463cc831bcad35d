use super::nfa::Nfa;
use super::Alpha;
use crate::error::CompileError;

/// Printable ASCII range used when expanding negated character classes.
const PRINTABLE_LO: u8 = 32;
const PRINTABLE_HI: u8 = 126;

/// Intermediate token of the regex compiler. Literal characters are kept
/// apart from operator characters so quoted text and escaped metacharacters
/// survive the later passes untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReTok {
    Lit(char),
    Any,
    Op(char),
}

const CONCAT: char = '\u{1}';

fn escape_char(c: char) -> Option<char> {
    match c {
        'n' => Some('\n'),
        't' => Some('\t'),
        'r' => Some('\r'),
        '(' | ')' | '[' | ']' | '+' | '-' | '*' | '?' | '"' | '.' | '\'' | '|' | '\\' => Some(c),
        _ => None,
    }
}

/// Pass 1: expand the `\d` and `\s` shorthands into explicit classes.
/// Quoted sections are left alone.
fn expand_shorthand(regex: &str) -> String {
    let mut out = String::new();
    let mut chars = regex.chars().peekable();
    let mut in_quote = false;

    while let Some(c) = chars.next() {
        if c == '"' {
            in_quote = !in_quote;
            out.push(c);
        } else if c == '\\' && !in_quote {
            match chars.next() {
                Some('d') => out.push_str("[0-9]"),
                Some('s') => out.push_str("[ \\t\\r\\n]"),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Pass 2: tokenize, expanding bracket classes (with ranges and `[^…]`
/// negation over printable ASCII) into explicit alternation groups and
/// quoted strings into literal runs.
fn tokenize(regex: &str) -> Result<Vec<ReTok>, CompileError> {
    let mut out = Vec::new();
    let mut chars = regex.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let next = chars.next().ok_or_else(|| {
                    CompileError::Table(format!("dangling escape in regex {:?}", regex))
                })?;
                let lit = escape_char(next).ok_or_else(|| {
                    CompileError::Table(format!("unknown escape \\{} in regex {:?}", next, regex))
                })?;
                out.push(ReTok::Lit(lit));
            }
            '"' => {
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            let next = chars.next().ok_or_else(|| {
                                CompileError::Table(format!(
                                    "unterminated quote in regex {:?}",
                                    regex
                                ))
                            })?;
                            out.push(ReTok::Lit(escape_char(next).unwrap_or(next)));
                        }
                        Some(lit) => out.push(ReTok::Lit(lit)),
                        None => {
                            return Err(CompileError::Table(format!(
                                "unterminated quote in regex {:?}",
                                regex
                            )))
                        }
                    }
                }
            }
            '[' => {
                let mut members: Vec<char> = Vec::new();
                let negated = chars.peek() == Some(&'^');
                if negated {
                    chars.next();
                }
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some('\\') => {
                            let next = chars.next().ok_or_else(|| {
                                CompileError::Table(format!(
                                    "unterminated class in regex {:?}",
                                    regex
                                ))
                            })?;
                            members.push(escape_char(next).unwrap_or(next));
                        }
                        Some(lo) => {
                            // Range if a `-` follows with a closing member after it.
                            if chars.peek() == Some(&'-') {
                                chars.next();
                                match chars.peek() {
                                    Some(&']') | None => {
                                        members.push(lo);
                                        members.push('-');
                                    }
                                    Some(&hi) => {
                                        chars.next();
                                        for b in lo as u32..=hi as u32 {
                                            if let Some(c) = char::from_u32(b) {
                                                members.push(c);
                                            }
                                        }
                                    }
                                }
                            } else {
                                members.push(lo);
                            }
                        }
                        None => {
                            return Err(CompileError::Table(format!(
                                "unterminated class in regex {:?}",
                                regex
                            )))
                        }
                    }
                }

                let members: Vec<char> = if negated {
                    (PRINTABLE_LO..=PRINTABLE_HI)
                        .map(|b| b as char)
                        .filter(|c| !members.contains(c))
                        .collect()
                } else {
                    members
                };

                if members.is_empty() {
                    return Err(CompileError::Table(format!(
                        "empty character class in regex {:?}",
                        regex
                    )));
                }

                out.push(ReTok::Op('('));
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        out.push(ReTok::Op('|'));
                    }
                    out.push(ReTok::Lit(*m));
                }
                out.push(ReTok::Op(')'));
            }
            '.' => out.push(ReTok::Any),
            '|' | '*' | '+' | '?' | '(' | ')' => out.push(ReTok::Op(c)),
            _ => out.push(ReTok::Lit(c)),
        }
    }
    Ok(out)
}

/// Pass 3: make concatenation explicit between adjacent atoms/groups.
fn insert_concat(toks: &[ReTok]) -> Vec<ReTok> {
    let mut out = Vec::with_capacity(toks.len() * 2);

    for (i, tok) in toks.iter().enumerate() {
        if i > 0 {
            let prev = toks[i - 1];
            let prev_ends_atom = matches!(
                prev,
                ReTok::Lit(_) | ReTok::Any | ReTok::Op(')') | ReTok::Op('*') | ReTok::Op('+') | ReTok::Op('?')
            );
            let cur_starts_atom = matches!(tok, ReTok::Lit(_) | ReTok::Any | ReTok::Op('('));
            if prev_ends_atom && cur_starts_atom {
                out.push(ReTok::Op(CONCAT));
            }
        }
        out.push(*tok);
    }
    out
}

fn precedence(op: char) -> u8 {
    match op {
        '*' | '+' | '?' => 3,
        CONCAT => 2,
        '|' => 1,
        _ => 0,
    }
}

/// Pass 4: shunting-yard conversion to postfix. The closure operators are
/// already postfix in the source notation and go straight to the output.
fn to_postfix(toks: &[ReTok]) -> Result<Vec<ReTok>, CompileError> {
    let mut out = Vec::with_capacity(toks.len());
    let mut ops: Vec<char> = Vec::new();

    for tok in toks {
        match tok {
            ReTok::Lit(_) | ReTok::Any => out.push(*tok),
            ReTok::Op('*') | ReTok::Op('+') | ReTok::Op('?') => out.push(*tok),
            ReTok::Op('(') => ops.push('('),
            ReTok::Op(')') => loop {
                match ops.pop() {
                    Some('(') => break,
                    Some(op) => out.push(ReTok::Op(op)),
                    None => {
                        return Err(CompileError::Table(
                            "unbalanced parentheses in regex".to_string(),
                        ))
                    }
                }
            },
            ReTok::Op(op) => {
                while let Some(&top) = ops.last() {
                    if top != '(' && precedence(top) >= precedence(*op) {
                        out.push(ReTok::Op(ops.pop().unwrap()));
                    } else {
                        break;
                    }
                }
                ops.push(*op);
            }
        }
    }
    while let Some(op) = ops.pop() {
        if op == '(' {
            return Err(CompileError::Table(
                "unbalanced parentheses in regex".to_string(),
            ));
        }
        out.push(ReTok::Op(op));
    }
    Ok(out)
}

/// Thompson construction over the postfix form.
fn build_nfa(postfix: &[ReTok]) -> Result<Nfa, CompileError> {
    let mut stack: Vec<Nfa> = Vec::new();

    for tok in postfix {
        match tok {
            ReTok::Lit(c) => stack.push(Nfa::atom(Alpha::Char(*c))),
            ReTok::Any => stack.push(Nfa::atom(Alpha::Any)),
            ReTok::Op(op) => match *op {
                '*' | '+' | '?' => {
                    let a = stack.pop().ok_or_else(|| {
                        CompileError::Table("regex operator without operand".to_string())
                    })?;
                    stack.push(match op {
                        '*' => Nfa::kleene(a),
                        '+' => Nfa::plus(a),
                        _ => Nfa::question(a),
                    });
                }
                '|' | CONCAT => {
                    let b = stack.pop().ok_or_else(|| {
                        CompileError::Table("regex operator without operand".to_string())
                    })?;
                    let a = stack.pop().ok_or_else(|| {
                        CompileError::Table("regex operator without operand".to_string())
                    })?;
                    stack.push(if *op == '|' {
                        Nfa::alternate(a, b)
                    } else {
                        Nfa::concat(a, b)
                    });
                }
                _ => {
                    return Err(CompileError::Table(format!(
                        "unexpected operator {:?} in postfix regex",
                        op
                    )))
                }
            },
        }
    }

    match (stack.pop(), stack.is_empty()) {
        (Some(nfa), true) => Ok(nfa),
        _ => Err(CompileError::Table(
            "regex did not reduce to a single automaton".to_string(),
        )),
    }
}

/// Compile one lexer-rule regex into an NFA.
pub fn compile_regex(regex: &str) -> Result<Nfa, CompileError> {
    let expanded = expand_shorthand(regex);
    let toks = tokenize(&expanded)?;
    let toks = insert_concat(&toks);
    let postfix = to_postfix(&toks)?;
    build_nfa(&postfix)
}
