use crate::automata::dfa::Dfa;
use crate::error::{CompileError, ErrorBag};

/// Synthetic terminator appended to every token stream.
pub const TOKEN_END: &str = "SP_END";

/// Token names the parser discards before driving the tables.
pub const TOKEN_COMMENT: &str = "_COMMENT";
pub const TOKEN_WHITESPACE: &str = "_WHITESPACE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub name: String,
    pub literal: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(name: &str, literal: &str, line: usize, column: usize) -> Token {
        Token {
            name: name.to_string(),
            literal: literal.to_string(),
            line,
            column,
        }
    }
}

/// Extract the token name from an accept action of the form `return NAME;`.
/// Actions of any other shape produce no token (the rule matches and the
/// lexeme is dropped).
fn token_name(action: &str) -> Option<String> {
    let body = action.trim();
    let rest = body.strip_prefix("return")?;
    let rest = rest.strip_suffix(';').unwrap_or(rest.trim_end());
    let name = rest.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// DFA executor producing the token stream: longest match with trailing
/// rollback, lowest-order tie-breaking baked into the DFA's accept actions.
pub struct Lexer<'a> {
    dfa: &'a Dfa,
}

struct Checkpoint {
    state: usize,
    /// Position one past the last character of the accepted lexeme.
    pos: usize,
    line: usize,
    line_start: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(dfa: &'a Dfa) -> Lexer<'a> {
        Lexer { dfa }
    }

    /// Tokenize `source`. With `bag` set, lexical errors are collected and
    /// the offending characters skipped; without it the first error aborts.
    pub fn tokenize(
        &self,
        source: &str,
        mut bag: Option<&mut ErrorBag>,
    ) -> Result<Vec<Token>, CompileError> {
        let source = source.replace("\r\n", "\n");
        let chars: Vec<char> = source.chars().collect();

        let mut tokens = Vec::new();
        let mut pos = 0usize;
        let mut line = 1usize;
        let mut line_start = 0usize;

        while pos < chars.len() {
            let token_line = line;
            let token_column = pos - line_start + 1;

            let mut state = self.dfa.start;
            let mut scan = pos;
            let mut scan_line = line;
            let mut scan_line_start = line_start;
            let mut last_accept: Option<Checkpoint> = None;

            while scan < chars.len() {
                let c = chars[scan];
                match self.dfa.next_state(state, c) {
                    Some(next) => {
                        state = next;
                        scan += 1;
                        if c == '\n' {
                            scan_line += 1;
                            scan_line_start = scan;
                        }
                        if self.dfa.is_accepting(state) {
                            last_accept = Some(Checkpoint {
                                state,
                                pos: scan,
                                line: scan_line,
                                line_start: scan_line_start,
                            });
                        }
                    }
                    None => break,
                }
            }

            match last_accept {
                Some(cp) => {
                    // Roll the stream back to the last accepted prefix.
                    let lexeme: String = chars[pos..cp.pos].iter().collect();
                    if let Some(action) = self.dfa.action(cp.state) {
                        if let Some(name) = token_name(&action.code) {
                            tokens.push(Token::new(&name, &lexeme, token_line, token_column));
                        }
                    }
                    pos = cp.pos;
                    line = cp.line;
                    line_start = cp.line_start;
                }
                None => {
                    let c = chars[pos];
                    if c.is_whitespace() {
                        if c == '\n' {
                            line += 1;
                            line_start = pos + 1;
                        }
                        pos += 1;
                        continue;
                    }
                    let err = CompileError::Lexical {
                        line: token_line,
                        column: token_column,
                        ch: c,
                    };
                    match bag.as_deref_mut() {
                        Some(bag) => {
                            bag.push(err);
                            pos += 1;
                        }
                        None => return Err(err),
                    }
                }
            }
        }

        tokens.push(Token::new(TOKEN_END, "", line, 1));
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexgen::{build_dfa, parse_lex};

    const LEX: &str = r#"%%
"int"                       { return INT; }
"if"                        { return IF; }
"=="                        { return EQ_OP; }
=                           { return ASSIGN; }
;                           { return SEMICOLON; }
[a-zA-Z_][a-zA-Z0-9_]*      { return IDENTIFIER; }
[0-9]+                      { return CONSTANT; }
//[^\n]*                    { return _COMMENT; }
[ \t\n]+                    { return _WHITESPACE; }
%%
"#;

    fn tokenize(source: &str) -> Vec<Token> {
        let dfa = build_dfa(&parse_lex(LEX).unwrap(), "test").unwrap();
        Lexer::new(&dfa).tokenize(source, None).unwrap()
    }

    fn names(tokens: &[Token]) -> Vec<String> {
        tokens.iter().map(|t| t.name.clone()).collect()
    }

    #[test]
    fn keywords_beat_identifiers() {
        let toks = tokenize("int i;");
        assert_eq!(
            names(&toks),
            vec!["INT", "_WHITESPACE", "IDENTIFIER", "SEMICOLON", "SP_END"]
        );
        assert_eq!(toks[2].literal, "i");
    }

    #[test]
    fn longest_match_wins() {
        // `==` must not lex as two ASSIGN tokens, `ifx` not as IF + x.
        let toks = tokenize("a==ifx");
        assert_eq!(
            names(&toks),
            vec!["IDENTIFIER", "EQ_OP", "IDENTIFIER", "SP_END"]
        );
        assert_eq!(toks[2].literal, "ifx");
    }

    #[test]
    fn positions_track_lines_and_columns() {
        let toks = tokenize("int a;\nint b;");
        let b = toks
            .iter()
            .find(|t| t.name == "IDENTIFIER" && t.literal == "b")
            .unwrap();
        assert_eq!((b.line, b.column), (2, 5));
    }

    #[test]
    fn crlf_is_normalized() {
        let toks = tokenize("int a;\r\nint b;");
        let b = toks
            .iter()
            .find(|t| t.name == "IDENTIFIER" && t.literal == "b")
            .unwrap();
        assert_eq!(b.line, 2);
    }

    #[test]
    fn comment_is_a_token() {
        let toks = tokenize("a // trailing\nb");
        assert!(toks.iter().any(|t| t.name == TOKEN_COMMENT));
    }

    #[test]
    fn rollback_after_partial_match() {
        // `=` followed by something that is not `=` must roll back to the
        // one-character ASSIGN match.
        let toks = tokenize("a=b");
        assert_eq!(
            names(&toks),
            vec!["IDENTIFIER", "ASSIGN", "IDENTIFIER", "SP_END"]
        );
    }

    #[test]
    fn bad_character_throws_without_bag() {
        let dfa = build_dfa(&parse_lex(LEX).unwrap(), "test").unwrap();
        let err = Lexer::new(&dfa).tokenize("a @ b", None).unwrap_err();
        match err {
            CompileError::Lexical { line, column, ch } => {
                assert_eq!((line, column, ch), (1, 3, '@'));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn bad_characters_collect_into_bag() {
        let dfa = build_dfa(&parse_lex(LEX).unwrap(), "test").unwrap();
        let mut bag = ErrorBag::new();
        let toks = Lexer::new(&dfa)
            .tokenize("a @ # b", Some(&mut bag))
            .unwrap();
        assert_eq!(bag.len(), 2);
        assert_eq!(
            names(&toks),
            vec!["IDENTIFIER", "_WHITESPACE", "_WHITESPACE", "_WHITESPACE", "IDENTIFIER", "SP_END"]
        );
    }

    #[test]
    fn stream_ends_with_sp_end() {
        let toks = tokenize("");
        assert_eq!(names(&toks), vec!["SP_END"]);
    }
}
