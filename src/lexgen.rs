use crate::automata::dfa::Dfa;
use crate::automata::nfa::Nfa;
use crate::automata::regex::compile_regex;
use crate::automata::AcceptAction;
use crate::error::CompileError;

/// One rule of a lexical definition: a regex, the opaque action text that
/// runs when it matches, and its position in the file (used to break
/// longest-match ties: lowest order wins).
#[derive(Debug, Clone)]
pub struct LexRule {
    pub regex: String,
    pub action: String,
    pub order: usize,
}

#[derive(Debug, Clone)]
pub struct LexFile {
    pub rules: Vec<LexRule>,
}

/// Parse a classic lex definition: `%{ … %}` copy block and `%`-prefixed
/// declarations, `%%`, rules of the form `regex { action }`, `%%`, footer.
/// Only the rules section matters to the DFA build; the copy block and the
/// footer are host-language code and are skipped.
pub fn parse_lex(source: &str) -> Result<LexFile, CompileError> {
    let source = source.replace("\r\n", "\n");
    let mut markers = Vec::new();
    for (i, line) in source.lines().enumerate() {
        if line.trim() == "%%" {
            markers.push(i);
        }
    }
    if markers.is_empty() {
        return Err(CompileError::Table(
            "lex file has no %% rules section".to_string(),
        ));
    }

    let lines: Vec<&str> = source.lines().collect();
    let rules_end = markers.get(1).copied().unwrap_or(lines.len());
    let rules_text = lines[markers[0] + 1..rules_end].join("\n");

    let mut rules = Vec::new();
    let bytes: Vec<char> = rules_text.chars().collect();

    let mut i = 0usize;
    while i < bytes.len() {
        // Skip blank space between rules.
        while i < bytes.len() && bytes[i].is_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        // The regex runs until unguarded whitespace. Quotes and bracket
        // classes guard the characters inside them; a backslash guards the
        // next character.
        let start = i;
        let mut in_quote = false;
        let mut in_class = false;
        while i < bytes.len() {
            let c = bytes[i];
            if c == '\\' {
                i += 2;
                continue;
            }
            match c {
                '"' if !in_class => in_quote = !in_quote,
                '[' if !in_quote => in_class = true,
                ']' if !in_quote => in_class = false,
                _ if c.is_whitespace() && !in_quote && !in_class => break,
                _ => {}
            }
            i += 1;
        }
        let regex: String = bytes[start..i.min(bytes.len())].iter().collect();

        // Action block: `{ … }` with nesting.
        while i < bytes.len() && bytes[i].is_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != '{' {
            return Err(CompileError::Table(format!(
                "lex rule {:?} has no action block",
                regex
            )));
        }
        let mut depth = 0usize;
        let action_start = i + 1;
        let mut action_end = action_start;
        while i < bytes.len() {
            match bytes[i] {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        action_end = i;
                        i += 1;
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        if depth != 0 {
            return Err(CompileError::Table(format!(
                "unterminated action block for lex rule {:?}",
                regex
            )));
        }
        let action: String = bytes[action_start..action_end].iter().collect();

        let order = rules.len();
        rules.push(LexRule {
            regex,
            action: action.trim().to_string(),
            order,
        });
    }

    if rules.is_empty() {
        return Err(CompileError::Table("lex file defines no rules".to_string()));
    }
    Ok(LexFile { rules })
}

/// Compile every rule to an NFA carrying its action, union them keeping all
/// accepting states, and determinize.
pub fn build_dfa(lex: &LexFile, desc: &str) -> Result<Dfa, CompileError> {
    let mut parts = Vec::with_capacity(lex.rules.len());
    for rule in &lex.rules {
        let mut nfa = compile_regex(&rule.regex)
            .map_err(|e| CompileError::Table(format!("in rule {:?}: {}", rule.regex, e)))?;
        nfa.set_accept_action(AcceptAction {
            order: rule.order,
            code: rule.action.clone(),
        });
        parts.push(nfa);
    }
    Ok(Dfa::from_nfa(&Nfa::union_many(parts), desc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL_LEX: &str = r#"%{
/* host prologue, skipped */
%}
%option nothing
%%
"while"             { return WHILE; }
[a-zA-Z_][a-zA-Z0-9_]*  { return IDENTIFIER; }
[0-9]+              { return CONSTANT; }
[ \t\n]+            { return _WHITESPACE; }
%%
footer, skipped
"#;

    #[test]
    fn parses_rules_in_order() {
        let lex = parse_lex(SMALL_LEX).unwrap();
        assert_eq!(lex.rules.len(), 4);
        assert_eq!(lex.rules[0].regex, "\"while\"");
        assert_eq!(lex.rules[0].action, "return WHILE;");
        assert_eq!(lex.rules[2].order, 2);
    }

    #[test]
    fn regex_may_contain_guarded_spaces() {
        let lex = parse_lex("%%\n\" \"  { return SPACE; }\n[ \t]+ { return WS; }\n%%\n").unwrap();
        assert_eq!(lex.rules[0].regex, "\" \"");
        assert_eq!(lex.rules[1].regex, "[ \t]+");
    }

    #[test]
    fn missing_action_is_an_error() {
        assert!(parse_lex("%%\n[0-9]+\n%%\n").is_err());
    }

    #[test]
    fn built_dfa_prefers_earlier_rule() {
        let lex = parse_lex(SMALL_LEX).unwrap();
        let dfa = build_dfa(&lex, "small").unwrap();

        let run = |s: &str| {
            let mut state = dfa.start;
            for c in s.chars() {
                state = dfa.next_state(state, c).unwrap();
            }
            dfa.action(state).unwrap().code.clone()
        };

        assert_eq!(run("while"), "return WHILE;");
        assert_eq!(run("whilex"), "return IDENTIFIER;");
        assert_eq!(run("123"), "return CONSTANT;");
    }
}
