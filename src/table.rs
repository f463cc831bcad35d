use serde::Deserialize;

use crate::error::CompileError;
use crate::lexer::Token;

/// Grammar symbol kinds as written by the table producer: `token` for
/// named terminals, `ascii` for single-character terminals, `nonterminal`,
/// and `sptoken` for the specials `SP_END` / `SP_EPSILON`.
#[derive(Debug, Clone, Deserialize)]
pub struct GrammarSymbol {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

/// One production: symbol indices for the left and right sides plus the
/// semantic action text executed on reduction.
#[derive(Debug, Clone, Deserialize)]
pub struct Producer {
    #[serde(rename = "_lhs")]
    pub lhs: usize,
    #[serde(rename = "_rhs")]
    pub rhs: Vec<usize>,
    #[serde(rename = "_action")]
    pub action: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionCell {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: i64,
}

/// Decoded ACTION table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseAction {
    Shift(usize),
    Reduce(usize),
    Accept,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableDfa {
    #[serde(rename = "_startStateId")]
    pub start_state_id: usize,
}

/// The LALR(1) automaton as produced by the external grammar tool. The
/// core never builds this; it only drives it.
#[derive(Debug, Clone, Deserialize)]
pub struct LalrTable {
    #[serde(default)]
    pub desc: String,
    pub symbols: Vec<GrammarSymbol>,
    pub producers: Vec<Producer>,
    #[serde(rename = "ACTIONTable")]
    pub action_table: Vec<Vec<ActionCell>>,
    #[serde(rename = "GOTOTable")]
    pub goto_table: Vec<Vec<i64>>,
    pub dfa: TableDfa,
}

impl LalrTable {
    pub fn load(json: &str) -> Result<LalrTable, CompileError> {
        let table: LalrTable = serde_json::from_str(json)
            .map_err(|e| CompileError::Table(format!("bad LALR table JSON: {}", e)))?;
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<(), CompileError> {
        let states = self.action_table.len();
        if self.goto_table.len() != states {
            return Err(CompileError::Table(format!(
                "ACTION table has {} states but GOTO table has {}",
                states,
                self.goto_table.len()
            )));
        }
        if self.dfa.start_state_id >= states {
            return Err(CompileError::Table(format!(
                "start state {} out of range",
                self.dfa.start_state_id
            )));
        }
        for p in &self.producers {
            if p.lhs >= self.symbols.len() {
                return Err(CompileError::Table(format!(
                    "producer lhs {} out of range",
                    p.lhs
                )));
            }
        }
        Ok(())
    }

    pub fn start_state(&self) -> usize {
        self.dfa.start_state_id
    }

    /// Symbol index of a token: named terminals and specials match by
    /// name, single-character `ascii` terminals by their literal.
    pub fn token_symbol(&self, token: &Token) -> Option<usize> {
        self.symbols.iter().position(|s| match s.kind.as_str() {
            "token" | "sptoken" => s.content == token.name,
            "ascii" => s.content == token.literal,
            _ => false,
        })
    }

    pub fn epsilon_symbol(&self) -> Option<usize> {
        self.symbols
            .iter()
            .position(|s| s.kind == "sptoken" && s.content == "SP_EPSILON")
    }

    pub fn symbol_name(&self, index: usize) -> &str {
        self.symbols
            .get(index)
            .map(|s| s.content.as_str())
            .unwrap_or("?")
    }

    pub fn action(&self, state: usize, symbol: usize) -> ParseAction {
        let cell = match self.action_table.get(state).and_then(|row| row.get(symbol)) {
            Some(cell) => cell,
            None => return ParseAction::None,
        };
        match cell.kind.as_str() {
            "shift" => ParseAction::Shift(cell.data as usize),
            "reduce" => ParseAction::Reduce(cell.data as usize),
            "acc" => ParseAction::Accept,
            _ => ParseAction::None,
        }
    }

    pub fn goto(&self, state: usize, symbol: usize) -> Option<usize> {
        match self.goto_table.get(state).and_then(|row| row.get(symbol)) {
            Some(&target) if target >= 0 => Some(target as usize),
            _ => None,
        }
    }

    /// Right-hand-side length of a production, not counting ε entries.
    pub fn rhs_len(&self, producer: &Producer) -> usize {
        let epsilon = self.epsilon_symbol();
        producer
            .rhs
            .iter()
            .filter(|&&s| Some(s) != epsilon)
            .count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Grammar used across the parser tests:
    ///   p0: S -> a S     { $$ = newNode('S', $1, $2); }
    ///   p1: S -> a       { $$ = newNode('S', $1); }
    /// Symbols: 0 = token a (named A), 1 = nonterminal S,
    ///          2 = SP_END, 3 = SP_EPSILON.
    pub(crate) fn tiny_table() -> LalrTable {
        let json = r#"{
            "desc": "right-recursive list of a",
            "symbols": [
                {"type": "token", "content": "A"},
                {"type": "nonterminal", "content": "S"},
                {"type": "sptoken", "content": "SP_END"},
                {"type": "sptoken", "content": "SP_EPSILON"}
            ],
            "producers": [
                {"_lhs": 1, "_rhs": [0, 1], "_action": "$$ = newNode('S', $1, $2);"},
                {"_lhs": 1, "_rhs": [0], "_action": "$$ = newNode('S', $1);"}
            ],
            "ACTIONTable": [
                [{"type": "shift", "data": 2}, {"type": "none", "data": -1}, {"type": "none", "data": -1}, {"type": "none", "data": -1}],
                [{"type": "none", "data": -1}, {"type": "none", "data": -1}, {"type": "acc", "data": -1}, {"type": "none", "data": -1}],
                [{"type": "shift", "data": 2}, {"type": "none", "data": -1}, {"type": "reduce", "data": 1}, {"type": "none", "data": -1}],
                [{"type": "none", "data": -1}, {"type": "none", "data": -1}, {"type": "reduce", "data": 0}, {"type": "none", "data": -1}]
            ],
            "GOTOTable": [
                [-1, 1, -1, -1],
                [-1, -1, -1, -1],
                [-1, 3, -1, -1],
                [-1, -1, -1, -1]
            ],
            "dfa": {"_startStateId": 0}
        }"#;
        LalrTable::load(json).unwrap()
    }

    #[test]
    fn loads_and_decodes() {
        let table = tiny_table();
        assert_eq!(table.start_state(), 0);
        assert_eq!(table.action(0, 0), ParseAction::Shift(2));
        assert_eq!(table.action(2, 2), ParseAction::Reduce(1));
        assert_eq!(table.action(1, 2), ParseAction::Accept);
        assert_eq!(table.action(1, 0), ParseAction::None);
        assert_eq!(table.goto(0, 1), Some(1));
        assert_eq!(table.goto(1, 1), None);
    }

    #[test]
    fn token_lookup_by_name_and_ascii() {
        let table = tiny_table();
        let tok = Token::new("A", "a", 1, 1);
        assert_eq!(table.token_symbol(&tok), Some(0));
        let end = Token::new("SP_END", "", 1, 1);
        assert_eq!(table.token_symbol(&end), Some(2));
        let unknown = Token::new("B", "b", 1, 1);
        assert_eq!(table.token_symbol(&unknown), None);
    }

    #[test]
    fn rhs_len_skips_epsilon() {
        let table = tiny_table();
        let eps_prod = Producer {
            lhs: 1,
            rhs: vec![3],
            action: String::new(),
        };
        assert_eq!(table.rhs_len(&eps_prod), 0);
        assert_eq!(table.rhs_len(&table.producers[0]), 2);
    }

    #[test]
    fn mismatched_tables_rejected() {
        let json = r#"{
            "symbols": [{"type": "sptoken", "content": "SP_END"}],
            "producers": [],
            "ACTIONTable": [[{"type": "none", "data": -1}]],
            "GOTOTable": [],
            "dfa": {"_startStateId": 0}
        }"#;
        assert!(LalrTable::load(json).is_err());
    }
}
