use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::nfa::Nfa;
use super::{AcceptAction, Alpha, Transition};
use crate::error::CompileError;

/// Deterministic finite automaton produced by subset construction.
#[derive(Debug, Clone)]
pub struct Dfa {
    pub desc: String,
    pub alphabet: Vec<Alpha>,
    pub start: usize,
    pub accepts: Vec<usize>,
    pub table: Vec<Vec<Transition>>,
    pub accept_actions: HashMap<usize, AcceptAction>,
}

impl Dfa {
    /// Subset construction. The initial DFA state is the ε-closure of the
    /// NFA start set; state sets are deduplicated by set equality. When a
    /// state has NFA `Any` edges, concrete transitions whose target equals
    /// the any-target are dropped as redundant; if any concrete transition
    /// survives, the any-target becomes an `Other` fallback edge instead.
    pub fn from_nfa(nfa: &Nfa, desc: &str) -> Dfa {
        let concrete: Vec<(usize, char)> = nfa
            .alphabet
            .iter()
            .enumerate()
            .filter_map(|(i, a)| match a {
                Alpha::Char(c) => Some((i, *c)),
                _ => None,
            })
            .collect();
        let any_index = nfa.alphabet.iter().position(|a| *a == Alpha::Any);

        let initial = nfa.epsilon_closure(&nfa.starts.iter().copied().collect());
        let mut sets: Vec<BTreeSet<usize>> = vec![initial.clone()];
        let mut index_of: HashMap<BTreeSet<usize>, usize> = HashMap::new();
        index_of.insert(initial, 0);

        let mut alphabet: Vec<Alpha> = Vec::new();
        let mut table: Vec<Vec<Transition>> = vec![Vec::new()];
        let mut worklist = vec![0usize];

        let alpha_index = |alphabet: &mut Vec<Alpha>, alpha: Alpha| -> usize {
            match alphabet.iter().position(|a| *a == alpha) {
                Some(i) => i,
                None => {
                    alphabet.push(alpha);
                    alphabet.len() - 1
                }
            }
        };

        while let Some(current) = worklist.pop() {
            let set = sets[current].clone();

            let any_target: BTreeSet<usize> = match any_index {
                Some(ai) => nfa.epsilon_closure(&nfa.move_set(&set, ai)),
                None => BTreeSet::new(),
            };

            // Concrete successors; `Any` edges also fire for every
            // non-newline character.
            let mut edges: Vec<(Alpha, BTreeSet<usize>)> = Vec::new();
            for (ci, c) in &concrete {
                let mut moved = nfa.move_set(&set, *ci);
                if *c != '\n' {
                    moved.extend(any_target.iter().copied());
                }
                if moved.is_empty() {
                    continue;
                }
                let closed = nfa.epsilon_closure(&moved);
                if !any_target.is_empty() && closed == any_target {
                    continue; // subsumed by the any-edge
                }
                edges.push((Alpha::Char(*c), closed));
            }

            if !any_target.is_empty() {
                let fallback = if edges.is_empty() {
                    Alpha::Any
                } else {
                    Alpha::Other
                };
                edges.push((fallback, any_target));
            }

            for (alpha, target_set) in edges {
                let target = match index_of.get(&target_set) {
                    Some(&i) => i,
                    None => {
                        let i = sets.len();
                        sets.push(target_set.clone());
                        index_of.insert(target_set, i);
                        table.push(Vec::new());
                        worklist.push(i);
                        i
                    }
                };
                let alpha = alpha_index(&mut alphabet, alpha);
                table[current].push(Transition { alpha, target });
            }
        }

        let mut accepts = Vec::new();
        let mut accept_actions = HashMap::new();
        for (i, set) in sets.iter().enumerate() {
            let mut best: Option<&AcceptAction> = None;
            for state in set {
                if nfa.accepts.contains(state) {
                    if let Some(action) = nfa.accept_actions.get(state) {
                        // Lowest order wins on merged accepting states.
                        if best.map_or(true, |b| action.order < b.order) {
                            best = Some(action);
                        }
                    }
                    if !accepts.contains(&i) {
                        accepts.push(i);
                    }
                }
            }
            if let Some(action) = best {
                accept_actions.insert(i, action.clone());
            }
        }

        Dfa {
            desc: desc.to_string(),
            alphabet,
            start: 0,
            accepts,
            table,
            accept_actions,
        }
    }

    /// Runtime transition: concrete edge first, then the any-edge, then the
    /// other-char fallback. Both fallbacks derive from NFA any-edges during
    /// construction, so neither fires on newline.
    pub fn next_state(&self, state: usize, c: char) -> Option<usize> {
        let row = &self.table[state];
        let mut any = None;
        let mut other = None;
        for edge in row {
            match self.alphabet[edge.alpha] {
                Alpha::Char(a) if a == c => return Some(edge.target),
                Alpha::Any => any = Some(edge.target),
                Alpha::Other => other = Some(edge.target),
                _ => {}
            }
        }
        if c == '\n' {
            return None;
        }
        any.or(other)
    }

    pub fn is_accepting(&self, state: usize) -> bool {
        self.accepts.contains(&state)
    }

    pub fn action(&self, state: usize) -> Option<&AcceptAction> {
        self.accept_actions.get(&state)
    }

    /// Whole-string acceptance, used by the NFA/DFA equivalence tests.
    pub fn accepts_str(&self, s: &str) -> bool {
        let mut state = self.start;
        for c in s.chars() {
            match self.next_state(state, c) {
                Some(next) => state = next,
                None => return false,
            }
        }
        self.is_accepting(state)
    }

    pub fn to_json(&self) -> String {
        let doc = NewSchema::from(self);
        serde_json::to_string_pretty(&doc).unwrap_or_default()
    }

    /// Load from either the current or the legacy JSON schema.
    pub fn from_json(json: &str) -> Result<Dfa, CompileError> {
        if let Ok(doc) = serde_json::from_str::<NewSchema>(json) {
            return Ok(doc.into_dfa());
        }
        match serde_json::from_str::<LegacySchema>(json) {
            Ok(doc) => Ok(doc.into_dfa()),
            Err(e) => Err(CompileError::Table(format!(
                "DFA JSON matches neither schema: {}",
                e
            ))),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StateAction {
    #[serde(rename = "stateIndex")]
    state_index: usize,
    action: AcceptAction,
}

#[derive(Serialize, Deserialize)]
struct NewSchema {
    desc: String,
    #[serde(rename = "symbolSet")]
    symbol_set: Vec<String>,
    #[serde(rename = "stateCount")]
    state_count: usize,
    #[serde(rename = "initialStateIndices")]
    initial_state_indices: Vec<usize>,
    #[serde(rename = "acceptingStateIndices")]
    accepting_state_indices: Vec<usize>,
    #[serde(rename = "transitionTable")]
    transition_table: Vec<Vec<NewEdge>>,
    #[serde(rename = "acceptingStateActions")]
    accepting_state_actions: Vec<StateAction>,
}

#[derive(Serialize, Deserialize)]
struct NewEdge {
    #[serde(rename = "inputSymbol")]
    input_symbol: usize,
    #[serde(rename = "targetStateIndex")]
    target_state_index: usize,
}

impl NewSchema {
    fn from(dfa: &Dfa) -> NewSchema {
        NewSchema {
            desc: dfa.desc.clone(),
            symbol_set: dfa.alphabet.iter().map(Alpha::encode).collect(),
            state_count: dfa.table.len(),
            initial_state_indices: vec![dfa.start],
            accepting_state_indices: dfa.accepts.clone(),
            transition_table: dfa
                .table
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|e| NewEdge {
                            input_symbol: e.alpha,
                            target_state_index: e.target,
                        })
                        .collect()
                })
                .collect(),
            accepting_state_actions: {
                let mut actions: Vec<StateAction> = dfa
                    .accept_actions
                    .iter()
                    .map(|(state, action)| StateAction {
                        state_index: *state,
                        action: action.clone(),
                    })
                    .collect();
                actions.sort_by_key(|a| a.state_index);
                actions
            },
        }
    }

    fn into_dfa(self) -> Dfa {
        Dfa {
            desc: self.desc,
            alphabet: self.symbol_set.iter().map(|s| Alpha::decode(s)).collect(),
            start: self.initial_state_indices.first().copied().unwrap_or(0),
            accepts: self.accepting_state_indices,
            table: self
                .transition_table
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|e| Transition {
                            alpha: e.input_symbol,
                            target: e.target_state_index,
                        })
                        .collect()
                })
                .collect(),
            accept_actions: self
                .accepting_state_actions
                .into_iter()
                .map(|a| (a.state_index, a.action))
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct LegacySchema {
    #[serde(default)]
    desc: String,
    alphabet: Vec<String>,
    #[serde(rename = "startStatesIndex")]
    start_states_index: Vec<usize>,
    #[serde(rename = "acceptStatesIndex")]
    accept_states_index: Vec<usize>,
    #[serde(rename = "transformAdjList")]
    transform_adj_list: Vec<Vec<LegacyEdge>>,
    #[serde(rename = "acceptActionMap")]
    accept_action_map: Vec<LegacyAction>,
}

#[derive(Deserialize)]
struct LegacyEdge {
    alpha: usize,
    target: usize,
}

#[derive(Deserialize)]
struct LegacyAction {
    // Field name preserved from the legacy producer, typo included.
    #[serde(rename = "accpetStateIndex")]
    accept_state_index: usize,
    action: AcceptAction,
}

impl LegacySchema {
    fn into_dfa(self) -> Dfa {
        Dfa {
            desc: self.desc,
            alphabet: self.alphabet.iter().map(|s| Alpha::decode(s)).collect(),
            start: self.start_states_index.first().copied().unwrap_or(0),
            accepts: self.accept_states_index,
            table: self
                .transform_adj_list
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|e| Transition {
                            alpha: e.alpha,
                            target: e.target,
                        })
                        .collect()
                })
                .collect(),
            accept_actions: self
                .accept_action_map
                .into_iter()
                .map(|a| (a.accept_state_index, a.action))
                .collect(),
        }
    }
}
