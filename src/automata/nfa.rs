use std::collections::{BTreeSet, HashMap};

use super::{merge_alphabets, AcceptAction, Alpha, Transition};

/// Nondeterministic finite automaton built by Thompson construction.
///
/// States are plain indices into the transition table. Several start
/// states are allowed because the lexer-level union of rule automata keeps
/// every operand's accepting states (and their actions) intact.
#[derive(Debug, Clone)]
pub struct Nfa {
    pub alphabet: Vec<Alpha>,
    pub starts: Vec<usize>,
    pub accepts: Vec<usize>,
    pub table: Vec<Vec<Transition>>,
    pub accept_actions: HashMap<usize, AcceptAction>,
}

impl Nfa {
    /// Two-state automaton accepting exactly one occurrence of `alpha`.
    pub fn atom(alpha: Alpha) -> Nfa {
        Nfa {
            alphabet: vec![alpha],
            starts: vec![0],
            accepts: vec![1],
            table: vec![vec![Transition { alpha: 0, target: 1 }], vec![]],
            accept_actions: HashMap::new(),
        }
    }

    pub fn state_count(&self) -> usize {
        self.table.len()
    }

    fn alpha_index(&mut self, alpha: Alpha) -> usize {
        match self.alphabet.iter().position(|a| *a == alpha) {
            Some(i) => i,
            None => {
                self.alphabet.push(alpha);
                self.alphabet.len() - 1
            }
        }
    }

    fn add_edge(&mut self, from: usize, alpha: Alpha, to: usize) {
        let alpha = self.alpha_index(alpha);
        let edge = Transition { alpha, target: to };
        if !self.table[from].contains(&edge) {
            self.table[from].push(edge);
        }
    }

    /// Append `other`'s states to `self`, remapping both transition tables
    /// onto the merged alphabet. Returns the state-index offset applied to
    /// `other`.
    fn absorb(&mut self, other: &Nfa) -> usize {
        let (merged, map_self, map_other) = merge_alphabets(&self.alphabet, &other.alphabet);
        let offset = self.state_count();

        for row in self.table.iter_mut() {
            for edge in row.iter_mut() {
                edge.alpha = map_self[edge.alpha];
            }
        }
        for row in &other.table {
            let remapped = row
                .iter()
                .map(|e| Transition {
                    alpha: map_other[e.alpha],
                    target: e.target + offset,
                })
                .collect();
            self.table.push(remapped);
        }
        self.alphabet = merged;

        for (state, action) in &other.accept_actions {
            self.accept_actions.insert(state + offset, action.clone());
        }

        offset
    }

    /// Regex alternation: fresh start and accept states with ε-edges
    /// to and from both operands.
    pub fn alternate(a: Nfa, b: Nfa) -> Nfa {
        let mut out = a;
        let offset = out.absorb(&b);

        let b_starts: Vec<usize> = b.starts.iter().map(|s| s + offset).collect();
        let b_accepts: Vec<usize> = b.accepts.iter().map(|s| s + offset).collect();

        let start = out.state_count();
        let accept = start + 1;
        out.table.push(vec![]);
        out.table.push(vec![]);

        for s in out.starts.clone().iter().chain(b_starts.iter()) {
            out.add_edge(start, Alpha::Epsilon, *s);
        }
        for a in out.accepts.clone().iter().chain(b_accepts.iter()) {
            out.add_edge(*a, Alpha::Epsilon, accept);
        }

        out.starts = vec![start];
        out.accepts = vec![accept];
        out
    }

    /// Concatenation: ε-edges from the first operand's accepting states to
    /// the second's start states.
    pub fn concat(a: Nfa, b: Nfa) -> Nfa {
        let mut out = a;
        let offset = out.absorb(&b);

        for accept in out.accepts.clone() {
            for start in &b.starts {
                out.add_edge(accept, Alpha::Epsilon, start + offset);
            }
        }

        out.accepts = b.accepts.iter().map(|s| s + offset).collect();
        out
    }

    /// Kleene closure with fresh start and accept states.
    pub fn kleene(a: Nfa) -> Nfa {
        let mut out = a;
        let old_starts = out.starts.clone();
        let old_accepts = out.accepts.clone();

        let start = out.state_count();
        let accept = start + 1;
        out.table.push(vec![]);
        out.table.push(vec![]);

        out.add_edge(start, Alpha::Epsilon, accept);
        for s in &old_starts {
            out.add_edge(start, Alpha::Epsilon, *s);
        }
        for a in &old_accepts {
            out.add_edge(*a, Alpha::Epsilon, accept);
            for s in &old_starts {
                out.add_edge(*a, Alpha::Epsilon, *s);
            }
        }

        out.starts = vec![start];
        out.accepts = vec![accept];
        out
    }

    /// One-or-more, rewritten as `AA*`.
    pub fn plus(a: Nfa) -> Nfa {
        let copy = a.clone();
        Nfa::concat(a, Nfa::kleene(copy))
    }

    /// Zero-or-one: ε-edge from every start to every accept.
    pub fn question(a: Nfa) -> Nfa {
        let mut out = a;
        for s in out.starts.clone() {
            for acc in out.accepts.clone() {
                out.add_edge(s, Alpha::Epsilon, acc);
            }
        }
        out
    }

    /// Lexer-level union of whole rule automata: one fresh start state with
    /// ε-edges to every operand start; accepting states and their actions
    /// migrate unchanged.
    pub fn union_many(parts: Vec<Nfa>) -> Nfa {
        let mut iter = parts.into_iter();
        let mut out = match iter.next() {
            Some(first) => first,
            None => Nfa::atom(Alpha::Epsilon),
        };

        for part in iter {
            let offset = out.absorb(&part);
            out.starts.extend(part.starts.iter().map(|s| s + offset));
            out.accepts.extend(part.accepts.iter().map(|s| s + offset));
        }

        let start = out.state_count();
        out.table.push(vec![]);
        for s in out.starts.clone() {
            out.add_edge(start, Alpha::Epsilon, s);
        }
        out.starts = vec![start];
        out
    }

    pub fn set_accept_action(&mut self, action: AcceptAction) {
        for accept in &self.accepts {
            self.accept_actions.insert(*accept, action.clone());
        }
    }

    /// States reachable from `set` using only ε-edges, `set` included.
    pub fn epsilon_closure(&self, set: &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut closure = set.clone();
        let mut worklist: Vec<usize> = set.iter().copied().collect();

        while let Some(state) = worklist.pop() {
            for edge in &self.table[state] {
                if self.alphabet[edge.alpha] == Alpha::Epsilon && closure.insert(edge.target) {
                    worklist.push(edge.target);
                }
            }
        }
        closure
    }

    /// Targets reachable from `set` over edges labeled with the alphabet
    /// entry at `alpha`, without closing over ε.
    pub fn move_set(&self, set: &BTreeSet<usize>, alpha: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        for state in set {
            for edge in &self.table[*state] {
                if edge.alpha == alpha {
                    out.insert(edge.target);
                }
            }
        }
        out
    }

    /// Simulation used by the equivalence tests: does the NFA accept `s`?
    pub fn accepts(&self, s: &str) -> bool {
        let mut current = self.epsilon_closure(&self.starts.iter().copied().collect());

        for c in s.chars() {
            let mut next = BTreeSet::new();
            for state in &current {
                for edge in &self.table[*state] {
                    let matched = match self.alphabet[edge.alpha] {
                        Alpha::Char(a) => a == c,
                        Alpha::Any => c != '\n',
                        _ => false,
                    };
                    if matched {
                        next.insert(edge.target);
                    }
                }
            }
            current = self.epsilon_closure(&next);
            if current.is_empty() {
                return false;
            }
        }

        current.iter().any(|s| self.accepts.contains(s))
    }
}
