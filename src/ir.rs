use std::fmt;

/// Prefix of every variable id handed out by the IR generator. Ids are
/// globally unique; user-level names are scoped.
pub const VAR_PREFIX: &str = "_var_";

/// The closed quadruple op alphabet, kept as plain text because binary and
/// unary ops flow straight through from the grammar's token names.
pub const BINARY_OPS: &[&str] = &[
    "OR_OP", "AND_OP", "EQ_OP", "NE_OP", "GT_OP", "LT_OP", "GE_OP", "LE_OP", "PLUS", "MINUS",
    "MULTIPLY", "SLASH", "PERCENT", "BITAND_OP", "BITOR_OP", "BITXOR_OP", "LEFT_OP", "RIGHT_OP",
];

pub const UNARY_OPS: &[&str] = &["NOT_OP", "MINUS", "PLUS", "DOLLAR", "BITINV_OP"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiniCType {
    Int,
    Void,
    Str,
}

impl MiniCType {
    pub fn parse(spelling: &str) -> Option<MiniCType> {
        match spelling {
            "int" => Some(MiniCType::Int),
            "void" => Some(MiniCType::Void),
            "string" => Some(MiniCType::Str),
            _ => None,
        }
    }
}

impl fmt::Display for MiniCType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MiniCType::Int => "int",
            MiniCType::Void => "void",
            MiniCType::Str => "string",
        })
    }
}

/// Three-address instruction: (op, arg1, arg2, result). Operands are
/// variable ids, function names, label names, literals, or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quad {
    pub op: String,
    pub arg1: String,
    pub arg2: String,
    pub res: String,
}

impl Quad {
    pub fn new(op: &str, arg1: &str, arg2: &str, res: &str) -> Quad {
        Quad {
            op: op.to_string(),
            arg1: arg1.to_string(),
            arg2: arg2.to_string(),
            res: res.to_string(),
        }
    }

    /// Call arguments travel joined by `&` in `arg2`.
    pub fn call_args(&self) -> Vec<&str> {
        if self.arg2.is_empty() {
            Vec::new()
        } else {
            self.arg2.split('&').collect()
        }
    }

    pub fn is_jump(&self) -> bool {
        self.op == "j" || self.op == "j_false"
    }
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.op, self.arg1, self.arg2, self.res)
    }
}

/// Scope paths are integer sequences; the global scope is `[0]` and a
/// scope contains another iff it is a prefix of it.
pub fn scope_contains(outer: &[usize], inner: &[usize]) -> bool {
    inner.len() >= outer.len() && inner[..outer.len()] == *outer
}

pub const GLOBAL_SCOPE: &[usize] = &[0];

#[derive(Debug, Clone)]
pub struct IrVar {
    pub id: String,
    pub name: String,
    pub ty: MiniCType,
    pub scope: Vec<usize>,
    pub initialized: bool,
}

impl IrVar {
    /// Compiler-generated temporaries reuse their id as their name.
    pub fn is_temp(&self) -> bool {
        self.name.starts_with(VAR_PREFIX)
    }

    pub fn is_global(&self) -> bool {
        self.scope == GLOBAL_SCOPE
    }
}

/// Arrays live at global scope only; as function parameters they are
/// passed by reference and occupy a single slot.
#[derive(Debug, Clone)]
pub struct IrArray {
    pub id: String,
    pub name: String,
    pub elem_ty: MiniCType,
    pub len: usize,
    pub scope: Vec<usize>,
}

impl IrArray {
    pub fn is_global(&self) -> bool {
        self.scope == GLOBAL_SCOPE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrParam {
    Scalar(String),
    Array(String),
}

impl IrParam {
    pub fn id(&self) -> &str {
        match self {
            IrParam::Scalar(id) | IrParam::Array(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IrFunc {
    pub name: String,
    pub ret_ty: MiniCType,
    pub params: Vec<IrParam>,
    pub entry_label: String,
    pub exit_label: String,
    pub scope: Vec<usize>,
    pub has_return: bool,
    pub is_interrupt: bool,
    pub local_vars: Vec<String>,
    pub child_functions: Vec<String>,
}

/// `interruptServer0` through `interruptServer4` are interrupt handlers.
pub fn is_interrupt_name(name: &str) -> bool {
    match name.strip_prefix("interruptServer") {
        Some(rest) => rest.len() == 1 && matches!(rest.as_bytes()[0], b'0'..=b'4'),
        None => false,
    }
}

/// A maximal straight-line run of quadruples; the first instruction is a
/// leader.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: usize,
    /// Index of the leader in the flat instruction list.
    pub start: usize,
    pub quads: Vec<Quad>,
}

/// Everything the code generator consumes.
#[derive(Debug, Clone, Default)]
pub struct IrProgram {
    pub quads: Vec<Quad>,
    pub blocks: Vec<BasicBlock>,
    pub vars: Vec<IrVar>,
    pub arrays: Vec<IrArray>,
    pub funcs: Vec<IrFunc>,
}

impl IrProgram {
    pub fn var(&self, id: &str) -> Option<&IrVar> {
        self.vars.iter().find(|v| v.id == id)
    }

    pub fn array(&self, id: &str) -> Option<&IrArray> {
        self.arrays.iter().find(|a| a.id == id)
    }

    pub fn func(&self, name: &str) -> Option<&IrFunc> {
        self.funcs.iter().find(|f| f.name == name)
    }

    pub fn global_vars(&self) -> impl Iterator<Item = &IrVar> {
        self.vars.iter().filter(|v| v.is_global() && !v.is_temp())
    }

    pub fn global_arrays(&self) -> impl Iterator<Item = &IrArray> {
        self.arrays.iter().filter(|a| a.is_global())
    }

    /// Quadruple index range `[entry, exit]` of a function's body.
    pub fn func_range(&self, func: &IrFunc) -> Option<(usize, usize)> {
        let entry = self
            .quads
            .iter()
            .position(|q| q.op == "set_label" && q.res == func.entry_label)?;
        let exit = self
            .quads
            .iter()
            .position(|q| q.op == "set_label" && q.res == func.exit_label)?;
        Some((entry, exit))
    }

    pub fn dump_quads(&self) -> String {
        let mut out = String::new();
        for (i, q) in self.quads.iter().enumerate() {
            out.push_str(&format!("{:4}  {}\n", i, q));
        }
        out
    }

    pub fn dump_blocks(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            out.push_str(&format!("block {} (leader {}):\n", block.id, block.start));
            for q in &block.quads {
                out.push_str(&format!("      {}\n", q));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_prefix_rules() {
        assert!(scope_contains(&[0], &[0]));
        assert!(scope_contains(&[0], &[0, 3, 4]));
        assert!(!scope_contains(&[0, 3], &[0, 4]));
        assert!(!scope_contains(&[0, 3, 4], &[0, 3]));
    }

    #[test]
    fn interrupt_names() {
        assert!(is_interrupt_name("interruptServer0"));
        assert!(is_interrupt_name("interruptServer4"));
        assert!(!is_interrupt_name("interruptServer5"));
        assert!(!is_interrupt_name("interruptServer"));
        assert!(!is_interrupt_name("interruptServer00"));
        assert!(!is_interrupt_name("main"));
    }

    #[test]
    fn call_args_split() {
        let quad = Quad::new("call", "foo", "_var_1&_var_2", "_var_3");
        assert_eq!(quad.call_args(), vec!["_var_1", "_var_2"]);
        let none = Quad::new("call", "foo", "", "");
        assert!(none.call_args().is_empty());
    }

    #[test]
    fn temp_detection() {
        let temp = IrVar {
            id: "_var_7".to_string(),
            name: "_var_7".to_string(),
            ty: MiniCType::Int,
            scope: vec![0, 1],
            initialized: true,
        };
        let named = IrVar {
            id: "_var_8".to_string(),
            name: "x".to_string(),
            ty: MiniCType::Int,
            scope: vec![0, 1],
            initialized: false,
        };
        assert!(temp.is_temp());
        assert!(!named.is_temp());
    }
}
