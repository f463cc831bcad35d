use std::collections::HashSet;

use crate::error::CompileError;
use crate::ir::{
    is_interrupt_name, BasicBlock, IrArray, IrFunc, IrParam, IrProgram, IrVar, MiniCType, Quad,
    GLOBAL_SCOPE, VAR_PREFIX,
};
use crate::parser::SyntaxNode;

/// Checks that cannot run while the tree is still being walked (the callee
/// may be declared later in the file). They are replayed against the
/// finished pools before block partitioning.
#[derive(Debug, Clone)]
enum PostCheck {
    Return {
        func: String,
        ty: Option<MiniCType>,
        line: usize,
    },
    Call {
        callee: String,
        argc: usize,
        wants_result: bool,
        line: usize,
    },
}

/// Walks the syntax tree and produces the quadruple program. All state is
/// owned here; nothing survives a `generate` call except the returned
/// `IrProgram`.
pub struct IrGenerator {
    quads: Vec<Quad>,
    vars: Vec<IrVar>,
    arrays: Vec<IrArray>,
    funcs: Vec<IrFunc>,
    scope_path: Vec<usize>,
    scope_seq: usize,
    var_seq: usize,
    label_seq: usize,
    loop_stack: Vec<(String, String)>,
    checks: Vec<PostCheck>,
    current_func: Option<String>,
    asm_callers: HashSet<String>,
}

impl IrGenerator {
    pub fn new() -> IrGenerator {
        let mut gen = IrGenerator {
            quads: Vec::new(),
            vars: Vec::new(),
            arrays: Vec::new(),
            funcs: Vec::new(),
            scope_path: GLOBAL_SCOPE.to_vec(),
            scope_seq: 0,
            var_seq: 0,
            label_seq: 0,
            loop_stack: Vec::new(),
            checks: Vec::new(),
            current_func: None,
            asm_callers: HashSet::new(),
        };

        // `__asm` is predeclared: one string parameter, no body. The
        // parameter is a pool temporary so it never reaches .data.
        let param = gen.new_temp(MiniCType::Str);
        gen.funcs.push(IrFunc {
            name: "__asm".to_string(),
            ret_ty: MiniCType::Void,
            params: vec![IrParam::Scalar(param)],
            entry_label: String::new(),
            exit_label: String::new(),
            scope: GLOBAL_SCOPE.to_vec(),
            has_return: false,
            is_interrupt: false,
            local_vars: Vec::new(),
            child_functions: Vec::new(),
        });
        gen
    }

    pub fn generate(mut self, root: &SyntaxNode) -> Result<IrProgram, CompileError> {
        self.walk_program(root)?;
        self.run_post_checks()?;
        self.fold_asm()?;

        let blocks = partition_blocks(&self.quads);
        Ok(IrProgram {
            quads: self.quads,
            blocks,
            vars: self.vars,
            arrays: self.arrays,
            funcs: self.funcs,
        })
    }

    // ---- bookkeeping ----

    fn enter_scope(&mut self) {
        self.scope_seq += 1;
        self.scope_path.push(self.scope_seq);
    }

    fn exit_scope(&mut self) {
        self.scope_path.pop();
    }

    fn push_var(&mut self, name: &str, ty: MiniCType, initialized: bool) -> String {
        let id = format!("{}{}", VAR_PREFIX, self.var_seq);
        self.var_seq += 1;
        self.vars.push(IrVar {
            id: id.clone(),
            name: name.to_string(),
            ty,
            scope: self.scope_path.clone(),
            initialized,
        });
        id
    }

    fn new_temp(&mut self, ty: MiniCType) -> String {
        let id = format!("{}{}", VAR_PREFIX, self.var_seq);
        self.var_seq += 1;
        self.vars.push(IrVar {
            id: id.clone(),
            name: id.clone(),
            ty,
            scope: self.scope_path.clone(),
            initialized: true,
        });
        id
    }

    fn new_label(&mut self) -> String {
        let label = format!("_label_{}", self.label_seq);
        self.label_seq += 1;
        label
    }

    fn emit(&mut self, op: &str, arg1: &str, arg2: &str, res: &str) {
        self.quads.push(Quad::new(op, arg1, arg2, res));
    }

    /// Leafward-to-rootward lookup along the current scope path.
    fn lookup_var(&self, name: &str) -> Option<usize> {
        for depth in (1..=self.scope_path.len()).rev() {
            let prefix = &self.scope_path[..depth];
            if let Some(i) = self
                .vars
                .iter()
                .position(|v| v.name == name && v.scope == prefix)
            {
                return Some(i);
            }
        }
        None
    }

    fn lookup_array(&self, name: &str) -> Option<&IrArray> {
        for depth in (1..=self.scope_path.len()).rev() {
            let prefix = &self.scope_path[..depth];
            if let Some(a) = self
                .arrays
                .iter()
                .find(|a| a.name == name && a.scope == prefix)
            {
                return Some(a);
            }
        }
        None
    }

    fn current_func_mut(&mut self) -> Option<&mut IrFunc> {
        let name = self.current_func.clone()?;
        self.funcs.iter_mut().find(|f| f.name == name)
    }

    // ---- tree helpers ----

    fn find_child<'n>(&self, node: &'n SyntaxNode, name: &str) -> Option<&'n SyntaxNode> {
        node.children.iter().find(|c| c.name == name)
    }

    fn find_children<'n>(&self, node: &'n SyntaxNode, name: &str) -> Vec<&'n SyntaxNode> {
        node.children.iter().filter(|c| c.name == name).collect()
    }

    fn type_of(&self, node: &SyntaxNode) -> Result<MiniCType, CompileError> {
        let spelling = if node.children.is_empty() {
            node.literal.as_str()
        } else {
            node.child(0).literal.as_str()
        };
        MiniCType::parse(spelling).ok_or_else(|| {
            CompileError::semantic(node.line, format!("unknown type `{}`", spelling))
        })
    }

    // ---- declarations ----

    fn walk_program(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        match node.name.as_str() {
            "program" | "decl_list" => {
                for child in &node.children {
                    self.walk_program(child)?;
                }
                Ok(())
            }
            "decl" => {
                for child in &node.children {
                    self.walk_program(child)?;
                }
                Ok(())
            }
            "var_decl" => self.walk_global_decl(node),
            "fun_decl" => self.walk_fun_decl(node),
            other => Err(CompileError::Internal(format!(
                "unexpected node `{}` at declaration level",
                other
            ))),
        }
    }

    fn walk_global_decl(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        let ty_node = self.find_child(node, "type_spec").ok_or_else(|| {
            CompileError::Internal("var_decl without type_spec".to_string())
        })?;
        let ty = self.type_of(ty_node)?;
        let ident = self.find_child(node, "IDENTIFIER").ok_or_else(|| {
            CompileError::Internal("var_decl without identifier".to_string())
        })?;
        let name = ident.literal.clone();

        if ty == MiniCType::Void {
            return Err(CompileError::semantic(
                node.line,
                format!("variable `{}` cannot have type void", name),
            ));
        }
        self.check_duplicate(&name, node.line)?;

        match self.find_child(node, "CONSTANT") {
            Some(len_node) => {
                let len = parse_constant(&len_node.literal).ok_or_else(|| {
                    CompileError::semantic(
                        node.line,
                        format!("bad array length `{}`", len_node.literal),
                    )
                })?;
                let id = format!("{}{}", VAR_PREFIX, self.var_seq);
                self.var_seq += 1;
                self.arrays.push(IrArray {
                    id,
                    name,
                    elem_ty: ty,
                    len: len as usize,
                    scope: self.scope_path.clone(),
                });
            }
            None => {
                // Globals are zero-filled in .data, so they count as
                // initialized.
                self.push_var(&name, ty, true);
            }
        }
        Ok(())
    }

    fn check_duplicate(&self, name: &str, line: usize) -> Result<(), CompileError> {
        let clash = self
            .vars
            .iter()
            .any(|v| v.name == name && v.scope == self.scope_path)
            || self
                .arrays
                .iter()
                .any(|a| a.name == name && a.scope == self.scope_path);
        if clash {
            Err(CompileError::semantic(
                line,
                format!("duplicate declaration of `{}`", name),
            ))
        } else {
            Ok(())
        }
    }

    fn walk_fun_decl(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        let ty_node = self.find_child(node, "type_spec").ok_or_else(|| {
            CompileError::Internal("fun_decl without type_spec".to_string())
        })?;
        let ret_ty = self.type_of(ty_node)?;
        let ident = self.find_child(node, "IDENTIFIER").ok_or_else(|| {
            CompileError::Internal("fun_decl without identifier".to_string())
        })?;
        let name = ident.literal.clone();

        if self.funcs.iter().any(|f| f.name == name) {
            return Err(CompileError::semantic(
                node.line,
                format!("duplicate declaration of function `{}`", name),
            ));
        }

        let entry_label = format!("{}_entry", name);
        let exit_label = format!("{}_exit", name);
        self.emit("set_label", "", "", &entry_label);

        self.enter_scope();
        self.funcs.push(IrFunc {
            name: name.clone(),
            ret_ty,
            params: Vec::new(),
            entry_label,
            exit_label: exit_label.clone(),
            scope: self.scope_path.clone(),
            has_return: false,
            is_interrupt: is_interrupt_name(&name),
            local_vars: Vec::new(),
            child_functions: Vec::new(),
        });
        let parent = self.current_func.replace(name.clone());
        if let Some(parent_name) = &parent {
            let child = name.clone();
            if let Some(f) = self.funcs.iter_mut().find(|f| &f.name == parent_name) {
                f.child_functions.push(child);
            }
        }

        if let Some(params) = self.find_child(node, "params") {
            self.walk_params(params)?;
        }

        let func = self.funcs.iter().find(|f| f.name == name).unwrap();
        if func.is_interrupt && (func.ret_ty != MiniCType::Void || !func.params.is_empty()) {
            return Err(CompileError::semantic(
                node.line,
                format!(
                    "interrupt handler `{}` must return void and take no parameters",
                    name
                ),
            ));
        }

        let body = self.find_child(node, "compound_stmt").ok_or_else(|| {
            CompileError::Internal("fun_decl without body".to_string())
        })?;
        // The body shares the function scope so parameters stay visible.
        self.walk_compound_parts(body)?;

        let fell_through = !matches!(
            self.quads.last().map(|q| q.op.as_str()),
            Some("return_void") | Some("return_expr")
        );
        if fell_through && ret_ty == MiniCType::Void {
            self.emit("return_void", "", "", &exit_label);
        }
        self.emit("set_label", "", "", &exit_label);

        self.exit_scope();
        self.current_func = parent;
        Ok(())
    }

    fn walk_params(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        match node.name.as_str() {
            "params" | "param_list" => {
                for child in &node.children {
                    self.walk_params(child)?;
                }
                Ok(())
            }
            "param" => self.walk_param(node),
            // `params -> VOID` and punctuation contribute nothing.
            _ => Ok(()),
        }
    }

    fn walk_param(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        let ty_node = self.find_child(node, "type_spec").ok_or_else(|| {
            CompileError::Internal("param without type_spec".to_string())
        })?;
        let ty = self.type_of(ty_node)?;
        let ident = self.find_child(node, "IDENTIFIER").ok_or_else(|| {
            CompileError::Internal("param without identifier".to_string())
        })?;
        let name = ident.literal.clone();

        if ty == MiniCType::Void {
            return Err(CompileError::semantic(
                node.line,
                format!("parameter `{}` cannot have type void", name),
            ));
        }
        self.check_duplicate(&name, node.line)?;

        // Anything after the identifier marks an array parameter, which is
        // passed by reference and occupies one slot.
        let is_array = node.children.len() > 2;
        let param = if is_array {
            let id = format!("{}{}", VAR_PREFIX, self.var_seq);
            self.var_seq += 1;
            self.arrays.push(IrArray {
                id: id.clone(),
                name,
                elem_ty: ty,
                len: 0,
                scope: self.scope_path.clone(),
            });
            IrParam::Array(id)
        } else {
            let id = self.push_var(&name, ty, true);
            IrParam::Scalar(id)
        };
        if let Some(f) = self.current_func_mut() {
            f.params.push(param);
        }
        Ok(())
    }

    // ---- statements ----

    fn walk_compound_parts(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        if let Some(decls) = self.find_child(node, "local_decls") {
            self.walk_local_decls(decls)?;
        }
        if let Some(stmts) = self.find_child(node, "stmt_list") {
            self.walk_stmt_list(stmts)?;
        }
        Ok(())
    }

    fn walk_local_decls(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        for child in &node.children {
            match child.name.as_str() {
                "local_decls" => self.walk_local_decls(child)?,
                "local_decl" => self.walk_local_decl(child)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn walk_local_decl(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        let ty_node = self.find_child(node, "type_spec").ok_or_else(|| {
            CompileError::Internal("local_decl without type_spec".to_string())
        })?;
        let ty = self.type_of(ty_node)?;
        let ident = self.find_child(node, "IDENTIFIER").ok_or_else(|| {
            CompileError::Internal("local_decl without identifier".to_string())
        })?;
        let name = ident.literal.clone();

        if self.find_child(node, "CONSTANT").is_some() {
            return Err(CompileError::semantic(
                node.line,
                format!("array `{}` must be declared at global scope", name),
            ));
        }
        if ty == MiniCType::Void {
            return Err(CompileError::semantic(
                node.line,
                format!("variable `{}` cannot have type void", name),
            ));
        }
        self.check_duplicate(&name, node.line)?;

        let id = self.push_var(&name, ty, false);
        if let Some(f) = self.current_func_mut() {
            f.local_vars.push(id);
        }
        Ok(())
    }

    fn walk_stmt_list(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        for child in &node.children {
            match child.name.as_str() {
                "stmt_list" => self.walk_stmt_list(child)?,
                "stmt" => self.walk_stmt(child)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn walk_stmt(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        let inner = node.children.first().ok_or_else(|| {
            CompileError::Internal("empty stmt node".to_string())
        })?;
        match inner.name.as_str() {
            "expr_stmt" => self.walk_expr_stmt(inner),
            "compound_stmt" => {
                self.enter_scope();
                let r = self.walk_compound_parts(inner);
                self.exit_scope();
                r
            }
            "if_stmt" => self.walk_if(inner),
            "while_stmt" => self.walk_while(inner),
            "return_stmt" => self.walk_return(inner),
            "continue_stmt" => match self.loop_stack.last().cloned() {
                Some((head, _)) => {
                    self.emit("j", "", "", &head);
                    Ok(())
                }
                None => Err(CompileError::semantic(
                    inner.line,
                    "continue outside of a loop",
                )),
            },
            "break_stmt" => match self.loop_stack.last().cloned() {
                Some((_, brk)) => {
                    self.emit("j", "", "", &brk);
                    Ok(())
                }
                None => Err(CompileError::semantic(inner.line, "break outside of a loop")),
            },
            other => Err(CompileError::Internal(format!(
                "unexpected statement node `{}`",
                other
            ))),
        }
    }

    fn walk_if(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        let cond = self.find_child(node, "expr").ok_or_else(|| {
            CompileError::Internal("if_stmt without condition".to_string())
        })?;
        let branches = self.find_children(node, "stmt");
        let has_else = branches.len() > 1;

        let label_true = self.new_label();
        let label_false = self.new_label();

        self.emit("set_label", "", "", &label_true);
        let (cond_var, _) = self.walk_expr(cond)?;
        self.emit("j_false", &cond_var, "", &label_false);

        self.walk_stmt(branches[0])?;

        if has_else {
            let label_end = self.new_label();
            self.emit("j", "", "", &label_end);
            self.emit("set_label", "", "", &label_false);
            self.walk_stmt(branches[1])?;
            self.emit("set_label", "", "", &label_end);
        } else {
            // Without an else the false label doubles as the end label.
            self.emit("set_label", "", "", &label_false);
        }
        Ok(())
    }

    fn walk_while(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        let cond = self.find_child(node, "expr").ok_or_else(|| {
            CompileError::Internal("while_stmt without condition".to_string())
        })?;
        let body = self.find_child(node, "stmt").ok_or_else(|| {
            CompileError::Internal("while_stmt without body".to_string())
        })?;

        let label_loop = self.new_label();
        let label_break = self.new_label();

        self.emit("set_label", "", "", &label_loop);
        let (cond_var, _) = self.walk_expr(cond)?;
        self.emit("j_false", &cond_var, "", &label_break);

        self.loop_stack.push((label_loop.clone(), label_break.clone()));
        let body_result = self.walk_stmt(body);
        self.loop_stack.pop();
        body_result?;

        self.emit("j", "", "", &label_loop);
        self.emit("set_label", "", "", &label_break);
        Ok(())
    }

    fn walk_return(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        let func_name = self.current_func.clone().ok_or_else(|| {
            CompileError::semantic(node.line, "return outside of a function")
        })?;
        let exit_label = self
            .funcs
            .iter()
            .find(|f| f.name == func_name)
            .map(|f| f.exit_label.clone())
            .unwrap_or_default();

        let returned = match self.find_child(node, "expr") {
            Some(expr) => {
                let (var, ty) = self.walk_expr(expr)?;
                self.emit("return_expr", &var, "", &exit_label);
                Some(ty)
            }
            None => {
                self.emit("return_void", "", "", &exit_label);
                None
            }
        };

        self.checks.push(PostCheck::Return {
            func: func_name.clone(),
            ty: returned,
            line: node.line,
        });
        if let Some(f) = self.current_func_mut() {
            f.has_return = true;
        }
        Ok(())
    }

    fn walk_expr_stmt(&mut self, node: &SyntaxNode) -> Result<(), CompileError> {
        let names = node.child_names();

        if names.first() == Some(&"DOLLAR") {
            // `$ addr = value ;` stores through a pointer.
            let exprs = self.find_children(node, "expr");
            if exprs.len() != 2 {
                return Err(CompileError::Internal(
                    "malformed pointer store".to_string(),
                ));
            }
            let (addr, _) = self.walk_expr(exprs[0])?;
            let (val, _) = self.walk_expr(exprs[1])?;
            self.emit("=$", &addr, &val, "");
            return Ok(());
        }

        if names.contains(&"LBRACKET") {
            // `name [ index ] = value ;`
            let ident = self.find_child(node, "IDENTIFIER").unwrap();
            let exprs = self.find_children(node, "expr");
            if exprs.len() != 2 {
                return Err(CompileError::Internal(
                    "malformed array assignment".to_string(),
                ));
            }
            let array_id = match self.lookup_array(&ident.literal) {
                Some(a) => a.id.clone(),
                None => {
                    return Err(CompileError::semantic(
                        node.line,
                        format!("undefined array `{}`", ident.literal),
                    ))
                }
            };
            let (idx, _) = self.walk_expr(exprs[0])?;
            let (val, _) = self.walk_expr(exprs[1])?;
            self.emit("=[]", &idx, &val, &array_id);
            return Ok(());
        }

        if names.contains(&"ASSIGN") {
            // `name = value ;`
            let ident = self.find_child(node, "IDENTIFIER").unwrap();
            let expr = self.find_child(node, "expr").ok_or_else(|| {
                CompileError::Internal("assignment without value".to_string())
            })?;
            let (val, _) = self.walk_expr(expr)?;
            let index = self.lookup_var(&ident.literal).ok_or_else(|| {
                CompileError::semantic(
                    node.line,
                    format!("undefined variable `{}`", ident.literal),
                )
            })?;
            let id = self.vars[index].id.clone();
            self.vars[index].initialized = true;
            self.emit("=var", &val, "", &id);
            return Ok(());
        }

        if names.contains(&"LPAREN") || names.contains(&"args") {
            // Bare call statement: any result is discarded.
            let ident = self.find_child(node, "IDENTIFIER").ok_or_else(|| {
                CompileError::Internal("call statement without callee".to_string())
            })?;
            self.emit_call(node, &ident.literal, false)?;
            return Ok(());
        }

        Err(CompileError::Internal(format!(
            "unrecognized expression statement shape {:?}",
            names
        )))
    }

    // ---- expressions ----

    /// Lower an expression left-to-right into temporaries; the returned
    /// operand is a variable id from the pool.
    fn walk_expr(&mut self, node: &SyntaxNode) -> Result<(String, MiniCType), CompileError> {
        // Unwrap single-child wrappers like expr -> expr.
        if node.children.len() == 1 && node.child(0).name == "expr" {
            return self.walk_expr(node.child(0));
        }
        let names = node.child_names();

        match names.as_slice() {
            ["CONSTANT"] => {
                let t = self.new_temp(MiniCType::Int);
                let literal = node.child(0).literal.clone();
                self.emit("=const", &literal, "", &t);
                Ok((t, MiniCType::Int))
            }
            ["STRING_LITERAL"] => {
                let t = self.new_temp(MiniCType::Str);
                let text = node.child(0).literal.trim_matches('"').to_string();
                self.emit("=string", &text, "", &t);
                Ok((t, MiniCType::Str))
            }
            ["IDENTIFIER"] => {
                let name = &node.child(0).literal;
                if let Some(i) = self.lookup_var(name) {
                    let var = &self.vars[i];
                    if !var.initialized {
                        return Err(CompileError::semantic(
                            node.line,
                            format!("variable `{}` used before initialization", name),
                        ));
                    }
                    return Ok((var.id.clone(), var.ty));
                }
                if let Some(a) = self.lookup_array(name) {
                    // Whole-array reference, e.g. an array passed to a call.
                    return Ok((a.id.clone(), a.elem_ty));
                }
                Err(CompileError::semantic(
                    node.line,
                    format!("undefined variable `{}`", name),
                ))
            }
            ["LPAREN", "expr", "RPAREN"] => {
                let (inner, ty) = self.walk_expr(node.child(1))?;
                let t = self.new_temp(ty);
                self.emit("=var", &inner, "", &t);
                Ok((t, ty))
            }
            ["IDENTIFIER", "LBRACKET", "expr", "RBRACKET"] => {
                let name = &node.child(0).literal;
                let array = self.lookup_array(name).map(|a| (a.id.clone(), a.elem_ty));
                let (array_id, elem_ty) = array.ok_or_else(|| {
                    CompileError::semantic(node.line, format!("undefined array `{}`", name))
                })?;
                let (idx, _) = self.walk_expr(node.child(2))?;
                let t = self.new_temp(elem_ty);
                self.emit("[]", &array_id, &idx, &t);
                Ok((t, elem_ty))
            }
            ["IDENTIFIER", "LPAREN", ..] | ["IDENTIFIER", "args"] => {
                let callee = node.child(0).literal.clone();
                let t = self.emit_call(node, &callee, true)?;
                Ok((t, MiniCType::Int))
            }
            [op, "expr"] if crate::ir::UNARY_OPS.contains(op) => {
                let op = op.to_string();
                let (operand, _) = self.walk_expr(node.child(1))?;
                let t = self.new_temp(MiniCType::Int);
                self.emit(&op, &operand, "", &t);
                Ok((t, MiniCType::Int))
            }
            ["expr", op, "expr"] if crate::ir::BINARY_OPS.contains(op) => {
                let op = op.to_string();
                let (lhs, _) = self.walk_expr(node.child(0))?;
                let (rhs, _) = self.walk_expr(node.child(2))?;
                let t = self.new_temp(MiniCType::Int);
                self.emit(&op, &lhs, &rhs, &t);
                Ok((t, MiniCType::Int))
            }
            other => Err(CompileError::Internal(format!(
                "unrecognized expression shape {:?}",
                other
            ))),
        }
    }

    /// Emit a call quadruple, returning the result temporary's id (empty
    /// when the result is discarded). Arity and result-use checks are
    /// deferred because the callee may not be declared yet.
    fn emit_call(
        &mut self,
        node: &SyntaxNode,
        callee: &str,
        wants_result: bool,
    ) -> Result<String, CompileError> {
        let mut args = Vec::new();
        if let Some(args_node) = self.find_child(node, "args") {
            self.collect_args(args_node, &mut args)?;
        }

        if callee == "__asm" {
            if let Some(f) = self.current_func.clone() {
                self.asm_callers.insert(f);
            }
        }

        self.checks.push(PostCheck::Call {
            callee: callee.to_string(),
            argc: args.len(),
            wants_result,
            line: node.line,
        });

        let joined = args.join("&");
        let result = if wants_result {
            self.new_temp(MiniCType::Int)
        } else {
            String::new()
        };
        self.emit("call", callee, &joined, &result);
        Ok(result)
    }

    fn collect_args(
        &mut self,
        node: &SyntaxNode,
        out: &mut Vec<String>,
    ) -> Result<(), CompileError> {
        for child in &node.children {
            match child.name.as_str() {
                "args" | "arg_list" => self.collect_args(child, out)?,
                "expr" => {
                    let (var, _) = self.walk_expr(child)?;
                    out.push(var);
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ---- post passes ----

    fn run_post_checks(&mut self) -> Result<(), CompileError> {
        for check in &self.checks {
            match check {
                PostCheck::Call {
                    callee,
                    argc,
                    wants_result,
                    line,
                } => {
                    let func = self.funcs.iter().find(|f| f.name == *callee).ok_or_else(
                        || {
                            CompileError::semantic(
                                *line,
                                format!("call to unknown function `{}`", callee),
                            )
                        },
                    )?;
                    if callee == "main" {
                        return Err(CompileError::semantic(
                            *line,
                            "`main` cannot be called",
                        ));
                    }
                    if func.params.len() != *argc {
                        return Err(CompileError::semantic(
                            *line,
                            format!(
                                "`{}` takes {} argument(s) but {} were supplied",
                                callee,
                                func.params.len(),
                                argc
                            ),
                        ));
                    }
                    if *wants_result && func.ret_ty == MiniCType::Void {
                        return Err(CompileError::semantic(
                            *line,
                            format!("void function `{}` used as a value", callee),
                        ));
                    }
                }
                PostCheck::Return { func, ty, line } => {
                    let ret_ty = self
                        .funcs
                        .iter()
                        .find(|f| f.name == *func)
                        .map(|f| f.ret_ty)
                        .unwrap_or(MiniCType::Void);
                    match ty {
                        None if ret_ty != MiniCType::Void => {
                            return Err(CompileError::semantic(
                                *line,
                                format!("`{}` must return a value of type {}", func, ret_ty),
                            ));
                        }
                        Some(t) if *t != ret_ty => {
                            return Err(CompileError::semantic(
                                *line,
                                format!(
                                    "`{}` returns {} but the returned expression has type {}",
                                    func, ret_ty, t
                                ),
                            ));
                        }
                        _ => {}
                    }
                }
            }
        }

        if !self.funcs.iter().any(|f| f.name == "main") {
            return Err(CompileError::semantic(0, "no `main` function defined"));
        }

        for func in &self.funcs {
            if func.name == "__asm" || func.ret_ty == MiniCType::Void {
                continue;
            }
            if !func.has_return && !self.asm_callers.contains(&func.name) {
                return Err(CompileError::semantic(
                    0,
                    format!("non-void function `{}` has no return statement", func.name),
                ));
            }
        }
        Ok(())
    }

    /// Fold every `=string` / `call __asm` pair into a single `out_asm`
    /// quadruple. Any string or `__asm` use left over is a misuse.
    fn fold_asm(&mut self) -> Result<(), CompileError> {
        let mut folded = Vec::with_capacity(self.quads.len());
        let mut i = 0;
        while i < self.quads.len() {
            let quad = &self.quads[i];
            if quad.op == "=string" {
                let next = self.quads.get(i + 1);
                match next {
                    Some(n) if n.op == "call" && n.arg1 == "__asm" && n.arg2 == quad.res => {
                        folded.push(Quad::new("out_asm", &quad.arg1, "", ""));
                        i += 2;
                        continue;
                    }
                    _ => {
                        return Err(CompileError::semantic(
                            0,
                            "string literals may only appear as the argument of `__asm`",
                        ))
                    }
                }
            }
            if quad.op == "call" && quad.arg1 == "__asm" {
                return Err(CompileError::semantic(
                    0,
                    "`__asm` takes exactly one string literal argument",
                ));
            }
            folded.push(quad.clone());
            i += 1;
        }
        self.quads = folded;
        Ok(())
    }
}

/// Dragon-book partitioning: leaders are the first instruction, every
/// function entry label, every jump target, and every instruction after a
/// jump. Blocks run from leader to the next leader.
pub fn partition_blocks(quads: &[Quad]) -> Vec<BasicBlock> {
    if quads.is_empty() {
        return Vec::new();
    }

    let mut leaders = std::collections::BTreeSet::new();
    leaders.insert(0);
    for (i, quad) in quads.iter().enumerate() {
        if quad.op == "set_label" && quad.res.contains("entry") {
            leaders.insert(i);
        }
        if quad.is_jump() {
            let target = &quad.res;
            if let Some(t) = quads
                .iter()
                .position(|q| q.op == "set_label" && q.res == *target)
            {
                leaders.insert(t);
            }
            if i + 1 < quads.len() {
                leaders.insert(i + 1);
            }
        }
    }

    let bounds: Vec<usize> = leaders.into_iter().collect();
    let mut blocks = Vec::with_capacity(bounds.len());
    for (bi, &start) in bounds.iter().enumerate() {
        let end = bounds.get(bi + 1).copied().unwrap_or(quads.len());
        blocks.push(BasicBlock {
            id: bi,
            start,
            quads: quads[start..end].to_vec(),
        });
    }
    blocks
}

fn parse_constant(literal: &str) -> Option<i64> {
    if let Some(hex) = literal.strip_prefix("0x").or_else(|| literal.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        literal.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{NodeKind, SyntaxNode};

    fn tok(name: &str, literal: &str) -> SyntaxNode {
        SyntaxNode {
            name: name.to_string(),
            kind: NodeKind::Token,
            literal: literal.to_string(),
            children: Vec::new(),
            line: 1,
        }
    }

    fn nt(name: &str, children: Vec<SyntaxNode>) -> SyntaxNode {
        SyntaxNode::non_terminal(name, children)
    }

    fn type_spec(ty: &str) -> SyntaxNode {
        nt("type_spec", vec![tok(ty.to_uppercase().as_str(), ty)])
    }

    fn const_expr(value: &str) -> SyntaxNode {
        nt("expr", vec![tok("CONSTANT", value)])
    }

    fn var_expr(name: &str) -> SyntaxNode {
        nt("expr", vec![tok("IDENTIFIER", name)])
    }

    fn ret_stmt(expr: Option<SyntaxNode>) -> SyntaxNode {
        let mut kids = vec![tok("RETURN", "return")];
        if let Some(e) = expr {
            kids.push(e);
        }
        kids.push(tok("SEMICOLON", ";"));
        nt("stmt", vec![nt("return_stmt", kids)])
    }

    fn body(locals: Vec<SyntaxNode>, stmts: Vec<SyntaxNode>) -> SyntaxNode {
        nt(
            "compound_stmt",
            vec![nt("local_decls", locals), nt("stmt_list", stmts)],
        )
    }

    fn fun(ret: &str, name: &str, body_node: SyntaxNode) -> SyntaxNode {
        nt(
            "fun_decl",
            vec![
                type_spec(ret),
                tok("IDENTIFIER", name),
                nt("params", vec![tok("VOID", "void")]),
                body_node,
            ],
        )
    }

    fn program(decls: Vec<SyntaxNode>) -> SyntaxNode {
        nt("program", vec![nt("decl_list", decls)])
    }

    fn main_returning_zero() -> SyntaxNode {
        program(vec![fun(
            "int",
            "main",
            body(vec![], vec![ret_stmt(Some(const_expr("0")))]),
        )])
    }

    #[test]
    fn minimal_main() {
        let ir = IrGenerator::new().generate(&main_returning_zero()).unwrap();

        let ops: Vec<&str> = ir.quads.iter().map(|q| q.op.as_str()).collect();
        assert_eq!(ops, vec!["set_label", "=const", "return_expr", "set_label"]);
        assert_eq!(ir.quads[0].res, "main_entry");
        assert_eq!(ir.quads[1].arg1, "0");
        assert_eq!(ir.quads[2].res, "main_exit");
        assert!(ir.func("main").is_some());
    }

    #[test]
    fn missing_main_is_fatal() {
        let tree = program(vec![fun(
            "void",
            "helper",
            body(vec![], vec![ret_stmt(None)]),
        )]);
        let err = IrGenerator::new().generate(&tree).unwrap_err();
        assert!(err.to_string().contains("main"));
    }

    #[test]
    fn duplicate_global_is_fatal() {
        let decl = |name: &str| {
            nt(
                "var_decl",
                vec![type_spec("int"), tok("IDENTIFIER", name), tok("SEMICOLON", ";")],
            )
        };
        let tree = program(vec![
            decl("x"),
            decl("x"),
            fun("int", "main", body(vec![], vec![ret_stmt(Some(const_expr("0")))])),
        ]);
        let err = IrGenerator::new().generate(&tree).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert!(err.to_string().contains("x"));
    }

    #[test]
    fn local_array_is_rejected() {
        let local = nt(
            "local_decl",
            vec![
                type_spec("int"),
                tok("IDENTIFIER", "a"),
                tok("CONSTANT", "10"),
                tok("SEMICOLON", ";"),
            ],
        );
        let tree = program(vec![fun(
            "int",
            "main",
            body(vec![local], vec![ret_stmt(Some(const_expr("0")))]),
        )]);
        let err = IrGenerator::new().generate(&tree).unwrap_err();
        assert!(err.to_string().contains("global scope"));
    }

    #[test]
    fn use_before_initialization_is_fatal() {
        let local = nt(
            "local_decl",
            vec![type_spec("int"), tok("IDENTIFIER", "x"), tok("SEMICOLON", ";")],
        );
        let tree = program(vec![fun(
            "int",
            "main",
            body(vec![local], vec![ret_stmt(Some(var_expr("x")))]),
        )]);
        let err = IrGenerator::new().generate(&tree).unwrap_err();
        assert!(err.to_string().contains("before initialization"));
    }

    #[test]
    fn while_loop_emits_expected_labels() {
        // while (x < 10) { x = x + 1; }
        let local = nt(
            "local_decl",
            vec![type_spec("int"), tok("IDENTIFIER", "x"), tok("SEMICOLON", ";")],
        );
        let init = nt(
            "stmt",
            vec![nt(
                "expr_stmt",
                vec![
                    tok("IDENTIFIER", "x"),
                    tok("ASSIGN", "="),
                    const_expr("0"),
                    tok("SEMICOLON", ";"),
                ],
            )],
        );
        let cond = nt("expr", vec![var_expr("x"), tok("LT_OP", "<"), const_expr("10")]);
        let incr = nt(
            "stmt",
            vec![nt(
                "expr_stmt",
                vec![
                    tok("IDENTIFIER", "x"),
                    tok("ASSIGN", "="),
                    nt("expr", vec![var_expr("x"), tok("PLUS", "+"), const_expr("1")]),
                    tok("SEMICOLON", ";"),
                ],
            )],
        );
        let while_stmt = nt(
            "stmt",
            vec![nt(
                "while_stmt",
                vec![tok("WHILE", "while"), cond, incr],
            )],
        );
        let tree = program(vec![fun(
            "int",
            "main",
            body(
                vec![local],
                vec![init, while_stmt, ret_stmt(Some(var_expr("x")))],
            ),
        )]);

        let ir = IrGenerator::new().generate(&tree).unwrap();
        let j_false: Vec<&Quad> = ir.quads.iter().filter(|q| q.op == "j_false").collect();
        let jumps: Vec<&Quad> = ir.quads.iter().filter(|q| q.op == "j").collect();
        assert_eq!(j_false.len(), 1);
        assert_eq!(jumps.len(), 1);

        let loop_head = &jumps[0].res;
        let break_label = &j_false[0].res;
        assert!(ir
            .quads
            .iter()
            .any(|q| q.op == "set_label" && q.res == *loop_head));
        assert!(ir
            .quads
            .iter()
            .any(|q| q.op == "set_label" && q.res == *break_label));
        // The loop-head label precedes the condition's j_false.
        let head_pos = ir.quads.iter().position(|q| q.res == *loop_head).unwrap();
        let jf_pos = ir.quads.iter().position(|q| q.op == "j_false").unwrap();
        assert!(head_pos < jf_pos);
    }

    #[test]
    fn break_outside_loop_is_fatal() {
        let brk = nt("stmt", vec![nt("break_stmt", vec![tok("BREAK", "break")])]);
        let tree = program(vec![fun(
            "int",
            "main",
            body(vec![], vec![brk, ret_stmt(Some(const_expr("0")))]),
        )]);
        let err = IrGenerator::new().generate(&tree).unwrap_err();
        assert!(err.to_string().contains("break outside"));
    }

    #[test]
    fn call_arity_mismatch_detected_after_traversal() {
        // main calls helper(1) before helper() is declared.
        let call = nt(
            "stmt",
            vec![nt(
                "expr_stmt",
                vec![
                    tok("IDENTIFIER", "helper"),
                    tok("LPAREN", "("),
                    nt("args", vec![nt("arg_list", vec![const_expr("1")])]),
                    tok("RPAREN", ")"),
                    tok("SEMICOLON", ";"),
                ],
            )],
        );
        let tree = program(vec![
            fun(
                "int",
                "main",
                body(vec![], vec![call, ret_stmt(Some(const_expr("0")))]),
            ),
            fun("void", "helper", body(vec![], vec![ret_stmt(None)])),
        ]);
        let err = IrGenerator::new().generate(&tree).unwrap_err();
        assert!(err.to_string().contains("argument"));
    }

    #[test]
    fn calling_main_is_fatal() {
        let call = nt(
            "stmt",
            vec![nt(
                "expr_stmt",
                vec![
                    tok("IDENTIFIER", "main"),
                    tok("LPAREN", "("),
                    nt("args", vec![]),
                    tok("RPAREN", ")"),
                    tok("SEMICOLON", ";"),
                ],
            )],
        );
        let tree = program(vec![fun(
            "int",
            "main",
            body(vec![], vec![call, ret_stmt(Some(const_expr("0")))]),
        )]);
        let err = IrGenerator::new().generate(&tree).unwrap_err();
        assert!(err.to_string().contains("cannot be called"));
    }

    #[test]
    fn interrupt_handler_shape_is_enforced() {
        let tree = program(vec![
            fun(
                "int",
                "interruptServer0",
                body(vec![], vec![ret_stmt(Some(const_expr("0")))]),
            ),
            fun("int", "main", body(vec![], vec![ret_stmt(Some(const_expr("0")))])),
        ]);
        let err = IrGenerator::new().generate(&tree).unwrap_err();
        assert!(err.to_string().contains("interrupt handler"));
    }

    #[test]
    fn asm_call_folds_into_out_asm() {
        let call = nt(
            "stmt",
            vec![nt(
                "expr_stmt",
                vec![
                    tok("IDENTIFIER", "__asm"),
                    tok("LPAREN", "("),
                    nt(
                        "args",
                        vec![nt(
                            "arg_list",
                            vec![nt("expr", vec![tok("STRING_LITERAL", "\"mfc0 $k0,$13\"")])],
                        )],
                    ),
                    tok("RPAREN", ")"),
                    tok("SEMICOLON", ";"),
                ],
            )],
        );
        let tree = program(vec![
            fun("void", "interruptServer0", body(vec![], vec![call])),
            fun("int", "main", body(vec![], vec![ret_stmt(Some(const_expr("0")))])),
        ]);

        let ir = IrGenerator::new().generate(&tree).unwrap();
        let out_asm: Vec<&Quad> = ir.quads.iter().filter(|q| q.op == "out_asm").collect();
        assert_eq!(out_asm.len(), 1);
        assert_eq!(out_asm[0].arg1, "mfc0 $k0,$13");
        assert!(!ir.quads.iter().any(|q| q.op == "=string"));
        assert!(!ir.quads.iter().any(|q| q.op == "call"));
        assert!(ir.func("interruptServer0").unwrap().is_interrupt);
    }

    #[test]
    fn if_else_label_layout() {
        let if_stmt = nt(
            "stmt",
            vec![nt(
                "if_stmt",
                vec![
                    tok("IF", "if"),
                    var_expr("g"),
                    ret_stmt(Some(const_expr("1"))),
                    tok("ELSE", "else"),
                    ret_stmt(Some(const_expr("2"))),
                ],
            )],
        );
        let global = nt(
            "var_decl",
            vec![type_spec("int"), tok("IDENTIFIER", "g"), tok("SEMICOLON", ";")],
        );
        let tree = program(vec![
            global,
            fun("int", "main", body(vec![], vec![if_stmt])),
        ]);

        let ir = IrGenerator::new().generate(&tree).unwrap();
        let jf = ir.quads.iter().find(|q| q.op == "j_false").unwrap();
        let j = ir.quads.iter().find(|q| q.op == "j").unwrap();
        // Both targets exist as labels and are distinct.
        assert_ne!(jf.res, j.res);
        for target in [&jf.res, &j.res] {
            assert!(ir
                .quads
                .iter()
                .any(|q| q.op == "set_label" && q.res == *target));
        }
    }

    #[test]
    fn blocks_cover_instructions_exactly() {
        let ir = IrGenerator::new().generate(&main_returning_zero()).unwrap();
        let blocks = &ir.blocks;
        assert!(!blocks.is_empty());
        let mut covered = 0;
        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(b.start, covered, "leaders must tile the list");
            assert_eq!(b.id, i);
            covered += b.quads.len();
        }
        assert_eq!(covered, ir.quads.len());
    }

    #[test]
    fn jump_targets_are_block_leaders() {
        let cond = nt("expr", vec![const_expr("1"), tok("LT_OP", "<"), const_expr("2")]);
        let while_stmt = nt(
            "stmt",
            vec![nt(
                "while_stmt",
                vec![tok("WHILE", "while"), cond, ret_stmt(Some(const_expr("0")))],
            )],
        );
        let tree = program(vec![fun(
            "int",
            "main",
            body(vec![], vec![while_stmt, ret_stmt(Some(const_expr("0")))]),
        )]);
        let ir = IrGenerator::new().generate(&tree).unwrap();

        for quad in ir.quads.iter().filter(|q| q.is_jump()) {
            let target_idx = ir
                .quads
                .iter()
                .position(|q| q.op == "set_label" && q.res == quad.res)
                .expect("every jump target is a label");
            assert!(
                ir.blocks.iter().any(|b| b.start == target_idx),
                "jump target {} must lead a block",
                quad.res
            );
        }
    }
}
