use crate::ir::{IrFunc, IrProgram};

/// Post-pass emitters for the Minisys interrupt machinery. Both operate on
/// the assembly text the code generator already produced.

pub fn has_handlers(ir: &IrProgram) -> bool {
    ir.funcs.iter().any(|f| f.is_interrupt)
}

fn handler_names(ir: &IrProgram) -> Vec<String> {
    let mut names: Vec<String> = ir
        .funcs
        .iter()
        .filter(|f| f.is_interrupt)
        .map(|f| f.name.clone())
        .collect();
    names.sort();
    names
}

/// The interrupt vector table: one `j interruptServer<i>` per present
/// handler, in ascending order.
pub fn emit_entry(ir: &IrProgram) -> String {
    let mut out = String::new();
    out.push_str(".text\n");
    for name in handler_names(ir) {
        out.push_str(&format!("\tj {}\n", name));
        out.push_str("\tnop\n");
    }
    out
}

/// Extract one function's lines from the emitted assembly: from its label
/// to the next function label (function labels carry the frame comment,
/// inner labels do not).
fn function_body<'a>(asm: &'a str, ir: &IrProgram, name: &str) -> Vec<&'a str> {
    let func_labels: Vec<String> = ir
        .funcs
        .iter()
        .filter(|f: &&IrFunc| !f.entry_label.is_empty())
        .map(|f| format!("{}:", f.name))
        .collect();

    let mut body = Vec::new();
    let mut inside = false;
    for line in asm.lines() {
        let bare = line.trim();
        let is_func_label = func_labels.iter().any(|l| bare.starts_with(l.as_str()));
        if inside {
            if is_func_label || bare.starts_with('.') {
                break;
            }
            body.push(line);
        } else if bare.starts_with(&format!("{}:", name)) {
            inside = true;
        }
    }
    body
}

/// Registers the handler body mentions, in push order.
fn used_registers(body: &[&str]) -> Vec<String> {
    let mut regs = Vec::new();
    let mut push = |r: String| {
        if !regs.contains(&r) {
            regs.push(r);
        }
    };
    for line in body {
        let mut rest = *line;
        while let Some(pos) = rest.find('$') {
            let tail = &rest[pos..];
            let token: String = tail
                .chars()
                .take_while(|c| *c == '$' || c.is_ascii_alphanumeric())
                .collect();
            if token.starts_with("$s") || token.starts_with("$t") || token == "$ra" {
                if token != "$sp" {
                    push(token);
                }
            }
            rest = &tail[1..];
        }
    }
    regs
}

/// Wrap every interrupt handler with push/pop of the registers it touches
/// and terminate with `eret`. The `jr $ra` return (and its delay slot) is
/// replaced; an interrupt handler returns through `eret` only.
pub fn emit_handlers(asm: &str, ir: &IrProgram) -> String {
    let mut out = String::new();
    out.push_str(".text\n");

    for name in handler_names(ir) {
        let mut body = function_body(asm, ir, &name);
        let regs = used_registers(&body);

        // Drop the trailing `jr $ra` and its delay-slot nop.
        while matches!(body.last().map(|l| l.trim()), Some("nop")) {
            body.pop();
        }
        if matches!(body.last().map(|l| l.trim()), Some("jr $ra")) {
            body.pop();
        }

        out.push_str(&format!("{}:\n", name));
        for reg in &regs {
            out.push_str("\taddiu $sp, $sp, -4\n");
            out.push_str(&format!("\tsw {}, 0($sp)\n", reg));
        }
        for line in &body {
            out.push_str(line);
            out.push('\n');
        }
        for reg in regs.iter().rev() {
            out.push_str(&format!("\tlw {}, 0($sp)\n", reg));
            out.push_str("\tnop\n");
            out.push_str("\tnop\n");
            out.push_str("\taddiu $sp, $sp, 4\n");
        }
        out.push_str("\teret\n");
        out.push_str("\tnop\n");
    }
    out
}
