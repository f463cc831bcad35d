#![allow(dead_code)]
use clap::{Arg, ArgAction, Command};
use std::fs;
use std::path::{Path, PathBuf};

pub mod automata;
pub mod codegen;
pub mod error;
pub mod interrupt;
pub mod ir;
pub mod irgen;
pub mod lexer;
pub mod lexgen;
pub mod parser;
pub mod preprocessor;
pub mod table;

use automata::dfa::Dfa;
use codegen::CodeGen;
use error::CompileError;
use irgen::IrGenerator;
use lexer::Lexer;
use parser::Parser;
use preprocessor::Preprocessor;
use table::LalrTable;

/// Lexical definition the DFA is regenerated from.
const MINIC_LEX: &str = include_str!("../syntax/minic.l");

struct Options {
    source: PathBuf,
    out_dir: PathBuf,
    tables_dir: PathBuf,
    intermediate: bool,
    verbose: bool,
    regenerate: bool,
}

fn main() {
    let matches = Command::new("minicc")
        .version(env!("CARGO_PKG_VERSION"))
        .about("MiniC compiler targeting the Minisys machine")
        .arg_required_else_help(true)
        .arg(
            Arg::new("source")
                .help("MiniC source file")
                .required(true),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("out-dir")
                .value_name("dir")
                .default_value(".")
                .help("Place outputs in <dir>"),
        )
        .arg(
            Arg::new("intermediate")
                .short('i')
                .long("intermediate")
                .action(ArgAction::SetTrue)
                .help("Also dump tokens, syntax tree, quadruples and basic blocks"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Report progress on stderr"),
        )
        .arg(
            Arg::new("regenerate")
                .long("regenerate")
                .action(ArgAction::SetTrue)
                .help("Rebuild the lexical DFA from the bundled definition"),
        )
        .arg(
            Arg::new("tables")
                .long("tables")
                .value_name("dir")
                .default_value("tables")
                .help("Directory holding syntax.json and lex.json"),
        )
        .get_matches();

    let opts = Options {
        source: PathBuf::from(matches.get_one::<String>("source").unwrap()),
        out_dir: PathBuf::from(matches.get_one::<String>("output").unwrap()),
        tables_dir: PathBuf::from(matches.get_one::<String>("tables").unwrap()),
        intermediate: matches.get_flag("intermediate"),
        verbose: matches.get_flag("verbose"),
        regenerate: matches.get_flag("regenerate"),
    };

    if let Err(e) = run(&opts) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run(opts: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let verbose = opts.verbose;
    let src = fs::read_to_string(&opts.source)?;
    let base = opts
        .source
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut preprocessor = Preprocessor::new(base);
    let code = preprocessor.preprocess(&src)?;
    if verbose {
        eprintln!("preprocessed {} bytes", code.len());
    }

    let dfa = load_dfa(opts)?;
    let tokens = Lexer::new(&dfa).tokenize(&code, None)?;
    if verbose {
        eprintln!("lexed {} tokens", tokens.len());
    }

    let table_path = opts.tables_dir.join("syntax.json");
    let table_json = fs::read_to_string(&table_path).map_err(|_| {
        CompileError::Table(format!(
            "cannot read LALR table {:?}; run the grammar tool first",
            table_path
        ))
    })?;
    let table = LalrTable::load(&table_json)?;
    let tree = Parser::new(&table).parse(&tokens, None)?;
    if verbose {
        eprintln!("parsed; root node `{}`", tree.name);
    }

    let ir = IrGenerator::new().generate(&tree)?;
    if verbose {
        eprintln!(
            "generated {} quadruples in {} blocks",
            ir.quads.len(),
            ir.blocks.len()
        );
    }

    let asm = CodeGen::new(&ir).compile()?;

    fs::create_dir_all(&opts.out_dir)?;
    let stem = opts
        .source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("out");
    let asm_path = opts.out_dir.join(format!("{}.asm", stem));
    fs::write(&asm_path, &asm)?;
    if verbose {
        eprintln!("wrote {:?}", asm_path);
    }

    if opts.intermediate {
        let mut tokens_dump = String::new();
        for t in &tokens {
            tokens_dump.push_str(&format!("{}:{}\t{}\t{:?}\n", t.line, t.column, t.name, t.literal));
        }
        fs::write(opts.out_dir.join(format!("{}.tokens.txt", stem)), tokens_dump)?;
        fs::write(opts.out_dir.join(format!("{}.tree.txt", stem)), tree.dump())?;
        fs::write(opts.out_dir.join(format!("{}.ir.txt", stem)), ir.dump_quads())?;
        fs::write(
            opts.out_dir.join(format!("{}.blocks.txt", stem)),
            ir.dump_blocks(),
        )?;
    }

    if interrupt::has_handlers(&ir) {
        let entry_path = opts.out_dir.join("minisys-interrupt-entry.asm");
        let handler_path = opts.out_dir.join("minisys-interrupt-handler.asm");
        fs::write(&entry_path, interrupt::emit_entry(&ir))?;
        fs::write(&handler_path, interrupt::emit_handlers(&asm, &ir))?;
        if verbose {
            eprintln!("wrote {:?} and {:?}", entry_path, handler_path);
        }
    }

    Ok(())
}

/// The lexical DFA: loaded from `lex.json` when present, rebuilt from the
/// bundled definition (and cached back) otherwise or on `--regenerate`.
fn load_dfa(opts: &Options) -> Result<Dfa, CompileError> {
    let cache = opts.tables_dir.join("lex.json");
    if !opts.regenerate {
        if let Ok(json) = fs::read_to_string(&cache) {
            if opts.verbose {
                eprintln!("loaded lexical DFA from {:?}", cache);
            }
            return Dfa::from_json(&json);
        }
    }

    let lex = lexgen::parse_lex(MINIC_LEX)?;
    let dfa = lexgen::build_dfa(&lex, "MiniC lexical DFA")?;
    if opts.verbose {
        eprintln!("built lexical DFA from the bundled definition");
    }
    if fs::create_dir_all(&opts.tables_dir).is_ok() {
        let _ = fs::write(&cache, dfa.to_json());
    }
    Ok(dfa)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// End-to-end over the frontend pieces that need no external table:
    /// the bundled lex definition must build and tokenize real MiniC.
    #[test]
    fn bundled_lex_definition_tokenizes_minic() {
        let lex = lexgen::parse_lex(MINIC_LEX).unwrap();
        let dfa = lexgen::build_dfa(&lex, "minic").unwrap();
        let lexer = Lexer::new(&dfa);

        let source = "int g;\nint main(void) {\n  g = g + 0x1F; /* note */\n  return g;\n}\n";
        let tokens = lexer.tokenize(source, None).unwrap();
        let names: Vec<&str> = tokens
            .iter()
            .map(|t| t.name.as_str())
            .filter(|n| *n != "_WHITESPACE" && *n != "_COMMENT")
            .collect();

        assert_eq!(
            names,
            vec![
                "INT", "IDENTIFIER", "SEMICOLON", "INT", "IDENTIFIER", "LPAREN", "VOID",
                "RPAREN", "LBRACE", "IDENTIFIER", "ASSIGN", "IDENTIFIER", "PLUS", "CONSTANT",
                "SEMICOLON", "RETURN", "IDENTIFIER", "SEMICOLON", "RBRACE", "SP_END",
            ]
        );
        let hex = tokens.iter().find(|t| t.name == "CONSTANT").unwrap();
        assert_eq!(hex.literal, "0x1F");
    }

    #[test]
    fn bundled_lex_round_trips_through_json() {
        let lex = lexgen::parse_lex(MINIC_LEX).unwrap();
        let dfa = lexgen::build_dfa(&lex, "minic").unwrap();
        let restored = Dfa::from_json(&dfa.to_json()).unwrap();

        let lexer = Lexer::new(&restored);
        let tokens = lexer.tokenize("while (x <= 10) x = x << 1;", None).unwrap();
        let names: Vec<&str> = tokens
            .iter()
            .map(|t| t.name.as_str())
            .filter(|n| *n != "_WHITESPACE")
            .collect();
        assert_eq!(
            names,
            vec![
                "WHILE", "LPAREN", "IDENTIFIER", "LE_OP", "CONSTANT", "RPAREN", "IDENTIFIER",
                "ASSIGN", "IDENTIFIER", "LEFT_OP", "CONSTANT", "SEMICOLON", "SP_END",
            ]
        );
    }

    #[test]
    fn block_comments_span_lines() {
        let lex = lexgen::parse_lex(MINIC_LEX).unwrap();
        let dfa = lexgen::build_dfa(&lex, "minic").unwrap();
        let tokens = Lexer::new(&dfa)
            .tokenize("int a; /* one\n * two\n */ int b;", None)
            .unwrap();
        let comments: Vec<_> = tokens.iter().filter(|t| t.name == "_COMMENT").collect();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].literal.contains("two"));
        // The token after the comment still knows its real line.
        let b = tokens
            .iter()
            .find(|t| t.name == "IDENTIFIER" && t.literal == "b")
            .unwrap();
        assert_eq!(b.line, 3);
    }
}
