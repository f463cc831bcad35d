use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CompileError;

/// Textual `#include "file"` substitution, run before the lexer ever sees
/// the source. Paths resolve relative to the including file; cycles are
/// detected by canonical path.
pub struct Preprocessor {
    base: PathBuf,
    visited: Vec<PathBuf>,
}

impl Preprocessor {
    pub fn new(base: impl Into<PathBuf>) -> Preprocessor {
        Preprocessor {
            base: base.into(),
            visited: Vec::new(),
        }
    }

    pub fn preprocess(&mut self, source: &str) -> Result<String, CompileError> {
        let mut out = String::new();
        for (i, line) in source.lines().enumerate() {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("#include") {
                let file = parse_include_path(rest).ok_or_else(|| {
                    CompileError::semantic(i + 1, "malformed #include directive")
                })?;
                self.splice(&file, i + 1, &mut out)?;
            } else {
                out.push_str(line);
                out.push('\n');
            }
        }
        Ok(out)
    }

    fn splice(&mut self, file: &str, line: usize, out: &mut String) -> Result<(), CompileError> {
        let path = self.base.join(file);
        let canonical = path.canonicalize().map_err(|_| {
            CompileError::semantic(line, format!("cannot open include file {:?}", file))
        })?;
        if self.visited.contains(&canonical) {
            return Err(CompileError::semantic(
                line,
                format!("include cycle through {:?}", file),
            ));
        }
        self.visited.push(canonical.clone());

        let content = fs::read_to_string(&canonical)?;
        let parent = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base.clone());
        let saved = std::mem::replace(&mut self.base, parent);
        let expanded = self.preprocess(&content)?;
        self.base = saved;
        self.visited.pop();

        out.push_str(&expanded);
        Ok(())
    }
}

fn parse_include_path(rest: &str) -> Option<String> {
    let rest = rest.trim();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("minicc-pp-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn plain_source_passes_through() {
        let mut pp = Preprocessor::new(".");
        let out = pp.preprocess("int main() {\n  return 0;\n}\n").unwrap();
        assert_eq!(out, "int main() {\n  return 0;\n}\n");
    }

    #[test]
    fn include_is_spliced_in_place() {
        let dir = scratch_dir("splice");
        fs::write(dir.join("defs.c"), "int g;\n").unwrap();

        let mut pp = Preprocessor::new(&dir);
        let out = pp
            .preprocess("#include \"defs.c\"\nint main() { return 0; }\n")
            .unwrap();
        assert!(out.starts_with("int g;\n"));
        assert!(out.contains("int main()"));
    }

    #[test]
    fn nested_includes_resolve_relatively() {
        let dir = scratch_dir("nested");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("sub/inner.c"), "int inner;\n").unwrap();
        fs::write(dir.join("sub/outer.c"), "#include \"inner.c\"\nint outer;\n").unwrap();

        let mut pp = Preprocessor::new(&dir);
        let out = pp.preprocess("#include \"sub/outer.c\"\n").unwrap();
        assert!(out.contains("int inner;"));
        assert!(out.contains("int outer;"));
    }

    #[test]
    fn include_cycle_is_reported() {
        let dir = scratch_dir("cycle");
        fs::write(dir.join("a.c"), "#include \"b.c\"\n").unwrap();
        fs::write(dir.join("b.c"), "#include \"a.c\"\n").unwrap();

        let mut pp = Preprocessor::new(&dir);
        let err = pp.preprocess("#include \"a.c\"\n").unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn missing_include_is_reported_with_line() {
        let mut pp = Preprocessor::new(".");
        let err = pp
            .preprocess("int g;\n#include \"nope.c\"\n")
            .unwrap_err();
        match err {
            CompileError::Semantic { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
