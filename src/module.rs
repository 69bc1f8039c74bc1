// File: src/module.rs
//
// Path resolution and cycle detection for the `import` directive (spec.md
// §6 expansion). `import "path";` is textual inclusion, not a runtime
// module object: the compiler recursively compiles the named file's
// top-level declarations into the same chunk and the same global
// namespace before continuing the importing file (see `compiler.rs`,
// `import_statement`). This module owns only the filesystem half of that
// — resolving a literal path to a canonical file and reading it, with a
// loading-stack so a cycle is a compile error instead of infinite
// recursion.

use std::fs;
use std::path::{Path, PathBuf};

pub struct ResolvedImport {
    /// Canonicalized path, used both to read the file and as the identity
    /// compared against the loading stack for cycle detection.
    pub canonical_path: PathBuf,
    pub source: String,
}

/// Resolves `raw_path` (the string literal following `import`) relative to
/// `base_dir` — the importing file's directory, or `None` for the current
/// working directory when importing from the entry script text or the
/// REPL. Returns an error message suitable for direct display if the file
/// cannot be found/read, or if `raw_path` is already present in `loading`
/// (a circular import).
pub fn resolve(
    base_dir: Option<&Path>,
    raw_path: &str,
    loading: &[PathBuf],
) -> Result<ResolvedImport, String> {
    let candidate = PathBuf::from(raw_path);
    let full_path = if candidate.is_absolute() {
        candidate
    } else {
        match base_dir {
            Some(dir) => dir.join(&candidate),
            None => candidate,
        }
    };

    let canonical_path = fs::canonicalize(&full_path)
        .map_err(|e| format!("Cannot import '{}': {}", raw_path, e))?;

    if loading.iter().any(|p| p == &canonical_path) {
        return Err(format!("Circular import detected: '{}'.", raw_path));
    }

    let source = fs::read_to_string(&canonical_path)
        .map_err(|e| format!("Cannot import '{}': {}", raw_path, e))?;

    Ok(ResolvedImport { canonical_path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_relative_to_base_dir() {
        let dir = std::env::temp_dir().join("ruff_module_test_a");
        let _ = fs::create_dir_all(&dir);
        let file_path = dir.join("greet.ruff");
        let mut f = fs::File::create(&file_path).unwrap();
        writeln!(f, "var greeting = \"hi\";").unwrap();

        let result = resolve(Some(&dir), "greet.ruff", &[]).unwrap();
        assert!(result.source.contains("greeting"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn detects_circular_import() {
        let dir = std::env::temp_dir().join("ruff_module_test_b");
        let _ = fs::create_dir_all(&dir);
        let file_path = dir.join("self.ruff");
        fs::File::create(&file_path).unwrap();
        let canonical = fs::canonicalize(&file_path).unwrap();

        let err = resolve(Some(&dir), "self.ruff", std::slice::from_ref(&canonical));
        assert!(err.is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = std::env::temp_dir().join("ruff_module_test_c_does_not_exist");
        let err = resolve(Some(&dir), "nope.ruff", &[]);
        assert!(err.is_err());
    }
}
