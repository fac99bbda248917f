//! File metadata helpers for wire payloads.
//!
//! Only metadata derived from the path is ever reported: the basename, the
//! lowercased extension, and a language id. File contents never leave the
//! machine.
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use codetrackr::utils::file_meta::{basename, file_type, language_for_path};
//!
//! let path = Path::new("/home/dev/project/src/Main.RS");
//! assert_eq!(basename(path), Some("Main.RS".to_string()));
//! assert_eq!(file_type(path), ".rs");
//! assert_eq!(language_for_path(path), Some("rust"));
//! ```

use std::path::Path;

/// Language id reported when nothing better is known.
pub const UNKNOWN_LANGUAGE: &str = "unknown";

/// Extracts the basename (filename) from a path.
///
/// Returns `None` if the path is empty or has no final component.
#[must_use]
pub fn basename(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|s| s.to_string())
}

/// Returns the lowercased extension including the leading dot.
///
/// Files without an extension (including dotfiles such as `.gitignore`)
/// produce an empty string.
#[must_use]
pub fn file_type(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

/// Returns the basename of the directory containing `path`.
#[must_use]
pub fn parent_name(path: &Path) -> Option<String> {
    path.parent().and_then(basename)
}

/// Maps a file path to an editor language id based on its extension.
#[must_use]
pub fn language_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    language_for_extension(&ext)
}

/// Maps a lowercased extension (without the dot) to an editor language id.
#[must_use]
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    let language = match ext {
        "rs" => "rust",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "dart" => "dart",
        "lua" => "lua",
        "sh" | "bash" | "zsh" => "shellscript",
        "sql" => "sql",
        "html" | "htm" => "html",
        "css" => "css",
        "scss" => "scss",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "md" | "markdown" => "markdown",
        "vue" => "vue",
        "svelte" => "svelte",
        _ => return None,
    };
    Some(language)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn basename_of_nested_path() {
        assert_eq!(
            basename(Path::new("/home/user/project/lib.rs")),
            Some("lib.rs".to_string())
        );
        assert_eq!(basename(Path::new("lib.rs")), Some("lib.rs".to_string()));
    }

    #[test]
    fn basename_of_root_is_none() {
        assert_eq!(basename(Path::new("/")), None);
        assert_eq!(basename(Path::new("")), None);
    }

    #[test]
    fn file_type_is_lowercased_with_dot() {
        assert_eq!(file_type(Path::new("App.TSX")), ".tsx");
        assert_eq!(file_type(Path::new("archive.tar.gz")), ".gz");
    }

    #[test]
    fn file_type_is_empty_without_extension() {
        assert_eq!(file_type(Path::new("Makefile")), "");
        assert_eq!(file_type(Path::new(".gitignore")), "");
    }

    #[test]
    fn parent_name_returns_directory_basename() {
        let path = PathBuf::from("/work/codetrackr/src/main.rs");
        assert_eq!(parent_name(&path), Some("src".to_string()));
    }

    #[test]
    fn language_lookup() {
        assert_eq!(language_for_path(Path::new("a.py")), Some("python"));
        assert_eq!(language_for_path(Path::new("a.HPP")), Some("cpp"));
        assert_eq!(language_for_path(Path::new("a.unknownext")), None);
        assert_eq!(language_for_path(Path::new("Dockerfile")), None);
    }
}
