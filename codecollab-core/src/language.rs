//! Filename → editor language mapping and the default contents of new files.

/// Filename of the file every new project starts with.
pub const DEFAULT_FILENAME: &str = "index.js";

/// Derive the editor language from a filename's extension.
///
/// The extension is whatever follows the last `.`, so a bare `.js` is still
/// javascript. Unknown or missing extensions map to `plaintext`.
pub fn language_for_filename(filename: &str) -> &'static str {
    let ext = match filename.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return "plaintext",
    };
    match ext.as_str() {
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "py" => "python",
        "java" => "java",
        "c" => "c",
        "cpp" => "cpp",
        "cs" => "csharp",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "md" => "markdown",
        other => {
            log::trace!("No language mapping for extension '{other}'");
            "plaintext"
        }
    }
}

/// Content of a freshly created file.
pub fn default_file_content(filename: &str) -> String {
    format!("// New file: {filename}")
}

/// Content of the `index.js` created alongside a new project.
pub fn welcome_file(project_name: &str) -> String {
    format!("// Welcome to your new project!\nconsole.log('Hello, {project_name}!');")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_extensions() {
        assert_eq!(language_for_filename("app.jsx"), "javascript");
        assert_eq!(language_for_filename("main.ts"), "typescript");
        assert_eq!(language_for_filename("tool.py"), "python");
        assert_eq!(language_for_filename("Main.java"), "java");
        assert_eq!(language_for_filename("prog.cs"), "csharp");
        assert_eq!(language_for_filename("README.md"), "markdown");
    }

    #[test]
    fn test_extension_case_insensitive() {
        assert_eq!(language_for_filename("INDEX.HTML"), "html");
    }

    #[test]
    fn test_fallback_plaintext() {
        assert_eq!(language_for_filename("Makefile"), "plaintext");
        assert_eq!(language_for_filename("notes.txt"), "plaintext");
        assert_eq!(language_for_filename(".bashrc"), "plaintext");
        assert_eq!(language_for_filename("trailing."), "plaintext");
    }

    #[test]
    fn test_dotfile_uses_text_after_dot() {
        assert_eq!(language_for_filename(".js"), "javascript");
        assert_eq!(language_for_filename(".CSS"), "css");
    }

    #[test]
    fn test_default_contents() {
        assert_eq!(default_file_content("a.py"), "// New file: a.py");
        assert_eq!(
            welcome_file("demo"),
            "// Welcome to your new project!\nconsole.log('Hello, demo!');"
        );
    }
}
