use std::path::Path;

/// Map a filename to the language name handed to the reviewer.
///
/// Detection is purely by extension; anything unknown gets the configured
/// fallback so no file is silently skipped for its extension alone.
pub fn detect(filename: &str, fallback: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let language = match ext.as_deref() {
        Some("py") => "Python",
        Some("js") => "JavaScript",
        Some("ts") => "TypeScript",
        Some("jsx") => "React JavaScript",
        Some("tsx") => "React TypeScript",
        Some("java") => "Java",
        Some("cpp") => "C++",
        Some("c") => "C",
        Some("go") => "Go",
        Some("rs") => "Rust",
        Some("php") => "PHP",
        Some("rb") => "Ruby",
        Some("html") => "HTML",
        Some("css") => "CSS",
        _ => return fallback.to_string(),
    };
    language.to_string()
}
