//! Path-traversal rule family.
//!
//! Twelve sub-checks over each path-shaped argument of a request (falling
//! back to the text view when no path argument is present). Normalization
//! is purely lexical: the validator never touches the filesystem, so it is
//! deterministic and side-effect-free.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::{path_arguments, RuleContext, RuleOutcome};

/// Base prefixes a well-behaved path is expected to live under.
const ALLOWED_BASE_PATHS: &[&str] = &[
    "/workspace",
    "/tmp/mcp-safe",
    "./data",
    "./workspace",
    "workspace",
    "data",
    "uploads",
    "downloads",
    "documents",
];

const SYSTEM_DIRECTORIES: &[&str] = &[
    "/etc/",
    "/root/",
    "/sys/",
    "/proc/",
    "c:\\windows\\",
    "c:\\program files\\",
];

static TRAVERSAL_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\.\./|\.\.\\", "parent traversal sequence"),
        (r"\.\.//|\.\.\\\\", "double-slash traversal"),
        (r"\.\.;", "semicolon traversal"),
        (r"(?i)%2e%2e", "URL-encoded traversal"),
        (r"(?i)%252e", "double URL-encoded traversal"),
        (r"\u{2024}\u{2024}", "unicode dot traversal"),
    ]
    .iter()
    .map(|(pattern, description)| (Regex::new(pattern).expect("static pattern"), *description))
    .collect()
});

static SENSITIVE_FILES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)/etc/passwd$",
        r"(?i)/etc/shadow$",
        r"(?i)/\.ssh/id_rsa$",
        r"(?i)/\.ssh/authorized_keys$",
        r"(?i)/\.env$",
        r"(?i)/config/database\.(yml|yaml|json)$",
        r"(?i)/\.aws/credentials$",
        r"(?i)system32/config/sam$",
        r"(?i)/proc/self/environ$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static pattern"))
    .collect()
});

static OVERLONG_ENCODINGS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)%c0%af", "UTF-8 overlong encoding"),
        (r"(?i)%c1%9c", "UTF-8 overlong encoding"),
        (r"(?i)\\x2e\\x2e", "hex-encoded traversal"),
    ]
    .iter()
    .map(|(pattern, description)| (Regex::new(pattern).expect("static pattern"), *description))
    .collect()
});

static WINDOWS_DRIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z]:\\").expect("static pattern"));

/// Validates the path arguments of a request for traversal attempts.
///
/// When several path arguments are present the worst-scoring one decides.
pub fn validate_file_path(
    text_view: &str,
    arguments: &Map<String, Value>,
    _context: &RuleContext<'_>,
) -> RuleOutcome {
    let candidates = {
        let from_args = path_arguments(arguments);
        if from_args.is_empty() {
            vec![text_view]
        } else {
            from_args
        }
    };

    candidates
        .into_iter()
        .map(check_one)
        .fold(RuleOutcome::default(), RuleOutcome::max)
}

fn check_one(raw: &str) -> RuleOutcome {
    let mut outcome = RuleOutcome::default();
    let path = raw.trim();
    if path.is_empty() {
        return outcome;
    }
    let lower = path.to_lowercase();

    // 1. Traversal sequences, counted once however many variants appear.
    for (pattern, description) in TRAVERSAL_PATTERNS.iter() {
        if pattern.is_match(path) {
            outcome.record("traversal_sequence", 0.4, format!("detected: {}", description));
            break;
        }
    }

    // 2. Absolute paths (tools are expected to take relative ones).
    if is_absolute(path) {
        outcome.record("absolute_path", 0.3, "absolute path not allowed".to_string());
    }

    // 3. Null-byte injection.
    if path.contains('\0') || lower.contains("%00") {
        outcome.record("null_byte", 0.5, "null byte injection detected".to_string());
    }

    // 4. Lexically normalized sandbox escape, and sensitive-file targeting
    //    when the normalized path is absolute.
    let normalized = normalize_lexically(path);
    if normalized.starts_with("..") || normalized.contains("/..") {
        outcome.record(
            "sandbox_escape",
            0.4,
            "path escapes sandbox boundary".to_string(),
        );
    }
    if is_absolute(&normalized) && SENSITIVE_FILES.iter().any(|regex| regex.is_match(&normalized)) {
        outcome.record(
            "sensitive_file",
            0.5,
            format!("targeting sensitive file: {}", normalized),
        );
    }

    // 5. file:// protocol URIs.
    if lower.starts_with("file://") {
        outcome.record("file_protocol", 0.4, "file protocol URI detected".to_string());
    }

    // 6. UNC paths.
    if path.starts_with("\\\\") {
        outcome.record("unc_path", 0.4, "UNC path detected".to_string());
    }

    // 7. Tilde expansion combined with traversal.
    if path.starts_with('~') && path.contains("..") {
        outcome.record(
            "tilde_traversal",
            0.3,
            "tilde expansion with traversal".to_string(),
        );
    }

    // 8. Excessive directory depth.
    let depth = path.matches('/').count() + path.matches('\\').count();
    if depth > 10 {
        outcome.record(
            "excessive_depth",
            0.2,
            format!("excessive directory depth ({} levels)", depth),
        );
    }

    // 9. Non-allowlisted base path.
    let whitelisted = ALLOWED_BASE_PATHS
        .iter()
        .any(|base| path.starts_with(base) || path.starts_with(&format!("./{}", base)));
    if !whitelisted && (!path.starts_with("./") || path.contains("..")) {
        outcome.record(
            "non_whitelisted_base",
            0.2,
            "path not in allowed directories".to_string(),
        );
    }

    // 10. Over-long / hex encoding obfuscation.
    for (pattern, description) in OVERLONG_ENCODINGS.iter() {
        if pattern.is_match(path) {
            outcome.record("encoding_obfuscation", 0.3, format!("detected: {}", description));
            break;
        }
    }

    // 11. Windows drive letters.
    if WINDOWS_DRIVE.is_match(path) {
        outcome.record("windows_drive", 0.3, "Windows drive letter detected".to_string());
    }

    // 12. Reserved system directories.
    if let Some(dir) = SYSTEM_DIRECTORIES.iter().find(|dir| lower.contains(*dir)) {
        outcome.record(
            "system_directory",
            0.4,
            format!("system directory access: {}", dir),
        );
    }

    outcome.finish()
}

fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || (bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && (bytes[2] == b'/' || bytes[2] == b'\\'))
}

/// Resolves `.` and `..` segments without consulting the filesystem.
///
/// Leading `..` segments that would climb above the starting point are
/// preserved so callers can detect the escape.
fn normalize_lexically(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(&last) if last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
