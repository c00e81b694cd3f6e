//! File selection rules for a repository tree.
//!
//! Decisions are path-based first (denied directories, lockfiles, minified
//! assets, an extension allowlist) and size-based last, so the reason a file
//! is dropped is stable regardless of what the host reports for its size.

/// A tree entry that passed selection and is scheduled for processing.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub path: String,
    pub sha: String,
    pub size: Option<u64>,
}

const DENIED_DIR_PREFIXES: &[&str] = &[
    "node_modules/",
    ".git/",
    "dist/",
    "build/",
    "out/",
    "target/",
    "vendor/",
    ".next/",
    ".nuxt/",
    "coverage/",
    "__pycache__/",
    ".venv/",
    "venv/",
    ".idea/",
    ".vscode/",
    "bower_components/",
];

const DENIED_BASENAMES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "cargo.lock",
    "poetry.lock",
    "pipfile.lock",
    "composer.lock",
    "gemfile.lock",
    "go.sum",
    "flake.lock",
    "bun.lockb",
];

const EXTENSIONLESS_ALLOWED: &[&str] = &[
    "dockerfile",
    "makefile",
    "justfile",
    "license",
    "readme",
    "changelog",
    "notice",
    "authors",
];

const ALLOWED_EXTENSIONS: &[&str] = &[
    // source
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "kts", "c", "h", "cpp", "hpp",
    "cc", "cs", "rb", "php", "swift", "scala", "clj", "ex", "exs", "erl", "hs", "ml", "lua",
    "r", "jl", "zig", "nim", "dart", "vue", "svelte",
    // scripts and shells
    "sh", "bash", "zsh", "fish", "ps1", "bat", "cmd",
    // markup and docs
    "md", "mdx", "rst", "txt", "adoc", "tex", "html", "htm", "css", "scss", "less",
    // config and data
    "json", "yaml", "yml", "toml", "ini", "cfg", "conf", "env", "properties", "xml",
    "proto", "graphql", "gql", "sql", "tf", "tfvars", "hcl", "cue", "dhall",
    "gradle", "cmake", "mk", "nix", "csv", "tsv",
];

/// Path- and size-based inclusion decision for one tree entry.
///
/// `size` is the host-declared blob size; entries with an unknown size pass
/// the size check and are bounded later by the total-byte budget.
pub fn should_include(path: &str, size: Option<u64>, max_file_bytes: u64) -> bool {
    let normalized = path.replace('\\', "/").to_lowercase();

    if DENIED_DIR_PREFIXES.iter().any(|prefix| {
        normalized.starts_with(prefix) || normalized.contains(&format!("/{prefix}"))
    }) {
        return false;
    }

    let basename = normalized.rsplit('/').next().unwrap_or(&normalized);

    if DENIED_BASENAMES.contains(&basename) {
        return false;
    }

    if basename.contains(".min.") {
        return false;
    }

    let allowed = match basename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ALLOWED_EXTENSIONS.contains(&ext),
        _ => EXTENSIONLESS_ALLOWED.contains(&basename),
    };
    if !allowed {
        return false;
    }

    match size {
        Some(bytes) => bytes <= max_file_bytes,
        None => true,
    }
}

const BINARY_SNIFF_BYTES: usize = 2000;

/// Content-based heuristic applied after download: a NUL byte, or a high
/// density of control characters other than tab/newline/carriage-return in
/// the leading sample, marks the file as binary.
pub fn looks_binary(bytes: &[u8]) -> bool {
    let sample = bytes.get(..BINARY_SNIFF_BYTES.min(bytes.len())).unwrap_or(bytes);
    if sample.is_empty() {
        return false;
    }

    if sample.contains(&0) {
        return true;
    }

    let control = sample
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
        .count();

    // More than 20% control characters.
    control.saturating_mul(5) > sample.len()
}
