/*!
 * Search Order
 * Name normalization and the candidate paths a library name expands to
 */

use crate::core::config::KernelConfig;
use crate::core::limits::DEFAULT_LIBRARY_EXTENSION;

/// Canonical storage path: forward slashes, cleaned, lowercase
pub fn normalize_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let cleaned = path_clean::clean(forward.as_str());
    cleaned.to_string_lossy().to_lowercase()
}

/// Final path component, lowercased, with `.dll` added when there is no extension
pub fn module_file_name(name: &str) -> String {
    let forward = name.replace('\\', "/");
    let base = forward.rsplit('/').next().unwrap_or(&forward).to_lowercase();
    if base.contains('.') {
        base
    } else {
        format!("{}{}", base, DEFAULT_LIBRARY_EXTENSION)
    }
}

/// Directory part of a path, if any
pub fn parent_dir(path: &str) -> Option<String> {
    let forward = path.replace('\\', "/");
    forward
        .rfind('/')
        .map(|idx| if idx == 0 { "/".to_string() } else { forward[..idx].to_string() })
}

fn join(dir: &str, file: &str) -> String {
    normalize_path(&format!("{}/{}", dir.trim_end_matches(['/', '\\']), file))
}

/// Per-process inputs to the search order
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    /// Directory holding the process's executable
    pub process_dir: Option<String>,
    pub current_dir: Option<String>,
    /// Raw value of the PATH variable (`;`-separated)
    pub path_var: Option<String>,
}

/// Paths to try for `name`, in order, without duplicates
///
/// The name as given (with `.dll` appended if it has no extension), then the
/// process directory, the system directory, the secondary system directory,
/// the root directory, the current directory and each PATH entry.
pub fn candidate_paths(name: &str, ctx: &SearchContext, config: &KernelConfig) -> Vec<String> {
    let file = module_file_name(name);

    let as_given = match parent_dir(name) {
        Some(dir) => join(&dir, &file),
        None => normalize_path(&file),
    };

    let mut dirs: Vec<&str> = Vec::new();
    if let Some(dir) = ctx.process_dir.as_deref() {
        dirs.push(dir);
    }
    dirs.push(&config.system_dir);
    dirs.push(&config.secondary_system_dir);
    dirs.push(&config.root_dir);
    if let Some(dir) = ctx.current_dir.as_deref() {
        dirs.push(dir);
    }
    if let Some(path_var) = ctx.path_var.as_deref() {
        dirs.extend(path_var.split(';').map(str::trim).filter(|entry| !entry.is_empty()));
    }

    let mut candidates = vec![as_given];
    for dir in dirs {
        let candidate = join(dir, &file);
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}
