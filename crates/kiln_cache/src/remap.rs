//! Rewriting of environment-specific path prefixes to stable placeholders.

use std::path::{Path, PathBuf};

use kiln_config::RemapSection;

/// Placeholder for the toolchain installation root.
pub const TOOLCHAIN_PLACEHOLDER: &str = "/^toolchain";
/// Placeholder for the SDK root.
pub const SDK_PLACEHOLDER: &str = "/^sdk";
/// Placeholder for the workspace source root.
pub const SOURCE_PLACEHOLDER: &str = "/^src";
/// Placeholder for the build root.
pub const BUILD_PLACEHOLDER: &str = "/^build";

/// Characters that may legally follow a remapped prefix inside an argument.
const BOUNDARY_CHARS: &[char] = &['/', ':', ';', ',', '=', ' ', '"', '\''];

/// Maps absolute path prefixes to placeholder tokens.
///
/// Prefixes are matched longest first so that a build root nested inside the
/// workspace root is rewritten to `/^build`, not `/^src/build`. A prefix only
/// matches at a path-component boundary.
#[derive(Debug, Clone, Default)]
pub struct PathRemapper {
    prefixes: Vec<(String, &'static str)>,
}

impl PathRemapper {
    /// Creates a remapper with no prefixes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a prefix mapping.
    pub fn with_prefix(mut self, prefix: &Path, placeholder: &'static str) -> Self {
        let mut text = prefix.to_string_lossy().into_owned();
        while text.len() > 1 && text.ends_with('/') {
            text.pop();
        }
        if !text.is_empty() && text != "/" {
            self.prefixes.push((text, placeholder));
            self.prefixes
                .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        }
        self
    }

    /// Builds the remapper from the `[remap]` table and the build root.
    pub fn from_config(remap: &RemapSection, build_root: &Path) -> Self {
        let mut remapper = Self::new().with_prefix(build_root, BUILD_PLACEHOLDER);
        if let Some(toolchain) = &remap.toolchain {
            remapper = remapper.with_prefix(toolchain, TOOLCHAIN_PLACEHOLDER);
        }
        if let Some(sdk) = &remap.sdk {
            remapper = remapper.with_prefix(sdk, SDK_PLACEHOLDER);
        }
        if let Some(workspace) = &remap.workspace {
            remapper = remapper.with_prefix(workspace, SOURCE_PLACEHOLDER);
        }
        remapper
    }

    /// Rewrites a path, returning it unchanged if no prefix matches.
    pub fn remap_path(&self, path: &Path) -> PathBuf {
        let text = path.to_string_lossy();
        for (prefix, placeholder) in &self.prefixes {
            if let Some(rest) = text.strip_prefix(prefix.as_str()) {
                if rest.is_empty() || rest.starts_with('/') {
                    return PathBuf::from(format!("{placeholder}{rest}"));
                }
            }
        }
        path.to_path_buf()
    }

    /// Rewrites every occurrence of a known prefix inside a command-line argument.
    ///
    /// Handles arguments such as `-I/sdk/include` and `-fmodule-map=/src/a.map`.
    pub fn remap_arg(&self, arg: &str) -> String {
        let mut out = String::with_capacity(arg.len());
        let mut rest = arg;
        'scan: while !rest.is_empty() {
            for (prefix, placeholder) in &self.prefixes {
                if let Some(after) = rest.strip_prefix(prefix.as_str()) {
                    let at_boundary = after.is_empty() || after.starts_with(BOUNDARY_CHARS);
                    if at_boundary {
                        out.push_str(placeholder);
                        rest = after;
                        continue 'scan;
                    }
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
        out
    }

    /// Returns the inverse mapping of a previously remapped path.
    pub fn restore_path(&self, remapped: &str) -> PathBuf {
        for (prefix, placeholder) in &self.prefixes {
            if let Some(rest) = remapped.strip_prefix(placeholder) {
                if rest.is_empty() || rest.starts_with('/') {
                    return PathBuf::from(format!("{prefix}{rest}"));
                }
            }
        }
        PathBuf::from(remapped)
    }
}
