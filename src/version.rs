//! Build identity for huginnd's startup log line.
//!
//! `build.rs` exports the git facts through vergen-gitcl; a tarball build
//! has none of them and falls back to the crate version alone.

/// Crate version of this build.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Checked-out branch, `"unknown"` for tarball builds.
pub const GIT_BRANCH: &str = match option_env!("VERGEN_GIT_BRANCH") {
    Some(branch) => branch,
    None => "unknown",
};

/// Commit hash, `"unknown"` for tarball builds.
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

const SHORT_SHA_LEN: usize = 7;

/// True when the build ran with uncommitted changes.
pub fn git_dirty() -> bool {
    option_env!("VERGEN_GIT_DIRTY") == Some("true")
}

fn short_sha(sha: &str) -> &str {
    sha.get(..SHORT_SHA_LEN).unwrap_or(sha)
}

/// Semver build-metadata form: `0.1.0+main.abc1234`, with `.dirty`
/// appended for uncommitted changes. Tarball builds report `0.1.0`.
pub fn version_string() -> String {
    if GIT_SHA == "unknown" {
        return PKG_VERSION.to_string();
    }
    let dirty = if git_dirty() { ".dirty" } else { "" };
    format!("{PKG_VERSION}+{GIT_BRANCH}.{}{dirty}", short_sha(GIT_SHA))
}
