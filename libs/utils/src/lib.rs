//! Small helpers shared by the backup tool's crates.

pub mod bitmap;
pub mod crashsafe;
pub mod lock_file;
pub mod logging;
pub mod lsn;

/// Expose the git version of the calling crate as a `&'static str` constant.
///
/// We rely on a fallback so that builds from a source tarball (no `.git`)
/// still succeed.
#[macro_export]
macro_rules! project_git_version {
    ($const_identifier:ident) => {
        const $const_identifier: &::core::primitive::str = ::git_version::git_version!(
            prefix = "git:",
            fallback = "git-env:local",
            args = ["--abbrev=40", "--always", "--dirty=-modified"]
        );
    };
}
