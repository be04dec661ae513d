use std::path::PathBuf;

use clap::Parser;

/// Fetch signed tags and their history from a git repository living in
/// another qrexec domain.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Name of the remote as configured in git; a repeat of the URL when the
    /// remote was given inline
    #[clap(value_parser)]
    pub(crate) remote: String,

    /// Remote URL, `qrexec://<domain>/<repo>[?keyring=<path>&list_head_only=<bool>]`
    #[clap(value_parser)]
    pub(crate) url: String,

    /// Local git directory; the calling git process supplies this via the
    /// environment
    #[clap(long, env = "GIT_DIR", value_parser)]
    pub(crate) git_dir: PathBuf,
}
