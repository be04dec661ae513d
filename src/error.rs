use std::process::ExitStatus;

use thiserror::Error;

use crate::object::ObjectKind;
use crate::remote::UrlError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("thread was unable to join: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },

    #[error("io error while running command: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("process returned nonzero exit code: {exit_code}")]
    Command { exit_code: i32 },

    #[error("timeout expired: {timeout}")]
    Timeout {
        #[from]
        timeout: tokio::time::error::Elapsed,
    },

    #[error("unix call failed: {source}")]
    Unix {
        #[from]
        source: nix::Error,
    },

    #[error("performing git operation on repository failed: {source}")]
    GitOperation {
        #[from]
        source: git2::Error,
    },

    #[error("remote url is invalid: {source}")]
    Url {
        #[from]
        source: UrlError,
    },

    #[error("no qrexec client program is installed")]
    NoRpcClient,

    #[error("qrexec client did not expose its {stream}")]
    ChildStream { stream: &'static str },

    #[error("remote response exceeds the {limit} byte limit")]
    OversizeResponse { limit: u64 },

    #[error("object id is not 40 lowercase hex digits: {input:?}")]
    BadObjectId { input: String },

    #[error("tag name contains disallowed bytes: {input:?}")]
    BadTagName { input: String },

    #[error("object hashes to {computed}, expected {expected}")]
    ObjectIdMismatch { expected: String, computed: String },

    #[error("loose object is malformed: {reason}")]
    MalformedObject { reason: &'static str },

    #[error("unknown object type: {found:?}")]
    UnknownObjectKind { found: String },

    #[error("declared size {declared} does not match content length {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("expected a {expected} object, found a {actual}")]
    KindMismatch {
        expected: ObjectKind,
        actual: ObjectKind,
    },

    #[error("object is missing its {name} header")]
    MissingHeader { name: &'static str },

    #[error("tag names itself {actual:?} but {expected:?} was requested")]
    TagNameMismatch { expected: String, actual: String },

    #[error("tag points at a {target:?} object, only commits are fetchable")]
    TagTarget { target: String },

    #[error("no signature marker found in tag")]
    SignatureMissing,

    #[error("signature verification failed with exit code {exit_code}")]
    SignatureRejected { exit_code: i32 },

    #[error("malformed tag listing line: {line:?}")]
    ListingLine { line: String },

    #[error("tag listing is not newline terminated")]
    ListingTruncated,

    #[error("refname {refname:?} is not under refs/tags/")]
    NotATagRef { refname: String },

    #[error("tree entry {path:?} has an unsupported object type")]
    UnknownTreeEntry { path: String },

    #[error("malformed helper command: {line:?}")]
    HelperCommand { line: String },
}

impl Error {
    /// Assert the program exited with an exit code of zero, assuming zero is a
    /// success case; if an exit code was unobtainable, don't err on the side of
    /// caution.
    pub fn assert_exit_status(xs: ExitStatus) -> Result<ExitStatus> {
        if let Some(n) = xs.code() {
            if n != 0 {
                return Err(Error::Command { exit_code: n });
            }
        }
        // Either an exit code was zero or (unlikely) didn't exist
        Ok(xs)
    }
}
