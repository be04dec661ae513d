//! Detached-signature verification of tag objects by an external gpgv-style
//! binary. Only the child's exit status decides; its stderr is surfaced for
//! diagnostics and nothing more.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, pipe};
use tempdir::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::object::{find_subsequence, GitObject};

const GPGV: &str = "gpgv";

const SIGNATURE_MARKER: &[u8] = b"-----BEGIN PGP SIGNATURE-----";

/// gpgv runs locally, but a wedged pipe handoff must not hang the helper
/// forever.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// The seam between the fetch engine and signature verification. Production
/// code talks to [`Verifier`]; tests substitute a canned verdict.
#[async_trait(?Send)]
pub trait TagVerifier {
    /// Verify the detached signature inside a tag object. Returns the signed
    /// payload on success.
    async fn verify_tag(&self, tag: &GitObject) -> Result<Vec<u8>>;
}

pub struct Verifier {
    keyrings: Vec<String>,
}

#[async_trait(?Send)]
impl TagVerifier for Verifier {
    /// Verify against the configured keyrings by running the external
    /// verifier; only its exit status decides.
    #[instrument(skip_all, fields(tag = %tag.id()))]
    async fn verify_tag(&self, tag: &GitObject) -> Result<Vec<u8>> {
        let (payload, signature) = split_signature(tag.content())?;
        let payload = payload.to_vec();
        let signature = signature.to_vec();

        if supports_special_filenames().await {
            self.verify_with_pipes(signature, payload.clone()).await?;
        } else {
            self.verify_with_fifos(signature, payload.clone()).await?;
        }
        Ok(payload)
    }
}

impl Verifier {
    pub fn new(keyrings: Vec<String>) -> Self {
        Verifier { keyrings }
    }

    /// Preferred transport: two anonymous pipes whose read ends the child
    /// inherits and addresses by fd number.
    async fn verify_with_pipes(&self, signature: Vec<u8>, payload: Vec<u8>) -> Result<()> {
        let (sig_read, sig_write) = inheritable_pipe()?;
        let (payload_read, payload_write) = inheritable_pipe()?;

        let mut command = self.base_command();
        command
            .arg("--enable-special-filenames")
            .arg("--")
            .arg(format!("-&{}", sig_read.as_raw_fd()))
            .arg(format!("-&{}", payload_read.as_raw_fd()));
        let child = command.spawn()?;
        // Our copies of the read ends belong to the child now. Keeping them
        // open would hide a dead child from the writers, which would then
        // block on a pipe nobody reads.
        drop(sig_read);
        drop(payload_read);

        let sig_task = feed(sig_write, signature);
        let payload_task = feed(payload_write, payload);
        self.await_verdict(child, sig_task, payload_task).await
    }

    /// Fallback for verifiers without `--enable-special-filenames`: named
    /// pipes in a scratch directory that unlinks itself on every exit path.
    async fn verify_with_fifos(&self, signature: Vec<u8>, payload: Vec<u8>) -> Result<()> {
        let scratch = TempDir::new("git-remote-qrexec")?;
        let sig_path = scratch.path().join("signature");
        let payload_path = scratch.path().join("payload");
        mkfifo(&sig_path, Mode::S_IRUSR | Mode::S_IWUSR)?;
        mkfifo(&payload_path, Mode::S_IRUSR | Mode::S_IWUSR)?;

        let mut command = self.base_command();
        command.arg("--").arg(&sig_path).arg(&payload_path);
        let child = command.spawn()?;

        let sig_task = feed_fifo(sig_path, signature);
        let payload_task = feed_fifo(payload_path, payload);
        self.await_verdict(child, sig_task, payload_task).await
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(GPGV);
        for keyring in &self.keyrings {
            command.arg(format!("--keyring={}", keyring));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn await_verdict(
        &self,
        child: Child,
        sig_task: JoinHandle<std::io::Result<()>>,
        payload_task: JoinHandle<std::io::Result<()>>,
    ) -> Result<()> {
        let verdict = async move {
            // Both streams must be in flight together: the child may block
            // reading one until the other has been opened for writing.
            let (sig_fed, payload_fed) = tokio::join!(sig_task, payload_task);
            sig_fed??;
            payload_fed??;

            let output = child.wait_with_output().await?;
            dump_stderr(GPGV, &output.stderr).await?;
            debug!(exit_status = ?output.status, "verifier has completed");
            if !output.status.success() {
                return Err(Error::SignatureRejected {
                    exit_code: output.status.code().unwrap_or(-1),
                });
            }
            Ok(())
        };
        tokio::time::timeout(VERIFY_TIMEOUT, verdict).await?
    }
}

/// Split tag content at the OpenPGP signature marker: everything before it is
/// the signed payload, the marker and everything after is the detached
/// signature.
pub(crate) fn split_signature(content: &[u8]) -> Result<(&[u8], &[u8])> {
    let marker = find_subsequence(content, SIGNATURE_MARKER).ok_or(Error::SignatureMissing)?;
    Ok((&content[..marker], &content[marker..]))
}

/// A pipe whose read end survives exec and whose write end does not. A write
/// end leaking into the child would keep the pipe open and the child would
/// never see EOF.
fn inheritable_pipe() -> Result<(File, File)> {
    let (read, write) = pipe()?;
    let read = unsafe { File::from_raw_fd(read) };
    let write = unsafe { File::from_raw_fd(write) };
    fcntl(write.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok((read, write))
}

fn feed(mut sink: File, bytes: Vec<u8>) -> JoinHandle<std::io::Result<()>> {
    tokio::task::spawn_blocking(move || {
        sink.write_all(&bytes)?;
        Ok(())
    })
}

fn feed_fifo(path: PathBuf, bytes: Vec<u8>) -> JoinHandle<std::io::Result<()>> {
    tokio::task::spawn_blocking(move || {
        // Opening a fifo for writing blocks until the verifier opens the
        // read side; this must happen off the protocol task and for both
        // fifos at once.
        let mut sink = OpenOptions::new().write(true).open(path)?;
        sink.write_all(&bytes)?;
        Ok(())
    })
}

/// Whether the verifier knows `--enable-special-filenames`. Probed from its
/// help text; a probe failure just selects the fifo fallback.
async fn supports_special_filenames() -> bool {
    let probe = Command::new(GPGV)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;
    match probe {
        Ok(output) => {
            find_subsequence(&output.stdout, b"--enable-special-filenames").is_some()
                || find_subsequence(&output.stderr, b"--enable-special-filenames").is_some()
        }
        Err(_) => false,
    }
}

/// Surface the verifier's stderr at debug level, one line at a time.
async fn dump_stderr(command: &str, stderr: &[u8]) -> Result<()> {
    let mut lines = stderr.lines();
    while let Some(line) = lines.next_line().await? {
        debug!("{command}: {line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_tag_content() -> Vec<u8> {
        b"object 881eca66ea66195a01242e5da0cbfc984a23f7f9\n\
          type commit\n\
          tag v1\n\
          tagger A U Thor <author@example.com> 1465818665 +0200\n\
          \n\
          release v1\n\
          -----BEGIN PGP SIGNATURE-----\n\
          \n\
          iQEzBAABCAAdFiEEexample\n\
          -----END PGP SIGNATURE-----\n"
            .to_vec()
    }

    #[test]
    fn splits_payload_from_detached_signature() {
        let content = signed_tag_content();
        let (payload, signature) = split_signature(&content).expect("marker should be found");
        assert!(payload.ends_with(b"release v1\n"));
        assert!(signature.starts_with(SIGNATURE_MARKER));
        assert_eq!(payload.len() + signature.len(), content.len());
    }

    #[test]
    fn content_without_marker_is_rejected() {
        let content = b"object 881eca66ea66195a01242e5da0cbfc984a23f7f9\n\
                        type commit\n\
                        tag v2\n\
                        \n\
                        unsigned\n";
        assert!(matches!(
            split_signature(content),
            Err(Error::SignatureMissing)
        ));
    }
}
