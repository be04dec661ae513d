//! The qrexec RPC client. One call = one child process carrying the service
//! invocation to the peer domain; the response is capped in size and time
//! before anything looks at it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::remote::RemoteSpec;
use crate::untrusted::Untrusted;

/// The seam between the fetch engine and the RPC layer. Production code
/// talks to [`Transport`]; tests replay sessions against a canned peer.
#[async_trait(?Send)]
pub trait RpcTransport {
    /// Invoke `<service>+<repo>` on the peer, feeding it `input` (if any)
    /// and returning whatever it wrote back, still untrusted.
    async fn call(&self, service: &str, input: Option<&[u8]>) -> Result<Untrusted<Vec<u8>>>;
}

/// Hard cap on a single RPC response. The peer controls the stream; it does
/// not get to control our memory.
pub const MAX_RESPONSE_BYTES: u64 = 10 * 1024 * 1024;

/// Deadline for a whole RPC round trip.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

const CLIENT_VM: &str = "/usr/lib/qubes/qrexec-client-vm";
const CLIENT_DOM0: &str = "/usr/lib/qubes/qrexec-client";

pub struct Transport {
    peer: String,
    repo: String,
}

impl Transport {
    pub fn new(spec: &RemoteSpec) -> Self {
        Transport {
            peer: spec.peer.clone(),
            repo: spec.repo.clone(),
        }
    }

    /// Pick whichever qrexec client this system carries. A VM has
    /// qrexec-client-vm; dom0 has qrexec-client with its own argument shape.
    fn client_command(&self, service: &str) -> Result<Command> {
        if Path::new(CLIENT_VM).exists() {
            let mut command = Command::new(CLIENT_VM);
            command.arg(&self.peer).arg(service);
            Ok(command)
        } else if Path::new(CLIENT_DOM0).exists() {
            let mut command = Command::new(CLIENT_DOM0);
            command
                .arg("-d")
                .arg(&self.peer)
                .arg(format!("DEFAULT:QUBESRPC {} dom0", service));
            Ok(command)
        } else {
            Err(Error::NoRpcClient)
        }
    }
}

#[async_trait(?Send)]
impl RpcTransport for Transport {
    #[instrument(skip_all, fields(service = service))]
    async fn call(&self, service: &str, input: Option<&[u8]>) -> Result<Untrusted<Vec<u8>>> {
        let service = format!("{}+{}", service, self.repo);
        let mut command = self.client_command(&service)?;
        command
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let input = input.map(<[u8]>::to_vec);
        let call = async move {
            let mut child = command.spawn()?;
            let stdin = child.stdin.take();
            let mut stdout = child
                .stdout
                .take()
                .ok_or(Error::ChildStream { stream: "stdout" })?;

            let feed = async {
                if let Some(mut stdin) = stdin {
                    if let Some(bytes) = &input {
                        stdin.write_all(bytes).await?;
                    }
                    stdin.shutdown().await?;
                }
                Ok::<_, Error>(())
            };
            let drain = async {
                let mut buf = Vec::new();
                (&mut stdout)
                    .take(MAX_RESPONSE_BYTES + 1)
                    .read_to_end(&mut buf)
                    .await?;
                Ok::<_, Error>(buf)
            };
            let ((), response) = tokio::try_join!(feed, drain)?;

            if response.len() as u64 > MAX_RESPONSE_BYTES {
                // kill_on_drop reaps the still-streaming child.
                return Err(Error::OversizeResponse {
                    limit: MAX_RESPONSE_BYTES,
                });
            }

            let status = child.wait().await?;
            debug!(exit_status = ?status, bytes = response.len(), "rpc call has completed");
            Error::assert_exit_status(status)?;
            Ok(Untrusted::new(response))
        };

        tokio::time::timeout(CALL_TIMEOUT, call).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_fail_cleanly_without_a_qrexec_client() {
        // Development machines are not Qubes domains; the probe paths are
        // absent and the call must refuse rather than guess.
        let spec = RemoteSpec::parse("qrexec://work/repo").expect("url should parse");
        let transport = Transport::new(&spec);
        let result = transport.call("git.List", None).await;
        assert!(matches!(result, Err(Error::NoRpcClient)));
    }
}
