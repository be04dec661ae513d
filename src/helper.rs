//! The git-remote-helper dialect: a line-oriented state machine driven by the
//! parent git process over our standard streams. Generic over the streams so
//! sessions can be replayed in tests.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::reload;
use tracing_subscriber::Registry;

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::object::ObjectId;

/// Runtime control over the log filter, so `option verbosity` from the
/// parent process actually changes what ends up on stderr.
pub struct LogControl {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogControl {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        LogControl {
            handle: Some(handle),
        }
    }

    /// A control with nothing to control; the filter stays as initialized.
    #[cfg(test)]
    pub fn fixed() -> Self {
        LogControl { handle: None }
    }

    pub fn set_verbosity(&self, verbosity: i64) {
        let directive = match verbosity {
            i64::MIN..=0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        if let Some(handle) = &self.handle {
            if let Err(error) = handle.reload(EnvFilter::new(directive)) {
                warn!(%error, "unable to adjust the log filter");
            }
        }
        debug!(verbosity, directive, "verbosity adjusted");
    }
}

pub struct Driver<R, W> {
    input: R,
    output: W,
    fetcher: Fetcher,
    log: LogControl,
    followtags: bool,
}

impl<R, W> Driver<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(fetcher: Fetcher, input: R, output: W, log: LogControl) -> Self {
        Driver {
            input,
            output,
            fetcher,
            log,
            followtags: false,
        }
    }

    /// Process commands until the parent closes our input. Unknown commands
    /// are ignored; anything that fails verification tears the session down.
    pub async fn run(mut self) -> Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.input.read_line(&mut line).await? == 0 {
                debug!("end of input, session complete");
                return Ok(());
            }
            let command = line.trim_end_matches('\n');

            if command == "capabilities" {
                self.capabilities().await?;
            } else if command == "list" || command == "list for-push" {
                self.list().await?;
            } else if let Some(rest) = command.strip_prefix("option ") {
                self.option(rest).await?;
            } else if let Some(rest) = command.strip_prefix("fetch ") {
                let first = parse_fetch_command(rest)?;
                self.fetch_batch(first).await?;
            } else if command.is_empty() {
                debug!("ignoring stray blank line");
            } else {
                debug!(?command, "ignoring unknown command");
            }
        }
    }

    async fn capabilities(&mut self) -> Result<()> {
        self.output.write_all(b"fetch\noption\n\n").await?;
        self.output.flush().await?;
        Ok(())
    }

    async fn list(&mut self) -> Result<()> {
        let tags = self.fetcher.list().await?;
        let mut response = String::new();
        for entry in &tags {
            response.push_str(&format!("{} refs/tags/{}\n", entry.tag, entry.name));
            response.push_str(&format!("{} refs/tags/{}^{{}}\n", entry.commit, entry.name));
        }
        response.push('\n');
        self.output.write_all(response.as_bytes()).await?;
        self.output.flush().await?;
        Ok(())
    }

    async fn option(&mut self, rest: &str) -> Result<()> {
        let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
        let response = match name {
            "verbosity" => match value.parse::<i64>() {
                Ok(level) => {
                    self.log.set_verbosity(level);
                    "ok"
                }
                Err(_) => "unsupported",
            },
            "followtags" => match value {
                "true" => {
                    self.followtags = true;
                    "ok"
                }
                "false" => {
                    self.followtags = false;
                    "ok"
                }
                _ => "unsupported",
            },
            _ => "unsupported",
        };
        self.output.write_all(response.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        self.output.flush().await?;
        Ok(())
    }

    /// Consume the rest of a fetch batch, then run the fetches in order and
    /// answer with the single blank line the dialect wants.
    async fn fetch_batch(&mut self, first: (ObjectId, String)) -> Result<()> {
        let mut batch = vec![first];
        let mut line = String::new();
        loop {
            line.clear();
            if self.input.read_line(&mut line).await? == 0 {
                break;
            }
            let command = line.trim_end_matches('\n');
            if command.is_empty() {
                break;
            }
            match command.strip_prefix("fetch ") {
                Some(rest) => batch.push(parse_fetch_command(rest)?),
                None => debug!(?command, "ignoring non-fetch command inside a fetch batch"),
            }
        }

        // followtags is recorded but never consulted: signed tags are the
        // only fetchable refs, so there is nothing extra to follow.
        debug!(count = batch.len(), followtags = self.followtags, "processing fetch batch");
        for (id, refname) in &batch {
            self.fetcher.fetch(id, refname).await?;
        }
        self.output.write_all(b"\n").await?;
        self.output.flush().await?;
        Ok(())
    }
}

fn parse_fetch_command(rest: &str) -> Result<(ObjectId, String)> {
    let (sha1, refname) = rest.split_once(' ').ok_or_else(|| Error::HelperCommand {
        line: format!("fetch {}", rest),
    })?;
    Ok((ObjectId::from_hex(sha1)?, refname.to_string()))
}
