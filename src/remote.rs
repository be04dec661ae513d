//! Parsing of the `qrexec://` remote URL into a [`RemoteSpec`].

use thiserror::Error;
use url::Url;

pub const URL_SCHEME: &str = "qrexec";

/// Everything the helper needs to know about the remote, parsed once per
/// process from the URL git hands us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSpec {
    /// Name of the domain holding the repository.
    pub peer: String,
    /// Argument appended to every qrexec service name; selects the repository
    /// on the remote side.
    pub repo: String,
    /// Keyring paths, passed through to the signature verifier uninterpreted.
    pub keyrings: Vec<String>,
    /// Ask only for tags pointing at the remote head.
    pub list_head_only: bool,
}

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("invalid url: {0}")]
    Parse(#[from] url::ParseError),

    #[error("invalid scheme: {0:?}")]
    InvalidScheme(String),

    #[error("missing peer domain")]
    MissingPeer,

    #[error("userinfo and ports have no meaning for qrexec peers")]
    ForbiddenAuthority,

    #[error("missing repository argument")]
    MissingRepo,

    #[error("repository argument may not contain a slash: {0:?}")]
    RepoSlash(String),

    #[error("fragments are forbidden")]
    ForbiddenFragment,

    #[error("query component is not a key=value pair: {0:?}")]
    MalformedQueryPair(String),

    #[error("unrecognized query key: {0:?}")]
    UnknownQueryKey(String),

    #[error("query key {0:?} given more than once")]
    DuplicateQueryKey(String),

    #[error("not a boolean: {0:?}")]
    InvalidBool(String),
}

impl RemoteSpec {
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let url = Url::parse(input)?;

        if url.scheme() != URL_SCHEME {
            return Err(UrlError::InvalidScheme(url.scheme().to_string()));
        }
        if url.fragment().is_some() {
            return Err(UrlError::ForbiddenFragment);
        }
        if !url.username().is_empty() || url.password().is_some() || url.port().is_some() {
            return Err(UrlError::ForbiddenAuthority);
        }

        let peer = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(UrlError::MissingPeer),
        };

        let path = url.path();
        let repo = path.strip_prefix('/').unwrap_or(path);
        if repo.is_empty() {
            return Err(UrlError::MissingRepo);
        }
        if repo.contains('/') {
            return Err(UrlError::RepoSlash(repo.to_string()));
        }

        let mut keyrings = Vec::new();
        let mut list_head_only = None;
        if let Some(query) = url.query() {
            for pair in query.split('&') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| UrlError::MalformedQueryPair(pair.to_string()))?;
                match key {
                    "keyring" => keyrings.push(value.to_string()),
                    "list_head_only" => {
                        if list_head_only.is_some() {
                            return Err(UrlError::DuplicateQueryKey(key.to_string()));
                        }
                        list_head_only = Some(parse_bool(value)?);
                    }
                    other => return Err(UrlError::UnknownQueryKey(other.to_string())),
                }
            }
        }

        Ok(RemoteSpec {
            peer,
            repo: repo.to_string(),
            keyrings,
            list_head_only: list_head_only.unwrap_or(true),
        })
    }
}

fn parse_bool(value: &str) -> Result<bool, UrlError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(UrlError::InvalidBool(value.to_string())),
    }
}
