use thiserror::Error;

/// Everything that can abort a login run. None of these are retried.
#[derive(Debug, Error)]
pub enum Error {
    // transport / protocol
    #[error("{name} request failed with status {status}\n{dump}")]
    HttpStatus {
        name: String,
        status: u16,
        dump: String,
    },
    #[error("{name}: transport failure: {source}")]
    Transport {
        name: String,
        #[source]
        source: Box<ureq::Transport>,
    },
    #[error("{name}: unexpected url found {found} != {expected}")]
    UnexpectedOrigin {
        name: String,
        found: String,
        expected: String,
    },
    #[error("{name}: too many http redirects")]
    TooManyHttpRedirects { name: String },
    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    // parse
    #[error("invalid url {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse xml: {0}")]
    Xml(#[from] xmltree::ParseError),
    #[error("failed to decode {element} payload: {reason}")]
    Payload { element: String, reason: String },
    #[error("did not find a form in {0}")]
    MissingForm(String),
    #[error("bad selector {0}")]
    Selector(String),
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error("bad totp secret for provider {provider}: {reason}")]
    TotpSecret { provider: String, reason: String },

    // protocol contract
    #[error("empty state token")]
    MissingStateToken,
    #[error("empty session token")]
    MissingSessionToken,
    #[error("no factors found")]
    NoFactors,
    #[error("did not find {0}")]
    MissingField(&'static str),
    #[error("unknown status: {0}")]
    UnsupportedStatus(String),
    #[error("credentials were not accepted")]
    CredentialsRejected,
    #[error("did not find saml request. {0}")]
    PortalRejected(String),

    // exhaustion
    #[error("no factors processed")]
    NoUsableFactor,
    #[error("redirect loop too deep (more than {0} hops)")]
    RedirectLoopTooDeep(usize),

    #[error("cannot run {command}: {reason}")]
    Launch { command: String, reason: String },
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
