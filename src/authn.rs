use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::exchange::{exchange, Exchange, Peer, Request};
use crate::mfa::{self, Factor, FactorKind};
use crate::verify::verify_factor;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};

/// One snapshot of the IdP's authentication transaction. The status decides
/// which fields exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Unauthenticated { state_token: String },
    PasswordWarn { state_token: String, skip_url: Option<String> },
    MfaRequired { state_token: String, factors: Vec<Factor> },
    Success { session_token: String },
    Unsupported { status: String },
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct TransactionBody {
    status: String,
    state_token: Option<String>,
    session_token: Option<String>,
    #[serde(rename = "_embedded")]
    embedded: Embedded,
    #[serde(rename = "_links")]
    links: Links,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Embedded {
    factors: Vec<FactorBody>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct FactorBody {
    id: String,
    factor_type: String,
    provider: String,
    #[serde(rename = "_links")]
    links: Links,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Links {
    skip: Option<Link>,
    verify: Option<Link>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Link {
    href: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| String::from(v.trim()))
        .filter(|v| !v.is_empty())
}

fn href(link: Option<Link>) -> Option<String> {
    non_empty(link.map(|l| l.href))
}

impl Transaction {
    pub fn parse(body: &Value) -> Result<Transaction> {
        let body = TransactionBody::deserialize(body)?;
        let status = String::from(body.status.trim());

        let transaction = match status.to_ascii_lowercase().as_str() {
            "unauthenticated" => Transaction::Unauthenticated {
                state_token: non_empty(body.state_token).ok_or(Error::MissingStateToken)?,
            },
            "password_warn" => Transaction::PasswordWarn {
                state_token: non_empty(body.state_token).ok_or(Error::MissingStateToken)?,
                skip_url: href(body.links.skip),
            },
            "mfa_required" => {
                let state_token = non_empty(body.state_token).ok_or(Error::MissingStateToken)?;
                let factors: Vec<Factor> = body
                    .embedded
                    .factors
                    .into_iter()
                    .filter_map(|f| {
                        let verify_url = href(f.links.verify)?;
                        let factor_type = f.factor_type.trim().to_ascii_lowercase();
                        let provider = f.provider.trim().to_ascii_lowercase();
                        if factor_type.is_empty() || provider.is_empty() {
                            return None;
                        }
                        Some(Factor {
                            id: String::from(f.id.trim()),
                            kind: FactorKind::parse(&factor_type),
                            provider,
                            verify_url,
                        })
                    })
                    .collect();

                if factors.is_empty() {
                    return Err(Error::NoFactors);
                }
                Transaction::MfaRequired { state_token, factors }
            }
            "success" => Transaction::Success {
                session_token: non_empty(body.session_token).ok_or(Error::MissingSessionToken)?,
            },
            _ => Transaction::Unsupported { status },
        };

        Ok(transaction)
    }

    pub fn status(&self) -> &str {
        match self {
            Transaction::Unauthenticated { .. } => "unauthenticated",
            Transaction::PasswordWarn { .. } => "password_warn",
            Transaction::MfaRequired { .. } => "mfa_required",
            Transaction::Success { .. } => "success",
            Transaction::Unsupported { status } => status,
        }
    }
}

fn credentials(conf: &RunConfig, state_token: Option<&str>) -> Value {
    let mut body = json!({
        "username": conf.username,
        "password": conf.password,
        "options": {
            "warnBeforePasswordExpired": true,
            "multiOptionalFactorEnroll": true
        }
    });
    if let Some(token) = state_token {
        body["stateToken"] = Value::from(token);
    }
    body
}

fn submit<E: Exchange + ?Sized>(http: &mut E, request: &Request) -> Result<Transaction> {
    let reply = exchange(http, request)?;
    Transaction::parse(&reply.json()?)
}

/// Drives the IdP login to a session token.
///
/// Without `state_token` the run starts with the configured credentials;
/// with one, an existing transaction is resumed.
pub fn authenticate<E: Exchange + ?Sized>(
    conf: &RunConfig,
    http: &mut E,
    prompt_func: &dyn Fn(&str, bool) -> Option<String>,
    state_token: Option<&str>,
) -> Result<String> {
    info!("okta auth request [okta_url]");

    let url = conf.authn_url();
    let body = match state_token {
        None => credentials(conf, None),
        Some(token) => json!({ "stateToken": token }),
    };
    let mut credentials_sent = state_token.is_none();

    let mut transaction = submit(
        http,
        &Request::json("auth", &url, body, Peer::IdentityProvider).expecting(&conf.okta_url),
    )?;

    loop {
        debug!("status: {}", transaction.status());

        transaction = match transaction {
            Transaction::Success { session_token } => return Ok(session_token),
            Transaction::Unauthenticated { state_token } => {
                if credentials_sent {
                    return Err(Error::CredentialsRejected);
                }
                credentials_sent = true;

                let request = Request::json(
                    "auth",
                    &url,
                    credentials(conf, Some(&state_token)),
                    Peer::IdentityProvider,
                )
                .expecting(&conf.okta_url);
                submit(http, &request)?
            }
            Transaction::PasswordWarn { state_token, skip_url } => {
                warn!("password expiration warning");

                let skip_url = skip_url.unwrap_or_else(|| format!("{}/skip", url));
                let request = Request::json(
                    "skip",
                    &skip_url,
                    json!({ "stateToken": state_token }),
                    Peer::IdentityProvider,
                )
                .expecting(&conf.okta_url);
                submit(http, &request)?
            }
            Transaction::MfaRequired { state_token, factors } => {
                verify_factors(conf, http, prompt_func, &state_token, factors)?
            }
            Transaction::Unsupported { status } => return Err(Error::UnsupportedStatus(status)),
        };
    }
}

fn verify_factors<E: Exchange + ?Sized>(
    conf: &RunConfig,
    http: &mut E,
    prompt_func: &dyn Fn(&str, bool) -> Option<String>,
    state_token: &str,
    factors: Vec<Factor>,
) -> Result<Transaction> {
    let ranked = mfa::rank(&conf.mfa, factors);
    debug!("factors: {:?}", ranked);

    for candidate in ranked {
        match verify_factor(conf, http, prompt_func, &candidate.factor, state_token)? {
            Some(next) => return Transaction::parse(&next),
            None => debug!(
                "skipped {:?} factor from {}",
                candidate.factor.kind, candidate.factor.provider
            ),
        }
    }

    Err(Error::NoUsableFactor)
}
