use crate::authn::authenticate;
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::exchange::{exchange, Exchange, Headers, Peer, Request};
use crate::markup::{self, extract_form, Form};
use log::{debug, info};

pub const MAX_REDIRECT_HOPS: usize = 10;

/// What the portal hands back once the IdP has vouched for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionArtifacts {
    pub username: String,
    pub prelogin_cookie: String,
}

impl SessionArtifacts {
    fn from_headers(headers: &Headers) -> Option<SessionArtifacts> {
        let username = headers.get("saml-username");
        let prelogin_cookie = headers.get("prelogin-cookie");

        if username.is_empty() || prelogin_cookie.is_empty() {
            return None;
        }

        debug!(
            "saml prop: auth-status={:?} slo={:?}",
            headers.get("saml-auth-status"),
            headers.get("saml-slo")
        );

        Some(SessionArtifacts {
            username: String::from(username),
            prelogin_cookie: String::from(prelogin_cookie),
        })
    }
}

/// The next hop of the chase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectState {
    Follow(String),
    Submit(Form),
}

/// Posts the portal's SAML form to the IdP and returns where the IdP wants
/// the browser to go next.
pub fn saml_handoff<E: Exchange + ?Sized>(conf: &RunConfig, http: &mut E, saml_page: &str) -> Result<String> {
    info!("okta saml request [okta_url]");

    let form = extract_form(saml_page, None)?;
    let request = Request::form("saml", &form.action, form.fields, Peer::IdentityProvider)
        .expecting(&conf.okta_url);
    let reply = exchange(http, &request)?;

    markup::redirect_url(&reply.body, Some(&reply.url))?.ok_or(Error::MissingField("redirect url"))
}

/// Follows IdP redirects and auto-submit forms until the portal answers with
/// the SAML username and prelogin cookie headers.
pub fn chase<E: Exchange + ?Sized>(
    conf: &RunConfig,
    http: &mut E,
    prompt_func: &dyn Fn(&str, bool) -> Option<String>,
    session_token: String,
    redirect_url: String,
) -> Result<SessionArtifacts> {
    let mut session_token = session_token;
    let mut state = RedirectState::Follow(redirect_url);

    for hop in 1..=MAX_REDIRECT_HOPS {
        let reply = match &state {
            RedirectState::Follow(redirect_url) => {
                info!("okta redirect request {} [okta_url]", hop);
                let url = format!("{}/login/sessionCookieRedirect", conf.okta_url);
                let fields = [
                    ("checkAccountSetupComplete", "true"),
                    ("report", "true"),
                    ("token", session_token.as_str()),
                    ("redirectUrl", redirect_url.as_str()),
                ];
                exchange(http, &Request::form("redirect", &url, fields, Peer::IdentityProvider))?
            }
            RedirectState::Submit(form) => {
                info!("okta redirect form request [vpn_url]");
                let request = Request::form("redirect form", &form.action, form.fields.clone(), Peer::Portal)
                    .expecting(&conf.vpn_url);
                exchange(http, &request)?
            }
        };

        if let Some(artifacts) = SessionArtifacts::from_headers(&reply.headers) {
            return Ok(artifacts);
        }

        // a pending form is re-posted until the portal answers
        if let RedirectState::Submit(_) = state {
            continue;
        }

        if let Some(state_token) = markup::state_token(&reply.body) {
            info!("stateToken: {}", state_token);
            session_token = authenticate(conf, http, prompt_func, Some(&state_token))?;
        }

        state = match markup::redirect_url(&reply.body, Some(&reply.url))? {
            Some(next) => RedirectState::Follow(next),
            None => RedirectState::Submit(extract_form(&reply.body, Some(&reply.url))?),
        };
    }

    Err(Error::RedirectLoopTooDeep(MAX_REDIRECT_HOPS))
}

/// The second SAML round trip some portals ask for. Unlike [`chase`] it posts
/// exactly two forms, trusts the system roots, and checks no hosts.
pub fn relaxed_handoff<E: Exchange + ?Sized>(http: &mut E, saml_page: &str) -> Result<SessionArtifacts> {
    info!("okta saml request");

    let form = extract_form(saml_page, None)?;
    let reply = exchange(http, &Request::form("redirect", &form.action, form.fields, Peer::System))?;

    let form = extract_form(&reply.body, None)?;
    info!("okta redirect form request");
    let reply = exchange(http, &Request::form("form", &form.action, form.fields, Peer::System))?;

    let username = reply.headers.get("saml-username");
    if username.is_empty() {
        return Err(Error::MissingField("saml-username"));
    }
    let prelogin_cookie = reply.headers.get("prelogin-cookie");
    if prelogin_cookie.is_empty() {
        return Err(Error::MissingField("prelogin-cookie"));
    }

    Ok(SessionArtifacts {
        username: String::from(username),
        prelogin_cookie: String::from(prelogin_cookie),
    })
}
