use crate::error::{Error, Result};
use cookie_store::CookieStore;
use log::debug;
use native_tls::{Certificate, Identity, TlsConnector};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

pub const USER_AGENT: &str = "PAN GlobalProtect";

const MAX_HTTP_REDIRECTS: usize = 10;

/// The logical peer a request is addressed to. Each peer may be pinned to
/// its own trust anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    IdentityProvider,
    Portal,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Form(Vec<(String, String)>),
    Json(Value),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub name: String,
    pub method: Method,
    pub url: String,
    pub payload: Payload,
    pub peer: Peer,
    pub expected_origin: Option<String>,
}

impl Request {
    pub fn get(name: &str, url: &str, peer: Peer) -> Self {
        Request {
            name: String::from(name),
            method: Method::Get,
            url: String::from(url),
            payload: Payload::Empty,
            peer,
            expected_origin: None,
        }
    }

    pub fn form<I, K, V>(name: &str, url: &str, fields: I, peer: Peer) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Request {
            method: Method::Post,
            payload: Payload::Form(fields),
            ..Request::get(name, url, peer)
        }
    }

    pub fn json(name: &str, url: &str, body: Value, peer: Peer) -> Self {
        Request {
            method: Method::Post,
            payload: Payload::Json(body),
            ..Request::get(name, url, peer)
        }
    }

    /// Fail the exchange if the request or the final response leaves the
    /// scheme and host of `origin`.
    pub fn expecting(mut self, origin: &str) -> Self {
        self.expected_origin = Some(String::from(origin));
        self
    }
}

/// Response headers with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn insert(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_ascii_lowercase(), String::from(value));
    }

    /// Trimmed header value, empty when absent.
    pub fn get(&self, name: &str) -> &str {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(|v| v.trim())
            .unwrap_or("")
    }

    pub fn dump(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::default();
        for (k, v) in iter {
            headers.insert(k.as_ref(), v.as_ref());
        }
        headers
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub url: String,
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

impl Reply {
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn dump(&self) -> String {
        format!("status: {}\n\n{}\n\n{}", self.status, self.headers.dump(), self.body)
    }
}

/// Issues one logical request. Implemented by [`ExchangeSession`] for real
/// traffic and by a scripted exchange in tests.
pub trait Exchange {
    fn send(&mut self, request: &Request) -> Result<Reply>;
}

/// Sends `request` through `http`, enforcing the origin expectation and
/// treating anything but 200 as fatal.
pub fn exchange<E: Exchange + ?Sized>(http: &mut E, request: &Request) -> Result<Reply> {
    debug!("{}.request: {}", request.name, request.url);

    if let Some(expected) = &request.expected_origin {
        check_origin(&request.name, &request.url, expected)?;
    }

    let reply = http.send(request)?;

    if reply.status != 200 {
        return Err(Error::HttpStatus {
            name: request.name.clone(),
            status: reply.status,
            dump: reply.dump(),
        });
    }

    debug!("{}.response:\n{}", request.name, reply.dump());

    if let Some(expected) = &request.expected_origin {
        check_origin(&request.name, &reply.url, expected)?;
    }

    Ok(reply)
}

pub fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|source| Error::Url {
        url: String::from(url),
        source,
    })
}

/// Scheme and host, port ignored.
fn origin(url: &str) -> Result<(String, String)> {
    let parsed = parse_url(url)?;
    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    Ok((String::from(parsed.scheme()), host))
}

pub fn check_origin(name: &str, url: &str, expected: &str) -> Result<()> {
    let found = origin(url)?;
    let wanted = origin(expected)?;

    if found != wanted {
        return Err(Error::UnexpectedOrigin {
            name: String::from(name),
            found: format!("{}://{}", found.0, found.1),
            expected: format!("{}://{}", wanted.0, wanted.1),
        });
    }

    Ok(())
}

/// Trust material for the three peers.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub idp_anchors: Option<PathBuf>,
    pub portal_anchors: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
}

/// The run's HTTP client: one agent per peer and a single cookie jar shared
/// by all of them.
pub struct ExchangeSession {
    idp: ureq::Agent,
    portal: ureq::Agent,
    system: ureq::Agent,
    jar: CookieStore,
}

impl ExchangeSession {
    pub fn new(tls: &TlsSettings) -> Result<Self> {
        let identity = match &tls.client_cert {
            Some(path) => {
                // cert and key live in the same PEM file
                let pem = fs::read(path)?;
                Some(Identity::from_pkcs8(&pem, &pem)?)
            }
            None => None,
        };

        Ok(ExchangeSession {
            idp: build_agent(tls.idp_anchors.as_deref(), identity.as_ref())?,
            portal: build_agent(tls.portal_anchors.as_deref(), identity.as_ref())?,
            system: build_agent(None, identity.as_ref())?,
            jar: CookieStore::default(),
        })
    }

    fn agent(&self, peer: Peer) -> &ureq::Agent {
        match peer {
            Peer::IdentityProvider => &self.idp,
            Peer::Portal => &self.portal,
            Peer::System => &self.system,
        }
    }

    fn send_once(
        &self,
        request: &Request,
        method: Method,
        url: &Url,
        payload: &Payload,
    ) -> Result<ureq::Response> {
        let agent = self.agent(request.peer);

        let mut call = match method {
            Method::Get => agent.get(url.as_str()),
            Method::Post => agent.post(url.as_str()),
        };

        let cookies: Vec<String> = self
            .jar
            .get_request_values(url)
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();

        if !cookies.is_empty() {
            call = call.set("Cookie", &cookies.join("; "));
        }

        let result = match (method, payload) {
            (Method::Get, _) | (_, Payload::Empty) => call.call(),
            (Method::Post, Payload::Form(fields)) => {
                let pairs: Vec<(&str, &str)> = fields
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                call.send_form(&pairs)
            }
            (Method::Post, Payload::Json(body)) => call
                .set("Accept", "application/json")
                .send_json(body),
        };

        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(_code, response)) => Ok(response),
            Err(ureq::Error::Transport(transport)) => Err(Error::Transport {
                name: request.name.clone(),
                source: Box::new(transport),
            }),
        }
    }
}

impl Exchange for ExchangeSession {
    fn send(&mut self, request: &Request) -> Result<Reply> {
        let mut url = parse_url(&request.url)?;
        let mut method = request.method;
        let mut payload = request.payload.clone();

        for _ in 0..=MAX_HTTP_REDIRECTS {
            let response = self.send_once(request, method, &url, &payload)?;

            for set_cookie in response.all("set-cookie") {
                if let Err(e) = self.jar.parse(set_cookie, &url) {
                    debug!("{}: ignoring cookie: {}", request.name, e);
                }
            }

            let status = response.status();
            let location = match status {
                301 | 302 | 303 | 307 | 308 => response.header("location").map(String::from),
                _ => None,
            };
            let next = match location {
                Some(location) => url.join(&location).map_err(|source| Error::Url {
                    url: location.clone(),
                    source,
                })?,
                None => return read_reply(url, response),
            };

            debug!("{}: following {} to {}", request.name, status, next);

            if status == 303 || (method == Method::Post && (status == 301 || status == 302)) {
                method = Method::Get;
                payload = Payload::Empty;
            }
            url = next;
        }

        Err(Error::TooManyHttpRedirects {
            name: request.name.clone(),
        })
    }
}

fn read_reply(url: Url, response: ureq::Response) -> Result<Reply> {
    let status = response.status();
    let headers: Headers = response
        .headers_names()
        .iter()
        .filter_map(|name| response.header(name).map(|value| (name.clone(), String::from(value))))
        .collect();
    let body = response.into_string()?;

    Ok(Reply {
        url: url.to_string(),
        status,
        headers,
        body,
    })
}

fn build_agent(anchors: Option<&Path>, identity: Option<&Identity>) -> Result<ureq::Agent> {
    let mut builder = TlsConnector::builder();

    if let Some(path) = anchors {
        let pem = fs::read_to_string(path)?;
        let certs = pem_certificates(&pem);
        if certs.is_empty() {
            return Err(Error::Config(format!(
                "no certificates found in {}",
                path.display()
            )));
        }

        builder.disable_built_in_roots(true);
        for cert in certs {
            builder.add_root_certificate(Certificate::from_pem(cert.as_bytes())?);
        }
    }

    if let Some(identity) = identity {
        builder.identity(identity.clone());
    }

    let connector = builder.build()?;

    Ok(ureq::AgentBuilder::new()
        .tls_connector(Arc::new(connector))
        .redirects(0)
        .user_agent(USER_AGENT)
        .build())
}

/// Splits a PEM bundle into its individual certificate blocks.
pub fn pem_certificates(pem: &str) -> Vec<String> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let mut certs = Vec::new();
    let mut rest = pem;

    while let Some(start) = rest.find(BEGIN) {
        match rest[start..].find(END) {
            Some(len) => {
                let stop = start + len + END.len();
                certs.push(format!("{}\n", &rest[start..stop]));
                rest = &rest[stop..];
            }
            None => break,
        }
    }

    certs
}
