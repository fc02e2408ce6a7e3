use crate::bundle::TrustBundle;
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::exchange::{exchange, Exchange, Peer, Request};
use crate::markup::{decode_payload, find, find_all, parse_xml, text_of};
use crate::redirect::SessionArtifacts;
use log::{debug, info};

/// Asks the portal to start a SAML login and returns the decoded page it
/// wants posted to the IdP. `again` uses the gateway-style endpoint for the
/// second round trip.
pub fn prelogin<E: Exchange + ?Sized>(conf: &RunConfig, http: &mut E, again: bool) -> Result<String> {
    info!("prelogin request [vpn_url]");

    let url = if again {
        format!("{}/ssl-vpn/prelogin.esp", conf.vpn_url)
    } else {
        format!("{}/global-protect/prelogin.esp", conf.vpn_url)
    };
    let reply = exchange(http, &Request::get("prelogin", &url, Peer::Portal))?;

    let root = parse_xml(&reply.body)?;
    let saml_request = match find(&root, "saml-request") {
        Some(element) => element,
        None => {
            let msg = find(&root, "msg")
                .map(text_of)
                .unwrap_or_else(|| String::from("Probably you need a certificate?"));
            return Err(Error::PortalRejected(msg));
        }
    };

    let page = decode_payload("saml-request", &text_of(saml_request))?;
    debug!("prelogin.decoded:\n{}", page);
    Ok(page)
}

/// What the portal config grants the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalGrant {
    pub auth_cookie: String,
    pub gateway: Option<String>,
    pub certificates: Vec<String>,
}

pub fn parse_portal_config(xml: &str) -> Result<PortalGrant> {
    let root = parse_xml(xml)?;

    let auth_cookie = find(&root, "portal-userauthcookie")
        .map(text_of)
        .ok_or(Error::MissingField("portal-userauthcookie"))?;
    if auth_cookie.is_empty() {
        return Err(Error::MissingField("portal-userauthcookie value"));
    }

    let gateway = find(&root, "gateways")
        .and_then(|gateways| find_all(gateways, "entry").into_iter().next())
        .and_then(|entry| entry.attributes.get("name"))
        .map(|name| String::from(name.trim()))
        .filter(|name| !name.is_empty());

    let certificates = match find(&root, "root-ca") {
        Some(root_ca) => find_all(root_ca, "cert")
            .into_iter()
            .map(text_of)
            .filter(|cert| !cert.is_empty())
            .collect(),
        None => Vec::new(),
    };

    Ok(PortalGrant {
        auth_cookie,
        gateway,
        certificates,
    })
}

/// Trades the prelogin cookie for the portal configuration. Root CAs it
/// lists are added to `bundle`.
pub fn fetch_config<E: Exchange + ?Sized>(
    conf: &RunConfig,
    http: &mut E,
    artifacts: &SessionArtifacts,
    bundle: &mut TrustBundle,
) -> Result<PortalGrant> {
    info!("getconfig request [vpn_url]");

    let url = format!("{}/global-protect/getconfig.esp", conf.vpn_url);
    let fields = [
        ("user", artifacts.username.as_str()),
        ("passwd", ""),
        ("inputStr", ""),
        ("clientVer", "4100"),
        ("clientos", "Windows"),
        ("clientgpversion", "4.1.0.98"),
        ("computer", "DESKTOP"),
        ("os-version", "Microsoft Windows 10 Pro, 64-bit"),
        ("prelogin-cookie", artifacts.prelogin_cookie.as_str()),
        ("ipv6-support", "yes"),
    ];
    let reply = exchange(http, &Request::form("getconfig", &url, fields, Peer::Portal))?;

    let grant = parse_portal_config(&reply.body)?;
    for cert in &grant.certificates {
        bundle.append(cert)?;
    }
    bundle.flush()?;

    Ok(grant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::exchange::testing::ScriptedExchange;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use std::fs;

    const CONFIG_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<policy>
  <portal-name>GP-Portal</portal-name>
  <portal-userauthcookie>AUTHCOOKIE</portal-userauthcookie>
  <gateways>
    <external>
      <list>
        <entry name="gw1.example.com"><description>one</description></entry>
        <entry name="gw2.example.com"><description>two</description></entry>
      </list>
    </external>
  </gateways>
  <root-ca>
    <entry name="ca1"><cert>-----BEGIN CERTIFICATE-----
AAA
-----END CERTIFICATE-----</cert></entry>
    <entry name="ca2"><cert>-----BEGIN CERTIFICATE-----
BBB
-----END CERTIFICATE-----
</cert></entry>
  </root-ca>
</policy>"#;

    fn artifacts() -> SessionArtifacts {
        SessionArtifacts {
            username: String::from("alice"),
            prelogin_cookie: String::from("pc"),
        }
    }

    #[test]
    fn prelogin_decodes_saml_request() {
        let conf = test_config("");
        let encoded = STANDARD.encode("<form action=\"https://example.okta.com/sso\"></form>");
        let body = format!("<prelogin-response><status>Success</status><saml-request>{}</saml-request></prelogin-response>", encoded);
        let mut http = ScriptedExchange::new().reply(&body);

        let page = prelogin(&conf, &mut http, false).unwrap();

        assert!(page.contains("https://example.okta.com/sso"));
        assert_eq!(http.urls(), vec!["https://vpn.example.com/global-protect/prelogin.esp"]);
    }

    #[test]
    fn second_prelogin_uses_gateway_endpoint() {
        let conf = test_config("");
        let body = format!("<r><saml-request>{}</saml-request></r>", STANDARD.encode("<form></form>"));
        let mut http = ScriptedExchange::new().reply(&body);

        prelogin(&conf, &mut http, true).unwrap();
        assert_eq!(http.urls(), vec!["https://vpn.example.com/ssl-vpn/prelogin.esp"]);
    }

    #[test]
    fn prelogin_rejection_reports_portal_message() {
        let conf = test_config("");
        let mut http = ScriptedExchange::new()
            .reply("<prelogin-response><status>Error</status><msg> Valid client certificate is required </msg></prelogin-response>")
            .reply("<prelogin-response><status>Error</status></prelogin-response>");

        match prelogin(&conf, &mut http, false) {
            Err(Error::PortalRejected(msg)) => assert_eq!(msg, "Valid client certificate is required"),
            other => panic!("unexpected {:?}", other),
        }
        match prelogin(&conf, &mut http, false) {
            Err(Error::PortalRejected(msg)) => assert_eq!(msg, "Probably you need a certificate?"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_saml_request_is_fatal() {
        let conf = test_config("");
        let mut http = ScriptedExchange::new().reply("<r><saml-request> </saml-request></r>");

        assert!(matches!(prelogin(&conf, &mut http, false), Err(Error::Payload { .. })));
    }

    #[test]
    fn parses_portal_config() {
        let grant = parse_portal_config(CONFIG_XML).unwrap();

        assert_eq!(grant.auth_cookie, "AUTHCOOKIE");
        assert_eq!(grant.gateway.as_deref(), Some("gw1.example.com"));
        assert_eq!(grant.certificates.len(), 2);
        assert!(grant.certificates[1].ends_with("-----END CERTIFICATE-----"));
    }

    #[test]
    fn missing_or_empty_auth_cookie_is_fatal() {
        assert!(matches!(
            parse_portal_config("<policy><gateways/></policy>"),
            Err(Error::MissingField("portal-userauthcookie"))
        ));
        assert!(parse_portal_config("<policy><portal-userauthcookie></portal-userauthcookie></policy>").is_err());
    }

    #[test]
    fn config_without_gateways_or_cas() {
        let grant = parse_portal_config("<policy><portal-userauthcookie>empty</portal-userauthcookie></policy>").unwrap();
        assert_eq!(grant.gateway, None);
        assert!(grant.certificates.is_empty());
    }

    #[test]
    fn fetch_config_posts_device_profile_and_collects_cas() {
        let conf = test_config("");
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = TrustBundle::create(Some(&dir.path().join("ca.pem"))).unwrap();
        let mut http = ScriptedExchange::new().reply(CONFIG_XML);

        let grant = fetch_config(&conf, &mut http, &artifacts(), &mut bundle).unwrap();

        assert_eq!(grant.auth_cookie, "AUTHCOOKIE");
        assert_eq!(http.urls(), vec!["https://vpn.example.com/global-protect/getconfig.esp"]);
        match &http.sent[0].payload {
            crate::exchange::Payload::Form(fields) => {
                assert!(fields.contains(&(String::from("user"), String::from("alice"))));
                assert!(fields.contains(&(String::from("prelogin-cookie"), String::from("pc"))));
                assert!(fields.contains(&(String::from("clientos"), String::from("Windows"))));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let written = fs::read_to_string(bundle.path()).unwrap();
        assert!(written.contains("AAA"));
        assert!(written.contains("BBB"));
    }
}
