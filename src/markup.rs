//! Defensive extraction from the HTML, XML, and inline script the IdP and
//! the portal send back.

use crate::error::{Error, Result};
use crate::exchange::parse_url;
use base64::{engine::general_purpose::STANDARD, Engine};
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use xmltree::{Element, XMLNode};

/// An auto-submit form: where it posts and what it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form {
    pub action: String,
    pub fields: BTreeMap<String, String>,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| Error::Selector(format!("{}: {:?}", css, e)))
}

/// Finds the first `<form>` and every named input with a value.
///
/// Inputs with an empty value (unchecked boxes, blank text fields) are left
/// out. A relative action is resolved against `current_url` when one is
/// known.
pub fn extract_form(html: &str, current_url: Option<&str>) -> Result<Form> {
    let document = Html::parse_document(html);

    let form = match document.select(&selector("form")?).next() {
        Some(form) => form,
        None => return Err(Error::MissingForm(String::from(current_url.unwrap_or("page")))),
    };

    let mut action = String::from(form.value().attr("action").unwrap_or("").trim());

    if !action.starts_with("http") {
        if let Some(current) = current_url {
            let joined = parse_url(current)?
                .join(&action)
                .map_err(|source| Error::Url {
                    url: action.clone(),
                    source,
                })?;
            action = joined.to_string();
        }
    }

    let mut fields = BTreeMap::new();

    for input in document.select(&selector("input")?) {
        let name = input.value().attr("name").unwrap_or("").trim();
        let value = input.value().attr("value").unwrap_or("").trim();

        if !name.is_empty() && !value.is_empty() {
            fields.insert(String::from(name), String::from(value));
        }
    }

    Ok(Form { action, fields })
}

pub fn parse_xml(text: &str) -> Result<Element> {
    Ok(Element::parse(text.trim().as_bytes())?)
}

/// Depth-first search for the first element called `name`, `root` included.
pub fn find<'a>(root: &'a Element, name: &str) -> Option<&'a Element> {
    if root.name == name {
        return Some(root);
    }

    root.children.iter().find_map(|child| match child {
        XMLNode::Element(element) => find(element, name),
        _ => None,
    })
}

/// Every element called `name` below `root`, in document order.
pub fn find_all<'a>(root: &'a Element, name: &str) -> Vec<&'a Element> {
    let mut found = Vec::new();
    collect(root, name, &mut found);
    found
}

fn collect<'a>(element: &'a Element, name: &str, found: &mut Vec<&'a Element>) {
    for child in &element.children {
        if let XMLNode::Element(child) = child {
            if child.name == name {
                found.push(child);
            }
            collect(child, name, found);
        }
    }
}

pub fn text_of(element: &Element) -> String {
    element
        .get_text()
        .map(|text| String::from(text.trim()))
        .unwrap_or_default()
}

/// Base64-decodes the text of an embedded payload element into the HTML
/// page it carries.
pub fn decode_payload(element: &str, encoded: &str) -> Result<String> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();

    if compact.is_empty() {
        return Err(Error::Payload {
            element: String::from(element),
            reason: String::from("empty payload"),
        });
    }

    let raw = STANDARD.decode(compact.as_bytes()).map_err(|e| Error::Payload {
        element: String::from(element),
        reason: e.to_string(),
    })?;

    String::from_utf8(raw).map_err(|e| Error::Payload {
        element: String::from(element),
        reason: e.to_string(),
    })
}

static SCRIPT_STRING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"var\s*([A-Za-z_$][\w$]*)\s*=\s*'([^']+)'").expect("SCRIPT_STRING is a valid regex pattern")
});

fn script_string(page: &str, name: &str) -> Option<String> {
    SCRIPT_STRING
        .captures_iter(page)
        .find(|caps| &caps[1] == name)
        .map(|caps| String::from(unescape(&caps[2]).trim()))
}

/// The short-lived `stateToken` a login page hands to its script.
pub fn state_token(page: &str) -> Option<String> {
    let token = script_string(page, "stateToken");
    if token.is_none() {
        log::debug!("not found: stateToken");
    }
    token
}

/// The destination a login page would send the browser to: `fromUri`,
/// prefixed by `baseUrl` when relative.
pub fn redirect_url(page: &str, current_url: Option<&str>) -> Result<Option<String>> {
    let from_uri = match script_string(page, "fromUri") {
        Some(uri) => uri,
        None => {
            log::debug!("not found: fromUri");
            return Ok(None);
        }
    };

    if from_uri.starts_with("http") {
        return Ok(Some(from_uri));
    }

    match script_string(page, "baseUrl") {
        Some(base) => Ok(Some(format!("{}{}", base, from_uri))),
        None => {
            log::debug!("not found: baseUrl");
            match current_url {
                Some(current) => match parse_url(current)?.join(&from_uri) {
                    Ok(url) => Ok(Some(url.to_string())),
                    Err(_) => Ok(Some(from_uri)),
                },
                None => Ok(Some(from_uri)),
            }
        }
    }
}

/// Resolves the backslash escapes a script string literal may contain.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some(c @ ('\\' | '\'' | '"' | '/')) => out.push(c),
            Some(c @ ('x' | 'u')) => {
                let width = if c == 'x' { 2 } else { 4 };
                let digits: String = chars.clone().take(width).collect();
                let decoded = if digits.len() == width && digits.chars().all(|d| d.is_ascii_hexdigit()) {
                    u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32)
                } else {
                    None
                };
                match decoded {
                    Some(decoded) => {
                        out.push(decoded);
                        for _ in 0..width {
                            chars.next();
                        }
                    }
                    _ => {
                        out.push('\\');
                        out.push(c);
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_PAGE: &str = r#"<html><body>
        <form id="appForm" action="/app/panw/sso/saml" method="POST">
          <input type="hidden" name="SAMLResponse" value=" PHNhbWw+ "/>
          <input type="hidden" name="RelayState" value=""/>
          <input type="checkbox" name="remember"/>
          <input type="submit" value="Continue"/>
        </form></body></html>"#;

    #[test]
    fn form_resolves_relative_action_and_skips_empty_inputs() {
        let form = extract_form(LOGIN_PAGE, Some("https://idp.example.com/login/redirect")).unwrap();

        assert_eq!(form.action, "https://idp.example.com/app/panw/sso/saml");
        assert_eq!(form.fields.len(), 1);
        assert_eq!(form.fields["SAMLResponse"], "PHNhbWw+");
    }

    #[test]
    fn form_action_left_alone_without_current_url() {
        let form = extract_form(LOGIN_PAGE, None).unwrap();
        assert_eq!(form.action, "/app/panw/sso/saml");
    }

    #[test]
    fn form_extraction_is_idempotent() {
        let url = Some("https://idp.example.com/x");
        assert_eq!(extract_form(LOGIN_PAGE, url).unwrap(), extract_form(LOGIN_PAGE, url).unwrap());
    }

    #[test]
    fn missing_form_is_an_error() {
        let err = extract_form("<html><p>nothing</p></html>", None).unwrap_err();
        assert!(matches!(err, Error::MissingForm(_)));
    }

    #[test]
    fn malformed_html_does_not_panic() {
        let form = extract_form("<form action='https://a.example/x'><input name=a value=1></span></div>", None).unwrap();
        assert_eq!(form.action, "https://a.example/x");
        assert_eq!(form.fields["a"], "1");
    }

    #[test]
    fn decodes_embedded_payload() {
        let encoded = STANDARD.encode("<html><form action=\"https://idp.example.com/sso\"></form></html>");
        let wrapped = format!("{}\n{}", &encoded[..10], &encoded[10..]);
        let page = decode_payload("saml-request", &wrapped).unwrap();
        assert!(page.contains("https://idp.example.com/sso"));
    }

    #[test]
    fn bad_payload_is_fatal() {
        assert!(decode_payload("saml-request", "!!!not base64").is_err());
        assert!(decode_payload("saml-request", "   ").is_err());
    }

    #[test]
    fn finds_nested_xml_elements() {
        let root = parse_xml(
            "<policy><gateways><external><list><entry name=\"gw1\"/><entry name=\"gw2\"/></list></external></gateways></policy>",
        )
        .unwrap();

        let gateways = find(&root, "gateways").unwrap();
        let entries = find_all(gateways, "entry");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].attributes.get("name").map(String::as_str), Some("gw1"));
        assert!(find(&root, "root-ca").is_none());
    }

    #[test]
    fn extracts_state_token() {
        let page = r"<script>var stateToken = '00abc\x2Ddef';</script>";
        assert_eq!(state_token(page).as_deref(), Some("00abc-def"));
        assert_eq!(state_token("<html></html>"), None);
    }

    #[test]
    fn redirect_url_variants() {
        let absolute = r"var fromUri = 'https\x3A\x2F\x2Fidp.example.com\x2Fapp';";
        assert_eq!(
            redirect_url(absolute, None).unwrap().as_deref(),
            Some("https://idp.example.com/app")
        );

        let based = r"var baseUrl = 'https\x3A\x2F\x2Fidp.example.com'; var fromUri = '\x2Fapp\x2Fsso';";
        assert_eq!(
            redirect_url(based, None).unwrap().as_deref(),
            Some("https://idp.example.com/app/sso")
        );

        let relative = r"var fromUri = '\x2Fapp\x2Fsso';";
        assert_eq!(
            redirect_url(relative, Some("https://idp.example.com/login/x")).unwrap().as_deref(),
            Some("https://idp.example.com/app/sso")
        );
        assert_eq!(redirect_url(relative, None).unwrap().as_deref(), Some("/app/sso"));

        assert_eq!(redirect_url("var baseUrl = 'x';", None).unwrap(), None);
    }

    #[test]
    fn unescape_handles_common_sequences() {
        assert_eq!(unescape(r"a\nb\tc"), "a\nb\tc");
        assert_eq!(unescape(r"A\x42\/\\"), "AB/\\");
        assert_eq!(unescape(r"\q\x4"), r"\q\x4");
    }

    #[test]
    fn unescape_rejects_signed_hex_digits() {
        assert_eq!(unescape(r"\x+1"), r"\x+1");
        assert_eq!(unescape(r"\u+041x"), r"\u+041x");
        assert_eq!(unescape(r"\u0041"), "A");
    }

    #[test]
    fn script_strings_are_matched_by_name() {
        let page = r"var baseUrl = 'https://idp.example.com'; var stateTokenOld = 'no'; var stateToken = 'yes';";
        assert_eq!(state_token(page).as_deref(), Some("yes"));
    }
}
