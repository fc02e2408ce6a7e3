use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::exchange::{exchange, Exchange, Peer, Request};
use crate::mfa::{Factor, FactorKind};
use log::info;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use totp_rs::{Algorithm, Secret, TOTP};

/// Current 6-digit code for a base32 `secret` at `unix_time`, 30-second step.
pub fn totp_code(provider: &str, secret: &str, unix_time: u64) -> Result<String> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect::<String>()
        .to_ascii_uppercase();

    let bytes = Secret::Encoded(normalized)
        .to_bytes()
        .map_err(|e| Error::TotpSecret {
            provider: String::from(provider),
            reason: format!("{:?}", e),
        })?;

    let totp = TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, bytes);
    Ok(totp.generate(unix_time))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Runs the verifier for `factor`. `Ok(None)` means the factor was skipped
/// and the next one should be tried; otherwise the IdP's next transaction
/// is returned.
pub fn verify_factor<E: Exchange + ?Sized>(
    conf: &RunConfig,
    http: &mut E,
    prompt_func: &dyn Fn(&str, bool) -> Option<String>,
    factor: &Factor,
    state_token: &str,
) -> Result<Option<Value>> {
    match factor.kind {
        FactorKind::Totp => verify_totp(conf, http, prompt_func, factor, state_token),
        FactorKind::Sms => verify_sms(conf, http, prompt_func, factor, state_token),
        FactorKind::Other(_) => Ok(None),
    }
}

fn verify_totp<E: Exchange + ?Sized>(
    conf: &RunConfig,
    http: &mut E,
    prompt_func: &dyn Fn(&str, bool) -> Option<String>,
    factor: &Factor,
    state_token: &str,
) -> Result<Option<Value>> {
    let code = match conf.mfa.totp_secret(&factor.provider) {
        Some(secret) => totp_code(&factor.provider, secret, unix_now())?,
        None => prompt_func(&format!("{} TOTP", factor.provider), false).unwrap_or_default(),
    };

    let code = code.trim();
    if code.is_empty() {
        return Ok(None);
    }

    info!("mfa {} totp request: {} [okta_url]", factor.provider, code);

    let body = json!({
        "factorId": factor.id,
        "stateToken": state_token,
        "passCode": code,
    });
    let request = Request::json("totp mfa", &factor.verify_url, body, Peer::IdentityProvider)
        .expecting(&conf.okta_url);

    let reply = exchange(http, &request)?;
    Ok(Some(reply.json()?))
}

fn verify_sms<E: Exchange + ?Sized>(
    conf: &RunConfig,
    http: &mut E,
    prompt_func: &dyn Fn(&str, bool) -> Option<String>,
    factor: &Factor,
    state_token: &str,
) -> Result<Option<Value>> {
    let mut body = json!({
        "factorId": factor.id,
        "stateToken": state_token,
    });

    info!("mfa {} sms request [okta_url]", factor.provider);
    let request = Request::json("sms mfa (1)", &factor.verify_url, body.clone(), Peer::IdentityProvider)
        .expecting(&conf.okta_url);
    // only sends the text message
    exchange(http, &request)?;

    let code = prompt_func(&format!("{} SMS verification code", factor.provider), false)
        .unwrap_or_default();
    let code = code.trim();
    if code.is_empty() {
        return Ok(None);
    }

    body["passCode"] = Value::from(code);

    info!("mfa {} sms request [okta_url]", factor.provider);
    let request = Request::json("sms mfa (2)", &factor.verify_url, body, Peer::IdentityProvider)
        .expecting(&conf.okta_url);

    let reply = exchange(http, &request)?;
    Ok(Some(reply.json()?))
}
