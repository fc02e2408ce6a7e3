use crate::error::{Error, Result};
use crate::exchange::TlsSettings;
use crate::mfa::MfaPreferences;
use log::info;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const REQUIRED_KEYS: [&str; 4] = ["vpn_url", "username", "password", "okta_url"];

/// A configuration value and the line it was declared on. Values that only
/// come from the environment carry line 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub value: String,
    pub line: usize,
}

pub fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true")
}

/// Raw `key = value` entries with their provenance.
#[derive(Debug, Clone, Default)]
pub struct Settings(HashMap<String, Setting>);

impl Settings {
    pub fn parse(text: &str) -> Result<Settings> {
        let pattern = Regex::new(r"^\s*([^=\s]+)\s*=\s*(.*?)\s*(?:#\s+.*)?\s*$")?;
        let mut settings = Settings::default();

        for (index, raw) in text.lines().enumerate() {
            let caps = match pattern.captures(raw.trim()) {
                Some(caps) => caps,
                None => continue,
            };

            let key = caps[1].to_ascii_lowercase();
            if key.starts_with('#') {
                continue;
            }

            let mut value = &caps[2];
            for quote in ['"', '\''] {
                if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
                    value = &value[1..value.len() - 1];
                }
            }

            settings.0.insert(
                key,
                Setting {
                    value: String::from(value),
                    line: index + 1,
                },
            );
        }

        Ok(settings)
    }

    /// Applies `GP_<KEY>` overrides. An override keeps the line of the
    /// declaration it replaces.
    pub fn apply_env<I: IntoIterator<Item = (String, String)>>(&mut self, vars: I) {
        for (name, value) in vars {
            let name = name.to_ascii_lowercase();
            let key = match name.strip_prefix("gp_") {
                Some(key) if !key.is_empty() => key,
                _ => continue,
            };
            self.set(key, value.trim());
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let line = self.0.get(key).map(|s| s.line).unwrap_or(0);
        self.0.insert(
            String::from(key),
            Setting {
                value: String::from(value),
                line,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&Setting> {
        self.0.get(key)
    }

    /// Trimmed value, empty when unset.
    pub fn value(&self, key: &str) -> &str {
        self.0.get(key).map(|s| s.value.trim()).unwrap_or("")
    }

    pub fn flag(&self, key: &str) -> bool {
        truthy(self.value(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Setting)> {
        self.0.iter()
    }

    fn existing_path(&self, key: &str) -> Result<Option<PathBuf>> {
        let value = self.value(key);
        if value.is_empty() {
            return Ok(None);
        }

        let path = PathBuf::from(value);
        if !path.exists() {
            return Err(Error::Config(format!("configured {} file does not exist", key)));
        }
        Ok(Some(path))
    }
}

/// Workarounds for portals that expect extra lines on the client's stdin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BugCompat {
    pub newline: bool,
    pub username: bool,
}

/// Everything a run needs, validated once and never changed afterwards.
pub struct RunConfig {
    pub vpn_url: String,
    pub okta_url: String,
    pub username: String,
    pub password: String,
    pub vpn_url_cert: Option<PathBuf>,
    pub okta_url_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub openconnect_certs: Option<PathBuf>,
    pub mfa: MfaPreferences,
    pub gateway: Option<String>,
    pub another_dance: bool,
    pub execute: bool,
    pub debug: bool,
    pub bugs: BugCompat,
    pub openconnect_cmd: String,
    pub openconnect_args: String,
}

impl RunConfig {
    /// Reads the file at `path`, applies the environment, and asks for
    /// whichever credentials are still blank.
    pub fn load<F: Fn(&str, bool) -> Option<String>>(path: &Path, prompt_func: F) -> Result<RunConfig> {
        info!("load conf");

        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut settings = Settings::parse(&text)?;
        settings.apply_env(std::env::vars());

        if settings.value("username").is_empty() {
            if let Some(username) = prompt_func("username", false) {
                settings.set("username", username.trim());
            }
        }
        if settings.value("password").is_empty() {
            if let Some(password) = prompt_func("password", true) {
                settings.set("password", password.trim());
            }
        }

        RunConfig::from_settings(&settings)
    }

    pub fn from_settings(settings: &Settings) -> Result<RunConfig> {
        for key in REQUIRED_KEYS {
            match settings.get(key) {
                None => return Err(Error::Config(format!("missing configuration key: {}", key))),
                Some(s) if s.value.trim().is_empty() => {
                    return Err(Error::Config(format!("empty configuration key: {}", key)))
                }
                Some(_) => {}
            }
        }

        let openconnect_cmd = match settings.value("openconnect_cmd") {
            "" => String::from("openconnect"),
            cmd => String::from(cmd),
        };
        let openconnect_certs = match settings.value("openconnect_certs") {
            "" => None,
            path => Some(PathBuf::from(path)),
        };

        Ok(RunConfig {
            vpn_url: String::from(settings.value("vpn_url").trim_end_matches('/')),
            okta_url: String::from(settings.value("okta_url").trim_end_matches('/')),
            username: String::from(settings.value("username")),
            password: String::from(settings.value("password")),
            vpn_url_cert: settings.existing_path("vpn_url_cert")?,
            okta_url_cert: settings.existing_path("okta_url_cert")?,
            client_cert: settings.existing_path("client_cert")?,
            openconnect_certs,
            mfa: MfaPreferences::from_settings(settings),
            gateway: settings.get("gateway").map(|s| String::from(s.value.trim())),
            another_dance: settings.flag("another_dance"),
            execute: settings.flag("execute"),
            debug: settings.flag("debug"),
            bugs: BugCompat {
                newline: settings.flag("bug.nl"),
                username: settings.flag("bug.username"),
            },
            openconnect_cmd,
            openconnect_args: String::from(settings.value("openconnect_args")),
        })
    }

    pub fn tls(&self) -> TlsSettings {
        TlsSettings {
            idp_anchors: self.okta_url_cert.clone(),
            portal_anchors: self.vpn_url_cert.clone(),
            client_cert: self.client_cert.clone(),
        }
    }

    pub fn authn_url(&self) -> String {
        format!("{}/api/v1/authn", self.okta_url)
    }
}

#[cfg(test)]
pub(crate) fn test_config(extra: &str) -> RunConfig {
    let text = format!(
        "vpn_url = https://vpn.example.com\n\
         okta_url = https://example.okta.com\n\
         username = alice\n\
         password = hunter2\n\
         {}",
        extra
    );
    RunConfig::from_settings(&Settings::parse(&text).unwrap()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_with_line_numbers() {
        let settings = Settings::parse(
            "# a comment\n\
             VPN_URL = https://vpn.example.com/\n\
             \n\
             password = \"p a s s\"\n\
             totp.okta = 'ABCDEF' # my okta secret\n\
             sms.okta =\n\
             not a setting\n",
        )
        .unwrap();

        assert_eq!(settings.get("vpn_url").unwrap().line, 2);
        assert_eq!(settings.value("password"), "p a s s");
        assert_eq!(
            settings.get("totp.okta"),
            Some(&Setting {
                value: String::from("ABCDEF"),
                line: 5
            })
        );
        assert_eq!(settings.get("sms.okta").unwrap().value, "");
        assert!(settings.get("not").is_none());
        assert!(settings.get("#").is_none());
    }

    #[test]
    fn commented_key_is_ignored() {
        let settings = Settings::parse("#debug = 1\n").unwrap();
        assert!(settings.get("#debug").is_none());
    }

    #[test]
    fn env_override_keeps_declaration_line() {
        let mut settings = Settings::parse("username = bob\n\ntotp.okta = x\n").unwrap();
        settings.apply_env(vec![
            (String::from("GP_TOTP.OKTA"), String::from(" SECRET ")),
            (String::from("GP_EXECUTE"), String::from("1")),
            (String::from("GP_"), String::from("ignored")),
            (String::from("HOME"), String::from("/root")),
        ]);

        assert_eq!(
            settings.get("totp.okta"),
            Some(&Setting {
                value: String::from("SECRET"),
                line: 3
            })
        );
        assert_eq!(settings.get("execute").unwrap().line, 0);
        assert!(settings.get("home").is_none());
        assert!(settings.get("").is_none());
    }

    #[test]
    fn truthy_values() {
        assert!(truthy("1"));
        assert!(truthy("TRUE"));
        assert!(!truthy("yes"));
        assert!(!truthy(""));
    }

    #[test]
    fn builds_run_config() {
        let conf = test_config(
            "another_dance = true\n\
             bug.nl = 1\n\
             gateway = \n\
             mfa_order = totp sms\n",
        );

        assert_eq!(conf.vpn_url, "https://vpn.example.com");
        assert_eq!(conf.authn_url(), "https://example.okta.com/api/v1/authn");
        assert!(conf.another_dance);
        assert!(!conf.execute);
        assert_eq!(conf.bugs, BugCompat { newline: true, username: false });
        assert_eq!(conf.gateway.as_deref(), Some(""));
        assert_eq!(conf.openconnect_cmd, "openconnect");
        assert_eq!(conf.mfa.order, vec!["totp", "sms"]);
    }

    #[test]
    fn missing_or_empty_required_key_is_rejected() {
        let settings = Settings::parse("vpn_url = https://vpn\nokta_url = https://okta\nusername = a\n").unwrap();
        match RunConfig::from_settings(&settings) {
            Err(Error::Config(msg)) => assert!(msg.contains("password")),
            _ => panic!("expected a config error"),
        }

        let settings = Settings::parse("vpn_url = https://vpn\nokta_url =\nusername = a\npassword = b\n").unwrap();
        match RunConfig::from_settings(&settings) {
            Err(Error::Config(msg)) => assert_eq!(msg, "empty configuration key: okta_url"),
            _ => panic!("expected a config error"),
        }
    }

    #[test]
    fn missing_certificate_file_is_rejected() {
        let settings = Settings::parse(
            "vpn_url = https://vpn\nokta_url = https://okta\nusername = a\npassword = b\n\
             client_cert = /nonexistent/client.pem\n",
        )
        .unwrap();
        assert!(RunConfig::from_settings(&settings).is_err());
    }
}
