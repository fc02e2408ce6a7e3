use crate::config::{truthy, Setting, Settings};
use std::collections::HashMap;

/// Factor types as far as automatic selection is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactorKind {
    Totp,
    Sms,
    Other(String),
}

impl FactorKind {
    pub fn parse(factor_type: &str) -> FactorKind {
        match factor_type.trim().to_ascii_lowercase().as_str() {
            "token:software:totp" => FactorKind::Totp,
            "sms" => FactorKind::Sms,
            other => FactorKind::Other(String::from(other)),
        }
    }

    /// The name used in `mfa_order` and in `<category>.<provider>` keys.
    pub fn category(&self) -> Option<&'static str> {
        match self {
            FactorKind::Totp => Some("totp"),
            FactorKind::Sms => Some("sms"),
            FactorKind::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Factor {
    pub id: String,
    pub kind: FactorKind,
    pub provider: String,
    pub verify_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedFactor {
    pub factor: Factor,
    pub priority: i64,
}

/// The user's MFA ordering and the per-provider `totp.*` / `sms.*` entries.
#[derive(Debug, Clone, Default)]
pub struct MfaPreferences {
    pub order: Vec<String>,
    pub providers: HashMap<String, Setting>,
}

impl MfaPreferences {
    pub fn from_settings(settings: &Settings) -> MfaPreferences {
        let order = settings
            .value("mfa_order")
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|m| !m.is_empty())
            .map(|m| m.to_ascii_lowercase())
            .collect();

        let providers = settings
            .iter()
            .filter(|(key, _)| key.starts_with("totp.") || key.starts_with("sms."))
            .map(|(key, setting)| (key.clone(), setting.clone()))
            .collect();

        MfaPreferences { order, providers }
    }

    fn setting(&self, category: &str, provider: &str) -> Option<&Setting> {
        self.providers.get(&format!("{}.{}", category, provider))
    }

    /// Shared secret configured for a TOTP provider, if any.
    pub fn totp_secret(&self, provider: &str) -> Option<&str> {
        self.setting("totp", provider)
            .map(|s| s.value.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn sms_enabled(&self, provider: &str) -> bool {
        self.setting("sms", provider)
            .map(|s| truthy(&s.value))
            .unwrap_or(false)
    }
}

/// Scores one factor, or `None` when it must not be tried at all (an SMS
/// provider that was not enabled).
///
/// Position in `mfa_order` is worth `(10 - index) * 100`. A matching
/// provider line adds `128 - line` when its value is empty and
/// `512 - line` when it has one, so earlier declarations win ties.
pub fn priority(prefs: &MfaPreferences, factor: &Factor) -> Option<i64> {
    let category = match factor.kind.category() {
        Some(category) => category,
        None => return Some(0),
    };

    let mut priority = match prefs.order.iter().position(|m| m == category) {
        Some(index) => (10 - index as i64) * 100,
        None => 0,
    };

    let setting = prefs.setting(category, &factor.provider);

    if factor.kind == FactorKind::Sms && !prefs.sms_enabled(&factor.provider) {
        return None;
    }

    priority += match setting {
        None => 0,
        Some(s) if s.value.trim().is_empty() => 128 - s.line as i64,
        Some(s) => 512 - s.line as i64,
    };

    Some(priority)
}

/// Orders the offered factors, highest priority first. Equal priorities keep
/// the order the IdP listed them in.
pub fn rank(prefs: &MfaPreferences, factors: Vec<Factor>) -> Vec<RankedFactor> {
    let mut ranked: Vec<RankedFactor> = factors
        .into_iter()
        .filter_map(|factor| {
            priority(prefs, &factor).map(|priority| RankedFactor { factor, priority })
        })
        .collect();

    ranked.sort_by(|a, b| b.priority.cmp(&a.priority));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs(text: &str) -> MfaPreferences {
        MfaPreferences::from_settings(&Settings::parse(text).unwrap())
    }

    fn factor(id: &str, factor_type: &str, provider: &str) -> Factor {
        Factor {
            id: String::from(id),
            kind: FactorKind::parse(factor_type),
            provider: String::from(provider),
            verify_url: format!("https://example.okta.com/api/v1/authn/factors/{}/verify", id),
        }
    }

    fn ids(ranked: &[RankedFactor]) -> Vec<&str> {
        ranked.iter().map(|r| r.factor.id.as_str()).collect()
    }

    #[test]
    fn folds_totp_subtype() {
        assert_eq!(FactorKind::parse("token:software:totp"), FactorKind::Totp);
        assert_eq!(FactorKind::parse("SMS"), FactorKind::Sms);
        assert_eq!(FactorKind::parse("push").category(), None);
    }

    #[test]
    fn earlier_preference_wins() {
        let p = prefs("mfa_order = sms, totp\nsms.okta = 1\n");
        let totp = factor("t", "token:software:totp", "google");
        let sms = factor("s", "sms", "okta");

        assert_eq!(priority(&p, &totp), Some(900));
        assert_eq!(priority(&p, &sms), Some(1000 + 512 - 2));
        assert_eq!(ids(&rank(&p, vec![totp, sms])), vec!["s", "t"]);
    }

    #[test]
    fn provider_line_bonus_bands() {
        let p = prefs("totp.google =\ntotp.okta = JBSWY3DPEHPK3PXP\n");

        assert_eq!(priority(&p, &factor("g", "token:software:totp", "google")), Some(128 - 1));
        assert_eq!(priority(&p, &factor("o", "token:software:totp", "okta")), Some(512 - 2));
        assert_eq!(priority(&p, &factor("x", "token:software:totp", "duo")), Some(0));
    }

    #[test]
    fn secret_declared_later_still_outranks_empty_entry() {
        let mut text = String::from("totp.google =\n");
        for i in 0..300 {
            text.push_str(&format!("filler{} = x\n", i));
        }
        text.push_str("totp.okta = JBSWY3DPEHPK3PXP\n");
        let p = prefs(&text);

        let ranked = rank(
            &p,
            vec![
                factor("g", "token:software:totp", "google"),
                factor("o", "token:software:totp", "okta"),
            ],
        );
        assert_eq!(ids(&ranked), vec!["o", "g"]);
    }

    #[test]
    fn secret_on_line_383_still_outranks_empty_entry_on_line_1() {
        let mut text = String::from("totp.google =\n");
        for i in 2..383 {
            text.push_str(&format!("filler{} = x\n", i));
        }
        text.push_str("totp.okta = JBSWY3DPEHPK3PXP\n");
        let p = prefs(&text);
        assert_eq!(p.providers["totp.okta"].line, 383);

        let empty = priority(&p, &factor("g", "token:software:totp", "google")).unwrap();
        let with_secret = priority(&p, &factor("o", "token:software:totp", "okta")).unwrap();

        assert_eq!(empty, 128 - 1);
        assert_eq!(with_secret, 512 - 383);
        assert!(with_secret > empty);
    }

    #[test]
    fn disabled_sms_is_excluded() {
        let p = prefs("mfa_order = sms\nsms.okta = false\n");
        assert_eq!(priority(&p, &factor("s", "sms", "okta")), None);
        assert!(rank(&p, vec![factor("s", "sms", "okta")]).is_empty());

        let p = prefs("mfa_order = sms\n");
        assert_eq!(priority(&p, &factor("s", "sms", "okta")), None);
    }

    #[test]
    fn enabled_sms_beats_unsupported_factor() {
        let p = prefs("sms.okta = true\n");
        let ranked = rank(
            &p,
            vec![factor("p", "push", "okta"), factor("s", "sms", "okta")],
        );

        assert_eq!(ids(&ranked), vec!["s", "p"]);
        assert!(ranked[0].priority > 0);
        assert_eq!(ranked[1].priority, 0);
    }

    #[test]
    fn ties_keep_offered_order() {
        let p = prefs("");
        let ranked = rank(
            &p,
            vec![
                factor("a", "push", "okta"),
                factor("b", "token:software:totp", "okta"),
                factor("c", "call", "okta"),
            ],
        );
        assert_eq!(ids(&ranked), vec!["a", "b", "c"]);
    }

    #[test]
    fn moving_unrelated_lines_keeps_relative_order() {
        let offered = || {
            vec![
                factor("g", "token:software:totp", "google"),
                factor("o", "token:software:totp", "okta"),
            ]
        };

        let before = prefs("totp.okta =\nsms.duo = 1\ndebug = 1\ntotp.google =\n");
        let after = prefs("totp.okta =\ndebug = 1\nsms.duo = 1\ntotp.google =\n");

        assert_eq!(ids(&rank(&before, offered())), ids(&rank(&after, offered())));
        assert_eq!(ids(&rank(&before, offered())), vec!["o", "g"]);
    }
}
