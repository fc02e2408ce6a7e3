//! The contract with the external VPN client: which cookie to present, the
//! command line, and what goes on its standard input.

use crate::config::{BugCompat, RunConfig};
use crate::error::{Error, Result};
use crate::portal::PortalGrant;
use crate::redirect::SessionArtifacts;
use log::{info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieKind {
    GatewayPrelogin,
    PortalUserAuth,
}

impl CookieKind {
    pub fn tag(&self) -> &'static str {
        match self {
            CookieKind::GatewayPrelogin => "gateway:prelogin-cookie",
            CookieKind::PortalUserAuth => "portal:portal-userauthcookie",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnHandoff {
    pub kind: CookieKind,
    pub cookie: String,
    pub username: String,
    pub gateway: Option<String>,
}

impl VpnHandoff {
    /// Portals that hand out the literal `empty` user-auth cookie expect the
    /// prelogin cookie to be presented to the gateway instead.
    ///
    /// A configured gateway, even a blank one, replaces the portal's choice.
    pub fn new(grant: &PortalGrant, artifacts: &SessionArtifacts, gateway_override: Option<&str>) -> VpnHandoff {
        let (kind, cookie) = if grant.auth_cookie == "empty" && artifacts.prelogin_cookie != "empty" {
            (CookieKind::GatewayPrelogin, &artifacts.prelogin_cookie)
        } else {
            (CookieKind::PortalUserAuth, &grant.auth_cookie)
        };

        let gateway = match gateway_override {
            Some(gateway) => Some(String::from(gateway.trim())),
            None => grant.gateway.clone(),
        }
        .filter(|gateway| !gateway.is_empty());

        VpnHandoff {
            kind,
            cookie: cookie.clone(),
            username: artifacts.username.clone(),
            gateway,
        }
    }

    pub fn stdin_payload(&self, bugs: BugCompat) -> String {
        let mut payload = String::new();
        if bugs.newline {
            payload.push('\n');
        }
        if bugs.username {
            payload.push_str(&self.username);
            payload.push('\n');
        }
        payload.push_str(&self.cookie);
        if let Some(gateway) = &self.gateway {
            payload.push('\n');
            payload.push_str(gateway);
        }
        payload
    }

    /// The client's argv. `cafile` is only passed along when it holds
    /// anything. `openconnect_cmd` and `openconnect_args` use shell quoting.
    pub fn command(&self, conf: &RunConfig, cafile: Option<&Path>) -> Result<Vec<String>> {
        let mut argv = shell_split("openconnect_cmd", &conf.openconnect_cmd)?;
        argv.extend([
            String::from("--protocol=gp"),
            String::from("-u"),
            self.username.clone(),
            String::from("--usergroup"),
            String::from(self.kind.tag()),
        ]);
        if let Some(cert) = &conf.client_cert {
            argv.push(format!("--certificate={}", cert.display()));
        }
        if let Some(cafile) = cafile {
            argv.push(format!("--cafile={}", cafile.display()));
        }
        argv.push(String::from("--passwd-on-stdin"));
        argv.extend(shell_split("openconnect_args", &conf.openconnect_args)?);
        argv.push(conf.vpn_url.clone());
        Ok(argv)
    }
}

fn shell_split(key: &str, value: &str) -> Result<Vec<String>> {
    shell_words::split(value).map_err(|e| Error::Config(format!("cannot parse {}: {}", key, e)))
}

/// Expands `~` and `$VAR` in every word, like a shell would before running it.
pub fn expand(argv: &[String]) -> Result<Vec<String>> {
    argv.iter()
        .map(|word| {
            shellexpand::full(word)
                .map(|expanded| expanded.into_owned())
                .map_err(|e| Error::Config(format!("cannot expand {}: {}", word, e)))
        })
        .collect()
}

/// The equivalent `printf ... | client ...` pipeline, for running by hand.
pub fn render(argv: &[String], payload: &str) -> String {
    let escaped = payload
        .replace('\\', r"\\")
        .replace('%', "%%")
        .replace('\n', r"\n")
        .replace('\'', r"'\''");
    format!("printf '{}' | {}", escaped, shell_words::join(argv))
}

/// An existing path as given, then `PATH`, then the usual sbin directories.
fn locate(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }

    if let Ok(found) = which::which(program) {
        return Some(found);
    }

    ["/sbin", "/usr/sbin", "/usr/local/sbin"]
        .iter()
        .map(|dir| Path::new(dir).join(program))
        .find(|path| path.is_file())
}

/// Starts the client with `payload` on its stdin and waits for it. SIGINT is
/// left to the client so it can tear the tunnel down itself.
pub fn launch(argv: &[String], payload: &str) -> Result<ExitStatus> {
    let (program, args) = match argv.split_first() {
        Some(split) => split,
        None => {
            return Err(Error::Launch {
                command: String::new(),
                reason: String::from("empty command"),
            })
        }
    };

    let launch_error = |reason: String| Error::Launch {
        command: program.clone(),
        reason,
    };

    let path = locate(program).ok_or_else(|| launch_error(String::from("not found")))?;
    info!("starting {}", path.display());

    let mut child = Command::new(&path)
        .args(args)
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| launch_error(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload.as_bytes())?;
    }

    if let Err(e) = ctrlc::set_handler(|| {}) {
        warn!("cannot ignore ctrl-c: {}", e);
    }

    Ok(child.wait()?)
}
