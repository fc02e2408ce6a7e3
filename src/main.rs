mod args;

use anyhow::{bail, Context};
use args::Args;
use clap::Parser;
use dialoguer::{Input, Password};
use gp_okta::handoff::{expand, launch, render};
use gp_okta::{
    authenticate, chase, fetch_config, init_logger, prelogin, raise_to_debug, relaxed_handoff,
    saml_handoff, ExchangeSession, RunConfig, TrustBundle, VpnHandoff,
};
use log::{error, info};
use std::process::ExitCode;

fn ask(prompt: &str, secret: bool) -> Option<String> {
    if secret {
        return Password::new().with_prompt(prompt).interact().ok();
    }

    let mut input = Input::<String>::new();
    input.with_prompt(prompt).allow_empty(true);
    if prompt == "username" {
        input.default(whoami::username());
    }
    input.interact_text().ok()
}

fn run(args: &Args) -> anyhow::Result<()> {
    let conf = RunConfig::load(&args.config, ask).context("failed to load configuration")?;
    if conf.debug {
        raise_to_debug();
    }

    let mut bundle = TrustBundle::create(conf.openconnect_certs.as_deref())
        .context("failed to create openconnect_certs")?;
    for cert in [&conf.vpn_url_cert, &conf.okta_url_cert].into_iter().flatten() {
        bundle
            .copy_from(cert)
            .with_context(|| format!("failed to copy {}", cert.display()))?;
    }
    bundle.flush()?;

    let mut http = ExchangeSession::new(&conf.tls()).context("failed to set up https")?;

    let saml_page = prelogin(&conf, &mut http, false).context("prelogin failed")?;
    let redirect_url = saml_handoff(&conf, &mut http, &saml_page).context("okta saml failed")?;
    let session_token = authenticate(&conf, &mut http, &ask, None).context("okta auth failed")?;
    info!("sessionToken: {}", session_token);

    let mut artifacts = chase(&conf, &mut http, &ask, session_token, redirect_url)
        .context("okta redirect failed")?;
    let grant = fetch_config(&conf, &mut http, &artifacts, &mut bundle).context("getconfig failed")?;

    info!("portal-userauthcookie: {}", grant.auth_cookie);
    info!("gateway: {}", grant.gateway.as_deref().unwrap_or(""));

    if conf.another_dance {
        let saml_page = prelogin(&conf, &mut http, true).context("second prelogin failed")?;
        artifacts = relaxed_handoff(&mut http, &saml_page).context("second okta saml failed")?;
    }

    info!("saml-username: {}", artifacts.username);
    info!("prelogin-cookie: {}", artifacts.prelogin_cookie);

    let handoff = VpnHandoff::new(&grant, &artifacts, conf.gateway.as_deref());
    let payload = handoff.stdin_payload(conf.bugs);

    if conf.execute {
        let cafile = if bundle.is_empty()? { None } else { Some(bundle.path()) };
        let argv = expand(&handoff.command(&conf, cafile)?)?;
        let status = launch(&argv, &payload)?;
        if !status.success() {
            bail!("{} exited with {}", conf.openconnect_cmd, status);
        }
    } else {
        // the printed command outlives this process
        let cafile = if bundle.is_empty()? { None } else { Some(bundle.persist()?) };
        let argv = expand(&handoff.command(&conf, cafile.as_deref())?)?;
        println!();
        println!("{}", render(&argv, &payload));
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.level.into());

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
