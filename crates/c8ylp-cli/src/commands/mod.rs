//! Subcommand implementations.

pub mod connect_ssh;
pub mod login;
pub mod plugin;
pub mod server;

use dialoguer::{Input, Password};
use tracing::{info, warn};

use c8ylp_core::{ProxyError, ProxyResult, TunnelDescriptor};
use c8ylp_proxy::{Credentials, CumulocityResolver, ResolveRequest};

use crate::env;
use crate::options::CommonArgs;

/// Further attempts after a rejected login.
const LOGIN_RETRIES: usize = 2;

/// Resolve the device tunnel, prompting for missing credentials when the
/// terminal is allowed to ask.
pub(crate) async fn resolve_with_prompts(
    common: &CommonArgs,
    device: &str,
) -> ProxyResult<TunnelDescriptor> {
    let mut request = common.resolve_request(device);
    let resolver = CumulocityResolver::new(&request.host, request.verify_tls)?;

    if request.credentials.token.is_none() && !common.disable_prompts {
        prompt_missing(&mut request.credentials, false)?;
    }

    let mut attempts = 0;
    loop {
        match resolver.resolve(&request).await {
            Ok(descriptor) => {
                store_token(common, &descriptor);
                return Ok(descriptor);
            }
            Err(ProxyError::Auth(message)) if attempts < LOGIN_RETRIES && !common.disable_prompts => {
                attempts += 1;
                eprintln!("Authentication failed: {message}");
                // Whatever was supplied did not work; ask again.
                request.credentials.token = None;
                request.credentials.password = None;
                prompt_missing(&mut request.credentials, message.contains("TFA"))?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Ask for username, password and (when requested) a TFA code.
fn prompt_missing(credentials: &mut Credentials, want_tfa: bool) -> ProxyResult<()> {
    if credentials.user.is_none() {
        let user: String = Input::new()
            .with_prompt("Enter your Cumulocity username")
            .interact_text()
            .map_err(prompt_failed)?;
        credentials.user = Some(user);
    }
    if credentials.password.is_none() {
        let password = Password::new()
            .with_prompt("Enter your Cumulocity password")
            .interact()
            .map_err(prompt_failed)?;
        credentials.password = Some(password);
    }
    if want_tfa && credentials.tfa_code.is_none() {
        let code: String = Input::new()
            .with_prompt("Enter your Cumulocity TFA code")
            .interact_text()
            .map_err(prompt_failed)?;
        credentials.tfa_code = Some(code);
    }
    Ok(())
}

fn prompt_failed(err: dialoguer::Error) -> ProxyError {
    ProxyError::Auth(format!("credential prompt failed: {err}"))
}

/// Persist the session token to the env file when asked to.
fn store_token(common: &CommonArgs, descriptor: &TunnelDescriptor) {
    let Some(path) = &common.env_file else { return };
    if !common.store_token {
        return;
    }
    let pairs = [
        ("C8Y_HOST", descriptor.base_url.as_str()),
        ("C8Y_TENANT", descriptor.tenant.as_str()),
        ("C8Y_TOKEN", descriptor.token.expose()),
    ];
    match env::save(path, &pairs) {
        Ok(true) => info!(path = %path.display(), "env file updated"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "could not update env file"),
    }
}

/// Resolver input reduced to what the login command needs.
pub(crate) fn login_request(common: &CommonArgs) -> ResolveRequest {
    common.resolve_request("")
}
