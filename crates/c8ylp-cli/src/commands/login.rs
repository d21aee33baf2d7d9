//! `c8ylp login` — validate credentials, obtain a token, optionally
//! persist it to the env file.

use tracing::info;

use c8ylp_core::{ExitStatus, ProxyError};
use c8ylp_proxy::CumulocityResolver;

use crate::env;
use crate::options::CommonArgs;

pub async fn run(common: CommonArgs) -> i32 {
    match login(&common).await {
        Ok(()) => {
            println!("Login successful");
            ExitStatus::Ok.code()
        }
        Err(e) => {
            eprintln!("c8ylp: {e}");
            ExitStatus::from(&e).code()
        }
    }
}

async fn login(common: &CommonArgs) -> Result<(), ProxyError> {
    let mut request = super::login_request(common);
    let resolver = CumulocityResolver::new(&request.host, request.verify_tls)?;

    let tenant = match &request.tenant {
        Some(tenant) => tenant.clone(),
        None => resolver.resolve_tenant().await?,
    };
    info!(tenant = %tenant, "tenant resolved");

    if request.credentials.token.is_none() && !common.disable_prompts {
        super::prompt_missing(&mut request.credentials, false)?;
    }

    let token = match &request.credentials.token {
        Some(token) => {
            resolver.validate_token(token).await?;
            token.clone()
        }
        None => {
            let user = request
                .credentials
                .user
                .as_deref()
                .ok_or_else(|| ProxyError::Auth("username required".into()))?;
            let password = request
                .credentials
                .password
                .as_deref()
                .ok_or_else(|| ProxyError::Auth("password required".into()))?;
            resolver
                .login_oauth(&tenant, user, password, request.credentials.tfa_code.as_deref())
                .await?
        }
    };

    if let Some(path) = &common.env_file {
        let pairs = [
            ("C8Y_HOST", resolver.base_url().as_str()),
            ("C8Y_TENANT", tenant.as_str()),
            ("C8Y_TOKEN", token.as_str()),
        ];
        match env::save(path, &pairs) {
            Ok(true) => println!("Env file {} was updated", path.display()),
            Ok(false) => info!(path = %path.display(), "env file already up to date"),
            Err(e) => return Err(ProxyError::Io(std::io::Error::other(e.to_string()))),
        }
    }

    Ok(())
}
