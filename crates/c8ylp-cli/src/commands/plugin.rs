//! `c8ylp plugin command` — run an external command against a one-shot
//! proxy.
//!
//! The command inherits `C8Y_HOST`, `PORT` and `DEVICE` in its
//! environment, mirroring what scripts built on the proxy expect.

use std::sync::Arc;

use clap::Args;
use tokio::sync::oneshot;
use tracing::info;

use c8ylp_core::{AcceptorMode, ExitStatus};
use c8ylp_proxy::Supervisor;

use crate::options::{CommonArgs, TunnelArgs};

#[derive(Args, Debug, Clone)]
pub struct PluginArgs {
    #[command(flatten)]
    pub tunnel: TunnelArgs,

    /// Shell command to execute while the proxy is up
    #[arg(long)]
    pub command: String,
}

pub async fn run(common: CommonArgs, args: PluginArgs) -> i32 {
    let descriptor = match super::resolve_with_prompts(&common, &args.tunnel.device).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            eprintln!("c8ylp: {e}");
            return ExitStatus::from(&e).code();
        }
    };
    let host = descriptor.base_url.to_string();

    let supervisor = Arc::new(Supervisor::new());
    supervisor.install_signal_handlers();

    let (port_tx, port_rx) = oneshot::channel();
    let serve = {
        let supervisor = supervisor.clone();
        let descriptor = Arc::new(descriptor);
        let endpoint = args.tunnel.endpoint();
        let config = args.tunnel.bridge_config();
        tokio::spawn(async move {
            supervisor
                .serve(descriptor, endpoint, AcceptorMode::OneShot, config, |port| {
                    let _ = port_tx.send(port);
                })
                .await
        })
    };

    let port = match port_rx.await {
        Ok(port) => port,
        Err(_) => {
            let status = serve.await.unwrap_or(ExitStatus::GenericError);
            return status.code();
        }
    };

    info!(command = %args.command, port, "running plugin command");
    let exit = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&args.command)
        .env("C8Y_HOST", &host)
        .env("PORT", port.to_string())
        .env("DEVICE", &args.tunnel.device)
        .status()
        .await
    {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            eprintln!("c8ylp: failed to run command: {e}");
            ExitStatus::GenericError.code()
        }
    };

    supervisor.cancel();
    let _ = serve.await;
    exit
}
