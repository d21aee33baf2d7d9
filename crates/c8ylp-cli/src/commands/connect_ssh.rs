//! `c8ylp connect ssh` — one-shot proxy plus an ssh child process.
//!
//! The proxy binds an ephemeral port, ssh is pointed at it, and when ssh
//! exits the proxy is torn down. The process exits with ssh's own code.

use std::sync::Arc;

use clap::Args;
use tokio::sync::oneshot;
use tracing::info;

use c8ylp_core::{AcceptorMode, ExitStatus};
use c8ylp_proxy::Supervisor;

use crate::options::{CommonArgs, TunnelArgs};

#[derive(Args, Debug, Clone)]
pub struct SshArgs {
    #[command(flatten)]
    pub tunnel: TunnelArgs,

    /// Username on the device
    #[arg(long = "ssh-user", env = "C8YLP_SSH_USER")]
    pub ssh_user: String,

    /// Remote command to execute instead of an interactive session
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub async fn run(common: CommonArgs, args: SshArgs) -> i32 {
    let descriptor = match super::resolve_with_prompts(&common, &args.tunnel.device).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            eprintln!("c8ylp: {e}");
            return ExitStatus::from(&e).code();
        }
    };

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
            // The proxy died before binding; its status is the answer.
            let status = serve.await.unwrap_or(ExitStatus::GenericError);
            return status.code();
        }
    };

    let device = &args.tunnel.device;
    if args.command.is_empty() {
        eprintln!("Starting interactive ssh session with {device} ({})", common.host);
    } else {
        eprintln!("Executing command via ssh on {device} ({})", common.host);
    }

    let mut ssh = tokio::process::Command::new("ssh");
    ssh.arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-p")
        .arg(port.to_string())
        .arg(format!("{}@localhost", args.ssh_user));
    if !args.command.is_empty() {
        ssh.args(&args.command);
    }

    info!(port, user = %args.ssh_user, "starting ssh");
    let exit = match ssh.status().await {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!("c8ylp: ssh client not found. Make sure 'ssh' is on your PATH");
            supervisor.cancel();
            let _ = serve.await;
            return ExitStatus::GenericError.code();
        }
        Err(e) => {
            eprintln!("c8ylp: failed to run ssh: {e}");
            supervisor.cancel();
            let _ = serve.await;
            return ExitStatus::GenericError.code();
        }
    };

    if exit != 0 {
        eprintln!("SSH exited with a non-zero exit code. code={exit}");
    }

    supervisor.cancel();
    let _ = serve.await;
    exit
}
