//! `c8ylp server` — persistent local proxy.

use std::sync::Arc;

use c8ylp_core::{AcceptorMode, ExitStatus};
use c8ylp_proxy::Supervisor;

use crate::options::{CommonArgs, TunnelArgs};

pub async fn run(common: CommonArgs, tunnel: TunnelArgs) -> i32 {
    let descriptor = match super::resolve_with_prompts(&common, &tunnel.device).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            eprintln!("c8ylp: {e}");
            return ExitStatus::from(&e).code();
        }
    };

    let supervisor = Supervisor::new();
    supervisor.install_signal_handlers();

    let device = tunnel.device.clone();
    let host = descriptor.base_url.to_string();
    let ssh_user_hint = std::env::var("C8YLP_SSH_USER").unwrap_or_else(|_| "<device_username>".into());

    let status = supervisor
        .serve(
            Arc::new(descriptor),
            tunnel.endpoint(),
            AcceptorMode::Persistent,
            tunnel.bridge_config(),
            move |port| {
                println!("c8ylp is listening for device {device} ({host}) on localhost:{port}");
                println!(
                    "\nConnect to {device} by executing the following in a new tab/console:\n\n\tssh -p {port} {ssh_user_hint}@localhost"
                );
            },
        )
        .await;

    status.code()
}
