use anyhow::Result;
use clap::Parser;
use manual_webrtc::Coordinator;
use std::sync::Arc;
use tokio::sync::mpsc;

use example::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logger();

    // used to receive events from the Coordinator
    let (client_event_tx, client_event_rx) = mpsc::unbounded_channel();
    let coordinator =
        Coordinator::connect(&cli.session_config(), cli.devices(), client_event_tx).await?;

    tokio::select! {
        r = run(coordinator.clone(), &cli) => {
            if let Err(e) = r {
                log::error!("offer terminated: {:#}", e);
            }
        }
        _ = handle_events(client_event_rx) => {
            log::debug!("event channel closed");
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
        }
    }

    coordinator.close().await?;
    Ok(())
}

async fn run(coordinator: Arc<Coordinator>, cli: &Cli) -> Result<()> {
    log::debug!("running offer");
    coordinator.initialize().await?;
    let blob = coordinator.wait_for_local_blob().await?;
    print_blob("offer", &blob);

    let mut reader = cli.blob_reader();
    loop {
        prompt("answer");
        let pasted = reader.next_blob().await?;
        match coordinator.accept_remote_description(&pasted).await {
            Ok(()) => break,
            Err(e) if e.is_input_error() && reader.can_retry() => println!("{}", e),
            Err(e) => return Err(e.into()),
        }
    }

    // media flows until interrupted
    std::future::pending::<()>().await;
    Ok(())
}
