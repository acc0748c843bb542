use anyhow::Result;
use clap::Parser;
use manual_webrtc::{Coordinator, SignalError};
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
                log::error!("answer terminated: {:#}", e);
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
    log::debug!("running answer");
    let mut reader = cli.blob_reader();
    loop {
        prompt("offer");
        let pasted = reader.next_blob().await?;
        match coordinator.answer(&pasted).await {
            Ok(()) => break,
            Err(e) => match e.downcast_ref::<SignalError>() {
                Some(signal) if signal.is_input_error() && reader.can_retry() => {
                    println!("{}", signal)
                }
                _ => return Err(e),
            },
        }
    }

    let blob = coordinator.wait_for_local_blob().await?;
    print_blob("answer", &blob);

    // media flows until interrupted
    std::future::pending::<()>().await;
    Ok(())
}
