use anyhow::{bail, Result};
use clap::Parser;
use manual_webrtc::config::{SessionConfig, SourcePolicy, DEFAULT_STUN_SERVER};
use manual_webrtc::media::MediaDevices;
use manual_webrtc::{EmittedEvents, RemoteStream, SessionPhase};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

// log a summary every this many packets
const PACKETS_PER_REPORT: u64 = 250;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// STUN server url. may be repeated
    #[arg(long = "stun", default_value = DEFAULT_STUN_SERVER)]
    pub stun: Vec<String>,
    /// only gather host candidates
    #[arg(long, conflicts_with = "stun")]
    pub no_stun: bool,
    /// random, display or camera
    #[arg(long, default_value = "random")]
    pub source: SourcePolicy,
    /// read the remote description from this file instead of stdin
    #[arg(long)]
    pub remote_file: Option<PathBuf>,
    /// debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ice_servers: if self.no_stun {
                vec![]
            } else {
                self.stun.clone()
            },
            source: self.source,
        }
    }

    #[cfg(feature = "host-audio")]
    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        Arc::new(manual_webrtc::media::MicrophoneDevices::new())
    }

    #[cfg(not(feature = "host-audio"))]
    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        Arc::new(manual_webrtc::media::SyntheticDevices::new())
    }

    pub fn blob_reader(&self) -> BlobReader<BufReader<Stdin>> {
        match &self.remote_file {
            Some(path) => BlobReader::File(path.clone()),
            None => BlobReader::Pasted(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    pub fn init_logger(&self) {
        let level = if self.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%3f"),
                    record.args()
                )
            })
            .filter(None, level)
            .filter(Some("webrtc"), log::LevelFilter::Warn)
            .init();
    }
}

/// where the operator's blob comes from
pub enum BlobReader<R> {
    File(PathBuf),
    /// lines typed or pasted into a terminal. a blank line ends the blob
    Pasted(Lines<R>),
}

impl<R: AsyncBufRead + Unpin> BlobReader<R> {
    /// a bad blob can be pasted again, a bad file can't
    pub fn can_retry(&self) -> bool {
        matches!(self, BlobReader::Pasted(_))
    }

    pub async fn next_blob(&mut self) -> Result<String> {
        match self {
            BlobReader::File(path) => Ok(tokio::fs::read_to_string(path).await?),
            BlobReader::Pasted(lines) => {
                let mut blob = String::new();
                while let Some(line) = lines.next_line().await? {
                    let line = line.trim();
                    if line.is_empty() {
                        if blob.is_empty() {
                            continue;
                        }
                        break;
                    }
                    blob.push_str(line);
                }
                if blob.is_empty() {
                    bail!("input closed before a description was pasted");
                }
                Ok(blob)
            }
        }
    }
}

/// prints the blob the operator has to carry to the other side
pub fn print_blob(what: &str, blob: &str) {
    println!();
    println!("---- copy this {} to the remote peer ----", what);
    println!("{}", blob);
    println!("-----------------------------------------");
    println!();
}

pub fn prompt(what: &str) {
    println!("paste the remote {} and press enter twice:", what);
}

pub async fn handle_events(mut client_event_rx: mpsc::UnboundedReceiver<EmittedEvents>) {
    while let Some(evt) = client_event_rx.recv().await {
        match evt {
            EmittedEvents::PhaseChanged(phase) => {
                log::debug!("event: PhaseChanged({})", phase);
                if phase == SessionPhase::Connected {
                    println!("connected, media is flowing. ctrl+c to quit");
                }
            }
            EmittedEvents::LocalDescription { blob } => {
                log::debug!("event: LocalDescription ({} bytes)", blob.len());
            }
            EmittedEvents::IceStateChanged(state) => {
                log::debug!("event: IceStateChanged({})", state);
            }
            EmittedEvents::RemoteTrack(stream) => {
                log::debug!("event: RemoteTrack");
                drain_remote_track(stream);
            }
            EmittedEvents::Failed { reason } => {
                log::error!("event: Failed: {}", reason);
            }
        }
    }
}

/// reads the remote track so its packets are consumed and reports how much arrived
pub fn drain_remote_track(stream: RemoteStream) {
    let Some(track) = stream.track else {
        return;
    };
    tokio::spawn(async move {
        let mime_type = track.codec().capability.mime_type;
        log::info!(
            "playing remote {} track {} of stream {}",
            mime_type,
            stream.track_id,
            stream.stream_id
        );

        let mut packets: u64 = 0;
        let mut bytes: usize = 0;
        loop {
            match track.read_rtp().await {
                Ok((packet, _attributes)) => {
                    packets += 1;
                    bytes += packet.payload.len();
                    if packets % PACKETS_PER_REPORT == 0 {
                        log::info!("{}: {} packets, {} bytes", mime_type, packets, bytes);
                    }
                }
                Err(e) => {
                    log::info!("remote {} track ended after {} packets: {}", mime_type, packets, e);
                    break;
                }
            }
        }
    });
}
