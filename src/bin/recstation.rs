//! `recstation` binary entry point.
//!
//! Grounded on `examples/original_source/src/recstation/main.go`
//! (`RunMain`): reads the JSON config, stands up the UDP ingest source, the
//! periodic IGMP membership reporter, the heartbeat tracker, and the audio
//! source, wires them all into the coordinator, and serves the HTTP
//! control surface. Any failure here is fatal at startup (spec.md §7).

use log::{error, info};
use std::sync::Arc;

use recstation::config::{Cli, ConfigFile, Settings};
use recstation::{coordinator, heartbeat, http, igmp, source::audio, source::udp::UdpSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse_args();

    let config = ConfigFile::open(&cli.config)?;
    let settings = Arc::new(Settings::resolve(config, &cli.addr)?);

    info!(
        "recstation starting on {} ({} multicast groups)",
        settings.hostname,
        settings.groups.len()
    );

    let (udp, mut udp_fatal) = UdpSource::bind(&settings.iface_name, settings.source_listen)?;

    // Multicast join/leave and listen errors surface here after startup
    // (spec.md §7: they reflect misconfiguration, so they're fatal).
    tokio::spawn(async move {
        if let Some(e) = udp_fatal.recv().await {
            error!("fatal UDP source error: {}", e);
            std::process::exit(1);
        }
    });

    igmp::spawn_periodic_reports(settings.group_addrs())?;

    let heartbeat_events = heartbeat::spawn(
        &settings.iface_name,
        settings.heartbeat_listen,
        settings.heartbeat_timeout,
        &settings.group_addrs(),
    )?;

    let (audio_handle, audio_events) = audio::spawn(
        settings.alsa_device.clone(),
        settings.alsa_num_channels,
        settings.alsa_bitrate,
    );

    let coordinator = coordinator::spawn(
        settings.clone(),
        udp,
        audio_handle,
        audio_events,
        heartbeat_events,
    );

    let router = http::router(coordinator);
    let listener = tokio::net::TcpListener::bind(settings.http_listen).await?;
    info!("HTTP control surface listening on {}", settings.http_listen);

    axum::serve(listener, router).await?;

    Ok(())
}
