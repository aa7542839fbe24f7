//! # Configuration
//!
//! JSON configuration file parsing (spec.md §6) and the CLI surface used by
//! the `recstation` binary.
//!
//! The on-disk schema is intentionally flat and mirrors the original
//! `ConfigJson` field-for-field; duration strings are parsed with
//! [`humantime`], host:port strings are parsed into [`SocketAddr`] with a
//! leading-colon shorthand (`:8080` => `0.0.0.0:8080`) accepted for parity
//! with Go's `net.Listen` convention used by the original.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::{RecError, Result};

/// Raw JSON configuration file shape (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    /// Network interface name to join multicast groups on.
    pub iface: String,
    /// Output filename template, e.g. `"{{hostname}}/{{stream}}-{{timestamp}}.ts"`.
    pub output_filename: String,
    /// `chrono`-style strftime pattern used for the `{{timestamp}}` token.
    pub output_timestamp: String,
    /// Multicast group (dotted IPv4) to friendly stream name.
    pub multicasts: HashMap<String, String>,
    /// How often to rotate output files while recording, e.g. `"1m"`.
    pub new_output_every: String,
    /// `host:port` to bind the MPEG-TS UDP source on.
    pub source_listen: String,
    /// `host:port` to bind the heartbeat listener on.
    pub heartbeat_listen: String,
    /// How long without a heartbeat before a source is declared offline.
    pub heartbeat_timeout: String,
    /// Optional `host:port` for the HTTP control surface; overrides `-addr`.
    #[serde(default)]
    pub http_listen: Option<String>,
    /// ALSA-style capture device name, e.g. `"hw:0,0"`.
    pub alsa_device: String,
    /// Number of audio capture channels.
    pub alsa_num_channels: u32,
    /// Audio capture sample rate in Hz (named `bitrate` to match the
    /// original's `arecord --rate` reuse of the field).
    pub alsa_bitrate: u32,
}

impl ConfigFile {
    /// Reads and parses a configuration file from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RecError::Config(format!("reading {}: {}", path.as_ref().display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| RecError::Config(format!("parsing {}: {}", path.as_ref().display(), e)))
    }
}

/// CLI flags (spec.md §6).
///
/// clap's derive API only ever renders a `long` name with two dashes, but
/// spec.md §6 names the single-dash `-config`/`-addr` spelling — Go's
/// `flag` package convention, which the original CLI follows. [`Cli::parse_args`]
/// rewrites a leading single dash on these two flag names to double-dash
/// before handing argv to clap, so both spellings are accepted.
#[derive(Debug, Parser)]
#[command(name = "recstation", about = "Multicast MPEG-TS recording station")]
pub struct Cli {
    /// Config filename.
    #[arg(long = "config")]
    pub config: PathBuf,

    /// HTTP listen address, overridden by `http_listen` in the config file.
    #[arg(long = "addr", default_value = ":8080")]
    pub addr: String,
}

/// Long flag names accepted with either one or two leading dashes.
const SINGLE_DASH_LONG_FLAGS: &[&str] = &["config", "addr"];

impl Cli {
    /// Parses CLI flags from the process's own `argv`, accepting spec.md
    /// §6's single-dash spelling of `-config`/`-addr` in addition to
    /// clap's native `--config`/`--addr`.
    pub fn parse_args() -> Self {
        Self::parse_from(rewrite_single_dash_long_flags(std::env::args()))
    }
}

/// Rewrites a leading `-name` (single dash, `name` one of
/// [`SINGLE_DASH_LONG_FLAGS`]) to `--name`, leaving true short flags,
/// already-double-dashed flags, and positional arguments (including argv[0])
/// untouched.
fn rewrite_single_dash_long_flags(args: impl Iterator<Item = String>) -> Vec<String> {
    args.map(|arg| {
        let Some(rest) = arg.strip_prefix('-') else {
            return arg;
        };
        if rest.starts_with('-') {
            return arg;
        }
        let name = rest.split('=').next().unwrap_or(rest);
        if SINGLE_DASH_LONG_FLAGS.contains(&name) {
            format!("-{}", arg)
        } else {
            arg
        }
    })
    .collect()
}

/// A configured multicast group with its friendly name.
#[derive(Debug, Clone)]
pub struct Group {
    /// Operator-facing stream name, used in the sink map and output paths.
    pub name: String,
    /// Multicast group address.
    pub addr: Ipv4Addr,
}

/// Fully resolved runtime settings, built from [`ConfigFile`] plus [`Cli`].
///
/// This is the Rust analogue of the original's `State` (minus its mutable
/// recording bookkeeping, which lives on [`crate::coordinator::CoordinatorHandle`]).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Local hostname, substituted into filename templates.
    pub hostname: String,
    /// Network interface name multicast groups are joined on.
    pub iface_name: String,
    /// Output filename template.
    pub output_filename: String,
    /// Timestamp strftime pattern.
    pub output_timestamp: String,
    /// Configured multicast groups.
    pub groups: Vec<Group>,
    /// File rotation period while recording.
    pub new_output_every: Duration,
    /// MPEG-TS UDP source bind address.
    pub source_listen: SocketAddr,
    /// Heartbeat listener bind address.
    pub heartbeat_listen: SocketAddr,
    /// Heartbeat liveness timeout.
    pub heartbeat_timeout: Duration,
    /// HTTP control surface bind address.
    pub http_listen: SocketAddr,
    /// ALSA capture device.
    pub alsa_device: String,
    /// Audio channel count.
    pub alsa_num_channels: u32,
    /// Audio sample rate / `arecord --rate` and `ffmpeg -ar` value.
    pub alsa_bitrate: u32,
}

impl Settings {
    /// Resolves a [`ConfigFile`] plus CLI overrides into runtime [`Settings`].
    ///
    /// Per spec.md §7, every failure here is a fatal configuration error.
    pub fn resolve(cfg: ConfigFile, cli_addr: &str) -> Result<Self> {
        let hostname = hostname::get()
            .map_err(|e| RecError::Config(format!("reading hostname: {}", e)))?
            .to_string_lossy()
            .into_owned();

        let mut groups = Vec::with_capacity(cfg.multicasts.len());
        for (addr, name) in &cfg.multicasts {
            let addr: Ipv4Addr = addr
                .parse()
                .map_err(|e| RecError::Config(format!("multicast address {}: {}", addr, e)))?;
            groups.push(Group {
                name: name.clone(),
                addr,
            });
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        let new_output_every = parse_duration(&cfg.new_output_every)?;
        let heartbeat_timeout = parse_duration(&cfg.heartbeat_timeout)?;

        let source_listen = parse_listen_addr(&cfg.source_listen)?;
        let heartbeat_listen = parse_listen_addr(&cfg.heartbeat_listen)?;
        let http_listen = parse_listen_addr(cfg.http_listen.as_deref().unwrap_or(cli_addr))?;

        Ok(Settings {
            hostname,
            iface_name: cfg.iface,
            output_filename: cfg.output_filename,
            output_timestamp: cfg.output_timestamp,
            groups,
            new_output_every,
            source_listen,
            heartbeat_listen,
            heartbeat_timeout,
            http_listen,
            alsa_device: cfg.alsa_device,
            alsa_num_channels: cfg.alsa_num_channels,
            alsa_bitrate: cfg.alsa_bitrate,
        })
    }

    /// All configured group addresses, in the order used by §4.F's join list.
    pub fn group_addrs(&self) -> Vec<Ipv4Addr> {
        self.groups.iter().map(|g| g.addr).collect()
    }
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s)
        .map_err(|e| RecError::Config(format!("invalid duration {:?}: {}", s, e)))
}

/// Parses a `host:port` string, treating a bare `:port` as `0.0.0.0:port`
/// (Go's `net.Listen` shorthand, used throughout the original's config).
pub fn parse_listen_addr(s: &str) -> Result<SocketAddr> {
    let s = if let Some(port) = s.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        s.to_string()
    };
    s.parse()
        .map_err(|e| RecError::Config(format!("invalid listen address {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ConfigFile {
        let mut multicasts = HashMap::new();
        multicasts.insert("239.255.42.42".to_string(), "cam1".to_string());

        ConfigFile {
            iface: "eth0".to_string(),
            output_filename: "{{hostname}}/{{stream}}-{{timestamp}}.ts".to_string(),
            output_timestamp: "%Y%m%d-%H%M%S".to_string(),
            multicasts,
            new_output_every: "1m".to_string(),
            source_listen: ":5004".to_string(),
            heartbeat_listen: ":5005".to_string(),
            heartbeat_timeout: "3s".to_string(),
            http_listen: None,
            alsa_device: "hw:0,0".to_string(),
            alsa_num_channels: 2,
            alsa_bitrate: 48000,
        }
    }

    #[test]
    fn resolves_durations_and_addresses() {
        let settings = Settings::resolve(sample_config(), ":8080").unwrap();
        assert_eq!(settings.new_output_every, Duration::from_secs(60));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(settings.groups.len(), 1);
        assert_eq!(settings.groups[0].name, "cam1");
        assert_eq!(settings.http_listen.port(), 8080);
    }

    #[test]
    fn http_listen_overrides_cli_addr() {
        let mut cfg = sample_config();
        cfg.http_listen = Some(":9090".to_string());
        let settings = Settings::resolve(cfg, ":8080").unwrap();
        assert_eq!(settings.http_listen.port(), 9090);
    }

    #[test]
    fn rejects_malformed_duration() {
        let mut cfg = sample_config();
        cfg.new_output_every = "not-a-duration".to_string();
        assert!(Settings::resolve(cfg, ":8080").is_err());
    }

    #[test]
    fn colon_port_shorthand_binds_any_address() {
        let addr = parse_listen_addr(":5004").unwrap();
        assert_eq!(addr.ip(), std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(addr.port(), 5004);
    }

    fn rewrite(args: &[&str]) -> Vec<String> {
        rewrite_single_dash_long_flags(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn single_dash_long_flags_are_rewritten_to_double_dash() {
        let args = rewrite(&["recstation", "-config", "foo.json", "-addr", ":9090"]);
        assert_eq!(args, ["recstation", "--config", "foo.json", "--addr", ":9090"]);
    }

    #[test]
    fn single_dash_with_equals_is_rewritten_to_double_dash() {
        let args = rewrite(&["recstation", "-config=foo.json"]);
        assert_eq!(args, ["recstation", "--config=foo.json"]);
    }

    #[test]
    fn already_double_dashed_flags_are_left_alone() {
        let args = rewrite(&["recstation", "--config", "foo.json"]);
        assert_eq!(args, ["recstation", "--config", "foo.json"]);
    }

    #[test]
    fn unrelated_args_and_program_name_are_left_alone() {
        let args = rewrite(&["recstation", "foo.json", "-x"]);
        assert_eq!(args, ["recstation", "foo.json", "-x"]);
    }

    #[test]
    fn parses_single_dash_flags_via_parse_from() {
        let cli = Cli::parse_from(rewrite(&[
            "recstation", "-config", "foo.json", "-addr", ":9090",
        ]));
        assert_eq!(cli.config, PathBuf::from("foo.json"));
        assert_eq!(cli.addr, ":9090");
    }
}
