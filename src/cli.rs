use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "oledviz", about = "Audio spectrum analyzer and MPD now-playing display core")]
pub struct Cli {
    /// Config file (defaults to ./oledviz.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Preferred capture device; may be repeated, tried in order
    #[arg(short, long = "device")]
    pub devices: Vec<String>,

    /// MPD host (overrides config and MPD_HOST)
    #[arg(long)]
    pub mpd_host: Option<String>,

    /// MPD port (overrides config and MPD_PORT)
    #[arg(long)]
    pub mpd_port: Option<u16>,

    /// Disable MPD metadata sync
    #[arg(long)]
    pub no_mpd: bool,

    /// Initial sensitivity (10-300)
    #[arg(long)]
    pub sensitivity: Option<u32>,

    /// Initial noise reduction (0-100)
    #[arg(long)]
    pub noise_reduction: Option<u32>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}
