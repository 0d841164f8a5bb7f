mod cli;

use anyhow::{Context, Result};
use clap::Parser;

use cli::Cli;
use oledviz::config::{load_config, VisualizerConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("loading configuration")?;
    config.apply_env();
    apply_cli(&mut config, &cli);
    config.normalize();

    oledviz::run(config).context("oledviz failed to start")
}

fn apply_cli(config: &mut VisualizerConfig, cli: &Cli) {
    if !cli.devices.is_empty() {
        config.audio.devices = cli.devices.clone();
    }
    if let Some(host) = &cli.mpd_host {
        config.mpd.host = host.clone();
    }
    if let Some(port) = cli.mpd_port {
        config.mpd.port = port;
    }
    if cli.no_mpd {
        config.mpd.enabled = false;
    }
    if let Some(v) = cli.sensitivity {
        config.analyzer.sensitivity = v;
    }
    if let Some(v) = cli.noise_reduction {
        config.analyzer.noise_reduction = v;
    }
    if cli.log_json {
        config.logging.json = true;
    }
}
