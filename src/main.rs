use anyhow::Result;
use clap::Parser;

use weir::{Proxy, cli::Cli, logging, settings::Settings};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_tracing(settings.log)?;
    let proxy = Proxy::new(settings)?;
    proxy.run()
}
