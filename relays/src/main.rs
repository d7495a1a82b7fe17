use std::error::Error;

use tracing::{error, info};

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let settings = cmdline::settings_from_matches(&matches)?;
    setup_tracing::register(&settings.log)?;

    if let Err(e) = relays_core::run(settings).await {
        error!("{e:?}");
        return Err(e.into());
    }
    info!("Exiting...");

    Ok(())
}
