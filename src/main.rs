use arlb_routing::{
  clock::{Clock, TokioClock},
  configuration::{Config, ConfigWatcher},
  dispatch::Dispatcher,
  forwarder::HttpForwarder,
  health::{active::ActiveHealthCheckMonitor, prober::HttpProber},
  logging,
  random::ThreadRandom,
  registry::{ClusterRegistry, Policies},
  server,
};
use clap::{Arg, Command};
use log::info;
use std::{error::Error, io, sync::Arc, time::Duration};
use tokio::try_join;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn Error>> {
  let matches = Command::new("arlb-routing")
    .version(env!("CARGO_PKG_VERSION"))
    .arg(
      Arg::new("config")
        .short('c')
        .long("config")
        .takes_value(true)
        .default_value("config.toml")
        .help("Path of the TOML configuration file, reloaded on change"),
    )
    .get_matches();
  let config_path = matches.value_of("config").unwrap_or("config.toml").to_string();

  let _log_handle = logging::initialize()?;

  let config = Config::load(&config_path)?;
  let clock: Arc<dyn Clock> = Arc::new(TokioClock);
  let policies = Policies::builtin(
    Arc::new(ThreadRandom),
    clock.clone(),
    Arc::new(config.data_protection.protector()?),
  );
  let monitor = ActiveHealthCheckMonitor::new(Arc::new(HttpProber), clock);
  let registry = Arc::new(ClusterRegistry::new(policies, monitor));
  registry.apply_snapshot(config.clusters);

  let dispatcher = Dispatcher::new(Arc::new(HttpForwarder::new(CONNECT_TIMEOUT)));
  let watcher = ConfigWatcher::new(config_path);
  info!("Listening on {}", config.listen_address);

  try_join!(server::create(config.listen_address, registry.clone(), dispatcher), async {
    watcher
      .watch_config_and_apply(registry.clone())
      .await
      .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
  })?;

  Ok(())
}
