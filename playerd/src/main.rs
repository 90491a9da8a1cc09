//! The Player server binary: loads configuration, sets up logging,
//! wires together the device table, any configured fixture drivers
//! and remote bridges, and blocks the calling thread in the TCP
//! frontend's poll loop.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use player_core::{Driver, DriverHandle, Publisher};
use player_remote::{RemoteConfig, RemoteDriver};
use player_tcp::{Server, ServerConfig};
use player_types::{Access, Clock, Error, Result, SystemClock};
use player_wire::banner::BANNER_LEN;
use tracing::{error, info, warn};

mod config;

use config::{Config, DriverCfg, RemoteCfg};

fn access_from_char(c: char) -> Access {
    match c {
        'r' => Access::Read,
        'w' => Access::Write,
        _ => Access::All,
    }
}

/// Instantiates one of the toy fixture drivers by its config-file
/// `kind`. Any other `kind` is a configuration error -- this binary
/// doesn't ship a general driver-plugin mechanism, since concrete
/// hardware drivers are out of scope for the core.
fn build_fixture_driver(kind: &str, publisher: Publisher) -> Result<Box<dyn Driver>> {
    match kind {
        player_drv_echo::NAME => Ok(Box::new(player_drv_echo::EchoDriver::new(publisher))),
        player_drv_config::NAME => Ok(Box::new(player_drv_config::ConfigDriver::new(publisher))),
        other => Err(Error::DriverSetup(format!("no such fixture driver: {other}"))),
    }
}

fn register_drivers(table: &Arc<player_core::DeviceTable>, clock: &Arc<dyn Clock>, drivers: &[DriverCfg]) {
    for d in drivers {
        let addr = d.addr.to_addr();
        let publisher = Publisher::new(table.clone(), addr, clock.clone());

        match build_fixture_driver(&d.kind, publisher) {
            Ok(driver) => {
                let access = access_from_char(d.access);
                let name = d.name.clone().unwrap_or_else(|| d.kind.clone());

                info!(%addr, kind = %d.kind, ?access, "registering driver");
                table.register(addr, access, Some(name), Arc::new(DriverHandle::new(d.kind.clone(), driver)));
            }
            Err(e) => {
                error!(%addr, kind = %d.kind, error = %e, "failed to build driver, skipping");
            }
        }
    }
}

/// Installs a remote factory that answers lookups for the exact
/// addresses named under `[[remote]]` in the config file. Unlike a
/// fully general "any non-local address" factory, this binary only
/// bridges devices the operator named up front -- the core's factory
/// *mechanism* is general, but `playerd` doesn't attempt to guess
/// which unknown addresses are remote.
fn install_remote_factory(table: &Arc<player_core::DeviceTable>, clock: &Arc<dyn Clock>, remotes: Vec<RemoteCfg>) {
    if remotes.is_empty() {
        return;
    }

    let mut by_addr = HashMap::new();
    for r in remotes {
        by_addr.insert(r.addr.to_addr(), (r.peer, access_from_char(r.access)));
    }

    let table_for_factory = table.clone();
    let clock_for_factory = clock.clone();

    table.set_remote_factory(move |addr| {
        let (peer, wanted) = by_addr.get(&addr).copied().ok_or(Error::NotFound)?;
        let publisher = Publisher::new(table_for_factory.clone(), addr, clock_for_factory.clone());
        let driver: Box<dyn Driver> = Box::new(RemoteDriver::new(
            RemoteConfig {
                peer,
                target: addr,
                wanted,
            },
            publisher,
        ));

        Ok((Arc::new(DriverHandle::new(format!("remote@{peer}"), driver)), wanted, Some(format!("remote@{peer}"))))
    });
}

fn run(cfg: Config) -> Result<()> {
    let table = Arc::new(player_core::DeviceTable::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    register_drivers(&table, &clock, &cfg.driver);
    install_remote_factory(&table, &clock, cfg.remote);

    let server_cfg = ServerConfig {
        listen_addrs: cfg.listen,
        product_name: cfg.product_name,
        version: cfg.version,
        auth_key: cfg.auth_key,
    };

    if server_cfg.product_name.len() + 1 + server_cfg.version.len() > BANNER_LEN {
        warn!("identification banner will be clipped to fit the fixed-length field");
    }

    let mut server = Server::new(server_cfg, table, clock).map_err(|e| Error::Io(e.to_string()))?;
    server.run().map_err(|e| Error::Io(e.to_string()))
}

fn main() -> ExitCode {
    let Some(cfg) = config::get() else {
        return ExitCode::SUCCESS;
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(cfg.get_log_level())
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("unable to set global default subscriber");

    match run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server exited with an error: {e}");
            ExitCode::FAILURE
        }
    }
}
