mod engine_link;
mod objectstore;
mod ops;

use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use common::auth::{Authenticator, TrustAuthenticator};
use common::config::ServerConfig;
use common::err::server_error::ServerError;
use common::err::SResult;
use common::log::tracing_factory::{OutputType, TracingFactory, TracingFactoryOptions};
use common::server::{Server, ShutdownHandle};
use engine::pool::ConnectionPool;
use mysqlwire::server::MyServer;
use mysqlwire::session::MySessionContext;
use pgwire::server::PgServer;
use pgwire::session::SessionContext;
use replication::store::{ensure_reserved_schema, VarStore};
use replication::supervisor::SubscriptionSupervisor;
use translate::rewrite::install_macros;

use crate::objectstore::{ObjectStore, StoreLocation, UnconfiguredStore};
use crate::ops::FrontOps;

#[derive(Parser, Debug, Clone)]
#[command(name = "front_server")]
#[command(version)]
#[command(about = "Dual-protocol analytical database front-end")]
#[command(long_about = None)]
struct CliArgs {
    #[arg(long = "address", help = "listen address", default_value = "0.0.0.0")]
    address: String,

    #[arg(long = "port", help = "MySQL protocol port", default_value_t = 3306)]
    port: u16,

    #[arg(long = "socket", help = "MySQL unix socket path", default_value = "")]
    socket: String,

    #[arg(long = "datadir", help = "data directory", default_value = ".")]
    datadir: String,

    #[arg(long = "db-file", help = "engine database file", default_value = "engine.db")]
    db_file: String,

    #[arg(long = "loglevel", help = "trace|debug|info|warn|error", default_value = "info")]
    loglevel: String,

    #[arg(long = "pg-port", help = "PostgreSQL protocol port", default_value_t = 5432)]
    pg_port: u16,

    #[arg(long = "default-time-zone", default_value = "")]
    default_time_zone: String,

    ///////////////////////////////////////////////////
    // Replica reporting identity
    ///////////////////////////////////////////////////
    #[arg(long = "report-host", default_value = "")]
    report_host: String,

    #[arg(long = "report-port", default_value_t = 3306)]
    report_port: u16,

    #[arg(long = "report-user", default_value = "")]
    report_user: String,

    #[arg(long = "report-password", default_value = "")]
    report_password: String,

    ///////////////////////////////////////////////////
    // Restore-at-startup
    ///////////////////////////////////////////////////
    #[arg(long = "restore-file", default_value = "")]
    restore_file: String,

    #[arg(long = "restore-endpoint", default_value = "")]
    restore_endpoint: String,

    #[arg(long = "restore-access-key-id", default_value = "")]
    restore_access_key_id: String,

    #[arg(long = "restore-secret-access-key", default_value = "")]
    restore_secret_access_key: String,

    ///////////////////////////////////////////////////
    // TLS for the PostgreSQL SSLRequest upgrade
    ///////////////////////////////////////////////////
    #[arg(long = "cert-file", default_value = "")]
    cert_file: String,

    #[arg(long = "key-file", default_value = "")]
    key_file: String,

    #[arg(long = "init", help = "install the reserved schemas and exit", default_value_t = false)]
    init: bool,
}

impl CliArgs {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            address: self.address.clone(),
            port: self.port,
            pg_port: self.pg_port,
            socket: self.socket.clone(),
            datadir: self.datadir.clone(),
            db_file: self.db_file.clone(),
            loglevel: self.loglevel.clone(),
            default_time_zone: self.default_time_zone.clone(),
            report_host: self.report_host.clone(),
            report_port: self.report_port,
            report_user: self.report_user.clone(),
            report_password: self.report_password.clone(),
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config = args.to_config();

    let level = TracingFactoryOptions::parse_level(&config.loglevel);
    TracingFactory::init_log_with_options(TracingFactoryOptions::new(
        level,
        OutputType::STDOUT,
        None,
    ));

    match run(&args, &config).await {
        Ok(code) => code,
        Err(err) => {
            error!("fatal startup failure: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &CliArgs, config: &ServerConfig) -> SResult<ExitCode> {
    config.apply_default_time_zone()?;

    let object_store: Arc<dyn ObjectStore> = Arc::new(UnconfiguredStore);
    if !args.restore_file.is_empty() {
        let location = StoreLocation {
            uri: args.restore_file.clone(),
            endpoint: none_if_empty(&args.restore_endpoint),
            access_key_id: none_if_empty(&args.restore_access_key_id),
            secret_access_key: none_if_empty(&args.restore_secret_access_key),
        };
        object_store.get(&location, &config.db_path())?;
        info!("restored database from {}", args.restore_file);
    }

    let connector = engine_link::open_engine(&config.db_path())?;
    {
        // failing to create the reserved schemas is fatal
        let mut setup = connector.connect("main")?;
        ensure_reserved_schema(setup.as_mut())?;
        install_macros(setup.as_mut())?;
        setup.close()?;
    }
    if args.init {
        info!("reserved schemas installed, exiting");
        return Ok(ExitCode::SUCCESS);
    }

    let pool = Arc::new(ConnectionPool::new(connector.clone()));
    let vars = Arc::new(VarStore::new(connector.connect("main")?));
    let supervisor = Arc::new(SubscriptionSupervisor::new(
        pool.clone(),
        connector.connect("main")?,
    ));
    let ops = Arc::new(FrontOps {
        supervisor: supervisor.clone(),
        object_store,
        db_path: config.db_path(),
    });
    let auth: Arc<dyn Authenticator> = Arc::new(TrustAuthenticator);
    let tls = build_tls(config)?;

    let catalog = Path::new(&config.db_file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());

    let next_conn_id = Arc::new(AtomicU32::new(1));
    let datadir = Path::new(&config.datadir).to_path_buf();

    let pg_ctx = Arc::new(SessionContext {
        pool: pool.clone(),
        vars: vars.clone(),
        ops: ops.clone(),
        auth: auth.clone(),
        datadir: datadir.clone(),
        tls,
    });
    let my_ctx = Arc::new(MySessionContext {
        pool: pool.clone(),
        vars,
        ops,
        auth,
        datadir,
        catalog,
        report_host: config.report_host.clone(),
        report_port: config.report_port,
    });

    let mut pg_server = PgServer::new(config.pg_addr(), pg_ctx, next_conn_id.clone());
    let mut my_server = MyServer::new(
        config.mysql_addr(),
        none_if_empty(&config.socket),
        my_ctx,
        next_conn_id,
    );
    pg_server.start().await?;
    my_server.start().await?;

    let mut shutdown = ShutdownHandle::create();
    shutdown.add_service(Box::new(pg_server));
    shutdown.add_service(Box::new(my_server));

    let started = supervisor.start_saved()?;
    if started > 0 {
        info!("{} subscription(s) resumed", started);
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| ServerError::String(format!("signal handler: {}", err)))?;
    info!("shutting down");

    supervisor.shutdown();
    shutdown.shutdown_services(true).await?;
    Ok(ExitCode::SUCCESS)
}

fn none_if_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn build_tls(config: &ServerConfig) -> SResult<Option<tokio_native_tls::TlsAcceptor>> {
    if !config.ssl_configured() {
        return Ok(None);
    }
    let cert = std::fs::read(&config.cert_file)
        .map_err(|err| ServerError::Config(format!("cannot read cert file: {}", err)))?;
    let key = std::fs::read(&config.key_file)
        .map_err(|err| ServerError::Config(format!("cannot read key file: {}", err)))?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|err| ServerError::Config(format!("bad tls identity: {}", err)))?;
    let acceptor = native_tls::TlsAcceptor::builder(identity)
        .build()
        .map_err(|err| ServerError::Config(format!("cannot build tls acceptor: {}", err)))?;
    Ok(Some(tokio_native_tls::TlsAcceptor::from(acceptor)))
}
