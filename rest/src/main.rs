use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{App, HttpServer};
use structopt::StructOpt;
use tracing::info;

use broker::extensions::{Helpers, WaitBudgets};
use broker::state;
use broker::{Broker, BrokerConfig, MemRepository};
use cloud::Ec2Provider;
use dockerhost::DockerHostFactory;
use shell::{RemoteShell, SshShell};

#[derive(Debug, StructOpt)]
struct CliArgs {
    /// Address to serve the API on
    #[structopt(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to serve the API on
    #[structopt(long, short, default_value = "8080")]
    port: u16,
    /// Identity baked into every instance tag
    #[structopt(long, short, default_value = "1")]
    broker_id: String,
    /// Account owning the base machine images
    #[structopt(long, default_value = "595879546273")]
    image_owner_id: String,
    /// Key pair installed on created instances
    #[structopt(long, default_value = "loads")]
    key_pair: String,
    /// Security group created instances join
    #[structopt(long, default_value = "loads")]
    security_group: String,
    /// Boot payload file handed to created instances
    #[structopt(long)]
    user_data: Option<PathBuf>,
    /// Private key for host-level ssh
    #[structopt(long, default_value = "loads.pem")]
    ssh_key: PathBuf,
    /// User for host-level ssh
    #[structopt(long, default_value = "core")]
    ssh_user: String,
    /// Projects and plans seeded at startup (.json or .toml)
    #[structopt(long)]
    initial_state: Option<PathBuf>,
    /// Scheduler tick of the run loop
    #[structopt(long, default_value = "1500ms")]
    poll_interval: humantime::Duration,
    /// Bound on concurrent cross-region pool operations
    #[structopt(long, default_value = "15")]
    pool_workers: usize,
}

fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }
}

fn to_io<E: std::fmt::Display>(error: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, error.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_tracing();
    let args = CliArgs::from_args();
    info!("Using options: {:?}", &args);

    let user_data = match &args.user_data {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };
    let config = BrokerConfig {
        broker_id: args.broker_id.clone(),
        image_owner_id: args.image_owner_id.clone(),
        key_pair: args.key_pair.clone(),
        security_group: args.security_group.clone(),
        user_data,
        poll_interval: args.poll_interval.into(),
        pool_workers: args.pool_workers,
    };

    let shell: Arc<dyn RemoteShell> =
        Arc::new(SshShell::new(args.ssh_user.clone(), args.ssh_key.clone()));
    let helpers = Arc::new(Helpers {
        factory: Arc::new(DockerHostFactory::new(shell.clone())),
        shell,
        wait: WaitBudgets::default(),
    });
    let repository = Arc::new(MemRepository::new());

    if let Some(path) = &args.initial_state {
        let projects = state::load_state_file(path).map_err(to_io)?;
        state::reconcile(repository.as_ref(), projects)
            .await
            .map_err(to_io)?;
    }

    let broker = Broker::start(
        config,
        Arc::new(Ec2Provider::default()),
        repository,
        helpers,
    )
    .await
    .map_err(to_io)?;
    broker.recover_runs().await.map_err(to_io)?;

    let data = rest::api::broker_data(broker);
    info!("Serving on {}:{}", args.host, args.port);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .configure(rest::configure)
    })
    .bind((args.host.as_str(), args.port))?
    .run()
    .await
}
