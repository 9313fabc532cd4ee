use std::{net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use is_terminal::IsTerminal;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay::{
    Context, DEFAULT_CERT_DIR, Error, Result, Role,
    filter::EnforcementMode,
    namespaces::{self, NamespaceState},
    reconciler,
    relay::Relay,
    webhook,
};

fn main() {
    use clap::{
        Arg, ArgAction, Command, ValueHint, crate_authors, crate_description, crate_name,
        crate_version, value_parser,
    };
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run relays").args([
            Arg::new("introspection_address")
                .long("introspection-bind-address")
                .help("address to bind for the HTTP introspection server")
                .default_value("[::]:8089"),
            Arg::new("webhook_address")
                .long("webhook-bind-address")
                .env("RELAY_WEBHOOK_ADDRESS")
                .help("address to bind for the webhook server")
                .long_help(concat!(
                    "Address to bind for the webhook server.\n",
                    "If there's a TLS certificate and key at the files specified by ",
                    "`cert-dir`, `cert-name`, and `key-name` then HTTPS will be served."
                ))
                .default_value("[::]:8443"),
            Arg::new("cert_dir")
                .long("cert-dir")
                .help("directory containing TLS cert+key pair")
                .value_hint(ValueHint::DirPath)
                .default_value(DEFAULT_CERT_DIR.clone().into_os_string()),
            Arg::new("cert_name")
                .long("cert-name")
                .help("file inside `cert-dir` containing the TLS certificate")
                .default_value("tls.crt"),
            Arg::new("key_name")
                .long("key-name")
                .help("file inside `cert-dir` containing the TLS certificate key")
                .default_value("tls.key"),
            Arg::new("require_label")
                .long("require-label")
                .env("REQUIRE_LABEL")
                .help("only enforce in namespaces carrying the inclusion label")
                .action(ArgAction::SetTrue),
            Arg::new("delegate_timeout")
                .long("delegate-timeout")
                .env("RELAY_DELEGATE_TIMEOUT")
                .help("seconds to wait for a delegate webhook to answer")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("10"),
            Arg::new("relays")
                .action(ArgAction::Append)
                .default_values(["mutating", "validating"]),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(Error::from(e)),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    cert_dir: PathBuf,
    cert_name: String,
    delegate_timeout: Duration,
    introspection_address: SocketAddr,
    key_name: String,
    mode: EnforcementMode,
    relays: Vec<String>,
    webhook_address: SocketAddr,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = std::net::AddrParseError;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        let string = |id: &str| m.get_one::<String>(id).cloned().unwrap_or_default();
        Ok(Self {
            webhook_address: string("webhook_address").parse()?,
            introspection_address: string("introspection_address").parse()?,
            mode: EnforcementMode::from(m.get_flag("require_label")),
            delegate_timeout: Duration::from_secs(
                m.get_one::<u64>("delegate_timeout").copied().unwrap_or(10),
            ),
            relays: m
                .get_many::<String>("relays")
                .map(|v| v.cloned().collect())
                .unwrap_or_default(),
            cert_dir: string("cert_dir").into(),
            cert_name: string("cert_name"),
            key_name: string("key_name"),
        })
    }
}

impl Args {
    /// Roles returns the enabled roles, in order and without repeats.
    fn roles(&self) -> Vec<Role> {
        let mut roles = Vec::new();
        for name in &self.relays {
            match Role::from_str(name) {
                Ok(role) if !roles.contains(&role) => roles.push(role),
                Ok(_) => {}
                Err(_) => warn!(name, "unrecognized relay name, skipping"),
            }
        }
        roles
    }
}

fn startup(args: Args) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.introspection_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
        relay::metrics::describe();
    });
    let stop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        token.cancel();
    });
    rt.block_on(run(args, stop))
}

async fn run(args: Args, token: CancellationToken) -> Result<()> {
    use tokio::task;

    let roles = args.roles();
    if roles.is_empty() {
        return Err(anyhow::anyhow!("no relays enabled").into());
    }

    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config)?.build();
    let ctx = Arc::new(Context::new(client.clone()));
    let mut tasks = task::JoinSet::new();

    let (store, fut) = namespaces::reflector(token.clone(), client);
    tasks.spawn(fut);
    let ns: Arc<dyn NamespaceState> = Arc::new(store.clone());

    let mut relays = Vec::with_capacity(roles.len());
    for role in roles {
        match role {
            Role::Mutating => {
                tasks.spawn(reconciler::controller::<MutatingWebhookConfiguration>(
                    token.clone(),
                    ctx.clone(),
                )?);
            }
            Role::Validating => {
                tasks.spawn(reconciler::controller::<ValidatingWebhookConfiguration>(
                    token.clone(),
                    ctx.clone(),
                )?);
            }
        }
        relays.push(
            Relay::new(role, args.mode, ctx.table(role).clone(), ns.clone())
                .with_timeout(args.delegate_timeout),
        );
        info!(%role, prefix = role.prefix(), "relay enabled");
    }

    let tls = webhook::tls_files(&args.cert_dir, &args.cert_name, &args.key_name);
    let addr = args.webhook_address;
    let server = token.clone();
    tasks.spawn(async move {
        tokio::select! {
            _ = server.cancelled() => return Ok(()),
            res = store.wait_until_ready() => res.map_err(anyhow::Error::from)?,
        }
        info!("namespace cache synced");
        webhook::serve(addr, tls, webhook::app(relays), server).await
    });

    info!("setup done, relays running");
    while let Some(res) = tasks.join_next().await {
        match res {
            Err(e) => error!("error starting task: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from task: {e}");
                    token.cancel();
                }
            }
        };
    }
    Ok(())
}
