use anyhow::Context;
use clap::{Parser, Subcommand};
use rhsm_register::config::{self, Config};
use rhsm_register::endpoints::known_endpoints;
use rhsm_register::{
    logging, ActivationKeyArgs, BusError, BusScope, ConfigService, ConnectionDescriptor,
    Dispatcher, OptionMap, OptionValue, RegisterServerService, RegistrationArgs, SuperuserPolicy,
    ValueStream, ZbusProxyFactory,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rhsm-register")]
#[command(author, version, about = "Register this system with subscription-manager over D-Bus", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with organization, username and password
    Register {
        /// Organization key
        #[arg(long)]
        org: String,

        /// Account username
        #[arg(long)]
        user: String,

        /// Account password (prompted when omitted)
        #[arg(long)]
        password: Option<String>,

        /// Registration option, e.g. "force=true" or "name=web01"
        #[arg(long = "option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        options: Vec<(String, OptionValue)>,

        /// Server connection option, e.g. "host=sub.example.com" or "port=443"
        #[arg(long = "connect", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        connect: Vec<(String, OptionValue)>,
    },

    /// Register with organization and activation keys
    RegisterKeys {
        /// Organization key
        #[arg(long)]
        org: String,

        /// Activation key (repeatable)
        #[arg(long = "key", required = true)]
        keys: Vec<String>,

        /// Registration option, e.g. "force=true"
        #[arg(long = "option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        options: Vec<(String, OptionValue)>,

        /// Server connection option, e.g. "host=sub.example.com"
        #[arg(long = "connect", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        connect: Vec<(String, OptionValue)>,
    },

    /// Stop the private registration servers
    StopServer,

    /// Read one subscription-manager configuration value
    ConfigGet { section: String, name: String },

    /// List the values of a subscription-manager configuration section
    ConfigGetAll { section: String },

    /// Change a subscription-manager configuration value, e.g. "server.insecure" "1"
    ConfigSet { name: String, value: String },

    /// List the known RHSM1 objects
    Endpoints,

    /// Configure rhsm-register itself
    Config {
        /// Locale passed to the registration server (e.g. "de_DE")
        #[arg(long)]
        locale: Option<String>,

        /// Seconds to wait for a service to become ready (0 = forever)
        #[arg(long)]
        ready_timeout: Option<u64>,

        /// Seconds to wait for each remote call (0 = forever)
        #[arg(long)]
        call_timeout: Option<u64>,

        /// Superuser policy
        #[arg(long, value_enum)]
        superuser: Option<SuperuserPolicy>,

        /// Bus to connect to
        #[arg(long, value_enum)]
        scope: Option<BusScope>,

        /// Show current config
        #[arg(long)]
        show: bool,
    },
}

/// Parse `key=value`, inferring booleans and integers.
fn parse_key_value(raw: &str) -> Result<(String, OptionValue), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), OptionValue::infer(value)))
        }
        _ => Err(format!("invalid option '{}': expected key=value", raw)),
    }
}

fn option_map(pairs: Vec<(String, OptionValue)>) -> OptionMap {
    pairs.into_iter().collect()
}

fn open_registration(config: &Config) -> RegisterServerService {
    RegisterServerService::open(
        Arc::new(ZbusProxyFactory::new()),
        Arc::new(Dispatcher::new()),
        config.service_options(),
    )
}

fn open_config_service(config: &Config) -> ConfigService {
    let options = config.service_options();
    let connection = ConnectionDescriptor::WellKnown {
        scope: options.scope,
        superuser: Some(options.superuser),
    };
    ConfigService::open(
        &ZbusProxyFactory::new(),
        Some(options.service.as_str()),
        &connection,
        options.timeouts,
    )
}

/// Wait for the consumer identity; Ctrl-C cancels the run.
async fn await_consumer(stream: &ValueStream<String>) -> Result<String, BusError> {
    tokio::select! {
        outcome = stream.value() => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling registration");
            stream.cancel();
            stream.value().await
        }
    }
}

fn print_consumer(consumer: &str, as_json: bool) {
    if as_json {
        println!("{}", json!({ "consumer": consumer }));
    } else {
        println!("Registered. Consumer: {}", consumer);
    }
}

fn print_endpoints(as_json: bool) -> anyhow::Result<()> {
    if as_json {
        let list: Vec<_> = known_endpoints()
            .iter()
            .map(|e| {
                json!({
                    "name": e.logical_name,
                    "interface": e.interface,
                    "object_path": e.object_path,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else {
        println!("Known RHSM1 objects:");
        for e in known_endpoints() {
            println!("  {:<16} {:<40} {}", e.logical_name, e.interface, e.object_path);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.command {
        Commands::Endpoints => Config::default(),
        _ => Config::load().context("loading configuration")?,
    };
    let _log_guard = logging::init(cli.verbose, &config.logging);

    match cli.command {
        Commands::Register {
            org,
            user,
            password,
            options,
            connect,
        } => {
            let password = match password {
                Some(p) => p,
                None => rpassword::prompt_password(format!("Password for {}: ", user))
                    .context("reading password")?,
            };
            let service = open_registration(&config);
            info!("Registering to organization {} as {}", org, user);
            let stream = service.start(RegistrationArgs {
                org,
                user,
                password,
                options: option_map(options),
                connect_options: option_map(connect),
            });
            let consumer = await_consumer(&stream).await?;
            print_consumer(&consumer, cli.json);
        }

        Commands::RegisterKeys {
            org,
            keys,
            options,
            connect,
        } => {
            let service = open_registration(&config);
            info!(
                "Registering to organization {} with {} activation key(s)",
                org,
                keys.len()
            );
            let stream = service.start_with_activation_keys(ActivationKeyArgs {
                org,
                activation_keys: keys,
                options: option_map(options),
                connect_options: option_map(connect),
            });
            let consumer = await_consumer(&stream).await?;
            print_consumer(&consumer, cli.json);
        }

        Commands::StopServer => {
            let service = open_registration(&config);
            let reply = service.stop().await?;
            if cli.json {
                println!("{}", json!({ "stopped": reply }));
            } else {
                println!("Registration server stopped: {}", reply);
            }
        }

        Commands::ConfigGet { section, name } => {
            let remote = open_config_service(&config);
            remote.ready().wait().await?;
            let value = remote.get(&section, &name).await?;
            if cli.json {
                println!(
                    "{}",
                    json!({ "name": format!("{}.{}", section, name), "type": value.type_name, "value": value.value })
                );
            } else {
                println!("{}", value.value);
            }
        }

        Commands::ConfigGetAll { section } => {
            let remote = open_config_service(&config);
            remote.ready().wait().await?;
            let values = remote.get_all(&section).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&values)?);
            } else {
                for value in values {
                    println!("{}", value);
                }
            }
        }

        Commands::ConfigSet { name, value } => {
            let remote = open_config_service(&config);
            remote.ready().wait().await?;
            remote.set(&name, OptionValue::infer(&value)).await?;
            println!("Set {} = {}", name, value);
        }

        Commands::Endpoints => {
            print_endpoints(cli.json)?;
        }

        Commands::Config {
            locale,
            ready_timeout,
            call_timeout,
            superuser,
            scope,
            show,
        } => {
            if show {
                config::show()?;
            } else {
                config::update(locale, ready_timeout, call_timeout, superuser, scope)?;
            }
        }
    }

    Ok(())
}
