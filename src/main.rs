// Module declarations
mod cli;
mod config;
mod config_file;
mod context;
mod embed;
mod error;
mod forwarder;
mod gmail;
mod graph;
mod mcp;
mod notifications;
mod oauth;
mod subscriptions;
#[cfg(test)]
mod test_support;
mod token;
mod tool_args;
mod tool_defs;
mod tool_exec;
mod util;
mod vector;
mod webhook;

// Every module's items are re-exported at the crate root so modules can
// refer to each other as `crate::Name`.
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use config_file::*;
#[allow(unused_imports)]
pub(crate) use context::*;
#[allow(unused_imports)]
pub(crate) use embed::*;
#[allow(unused_imports)]
pub(crate) use forwarder::*;
#[allow(unused_imports)]
pub(crate) use gmail::*;
#[allow(unused_imports)]
pub(crate) use graph::*;
#[allow(unused_imports)]
pub(crate) use mcp::*;
#[allow(unused_imports)]
pub(crate) use notifications::*;
#[allow(unused_imports)]
pub(crate) use oauth::*;
#[allow(unused_imports)]
pub(crate) use subscriptions::*;
#[allow(unused_imports)]
pub(crate) use token::*;
#[allow(unused_imports)]
pub(crate) use tool_args::*;
#[allow(unused_imports)]
pub(crate) use tool_defs::*;
#[allow(unused_imports)]
pub(crate) use tool_exec::*;
#[allow(unused_imports)]
pub(crate) use util::*;
#[allow(unused_imports)]
pub(crate) use vector::*;
#[allow(unused_imports)]
pub(crate) use webhook::*;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    // stdout carries MCP frames and command output; logs stay on stderr
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn mask(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    format!("{visible}****")
}

fn parse_json_object(flag: &str, raw: Option<&str>) -> Result<Option<Value>, Box<dyn std::error::Error>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(format!("{flag} must be a JSON object").into());
    }
    Ok(Some(value))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve { host, port } => {
            let mut settings = Settings::load()?;
            if let Some(host) = host {
                settings.webhook.host = host;
            }
            if let Some(port) = port {
                settings.webhook.port = port;
            }
            let ctx = Arc::new(AppContext::new(settings)?);
            run_webhook_server(ctx)
        }

        Command::Mcp { server } => run_mcp_server(server, Settings::load()?),

        Command::Subscriptions { command } => {
            let ctx = AppContext::new(Settings::load()?)?;
            let subs = &ctx.subscriptions;
            match command {
                SubscriptionCommand::Create {
                    resource,
                    change_type,
                    webhook_path,
                    expiration_hours,
                } => {
                    let path = webhook_path
                        .map(|p| ensure_leading_slash(&p))
                        .unwrap_or_else(|| ctx.settings.webhook.email_path.clone());
                    print_json(&subs.create(&resource, &change_type, &path, expiration_hours)?)
                }
                SubscriptionCommand::List => print_json(&subs.list()?),
                SubscriptionCommand::Renew { id, expiration_hours } => {
                    print_json(&subs.renew(&id, expiration_hours)?)
                }
                SubscriptionCommand::Delete { id } => {
                    let existed = subs.delete(&id)?;
                    print_json(&serde_json::json!({ "id": id, "deleted": true, "existed": existed }))
                }
                SubscriptionCommand::SetupEmail { user_id } => {
                    print_json(&subs.setup_email(user_id.as_deref())?)
                }
                SubscriptionCommand::SetupTeams => {
                    let outcomes = subs.setup_teams();
                    print_json(&outcomes)?;
                    if outcomes.iter().all(|o| o.error.is_some()) {
                        return Err("no teams subscription could be created".into());
                    }
                    Ok(())
                }
            }
        }

        Command::Vector { command } => {
            let settings = Settings::load()?;
            if let VectorCommand::Launch { program, wait_secs } = &command {
                let servers = ChromaServers::launch(&settings.vector, program, Duration::from_secs(*wait_secs))?;
                println!("{} chroma server(s) healthy", servers.len());
                servers.wait()?;
                return Ok(());
            }
            let embedder = embedder_from_settings(&settings.vector.embedding)?;
            let store = VectorStoreManager::new(settings.vector.clone(), embedder)?;
            match command {
                VectorCommand::Launch { .. } => Ok(()),
                VectorCommand::Init => {
                    let handles: Vec<Value> = store
                        .init_all()?
                        .iter()
                        .map(|h| serde_json::json!({ "name": h.name, "id": h.id }))
                        .collect();
                    print_json(&handles)
                }
                VectorCommand::Add {
                    collection,
                    text,
                    id,
                    metadata,
                } => {
                    let metadata = match parse_json_object("--metadata", metadata.as_deref())? {
                        Some(Value::Object(map)) => map,
                        _ => Map::new(),
                    };
                    let id = id.unwrap_or_else(|| {
                        format!("doc_{}", &blake3_hash(text.as_bytes()).to_hex().as_str()[..16])
                    });
                    store.add(&collection, &[CollectionRecord { id: id.clone(), text, metadata }])?;
                    print_json(&serde_json::json!({ "id": id, "collection": collection }))
                }
                VectorCommand::Query {
                    collection,
                    query,
                    limit,
                    filter,
                } => {
                    let filter = parse_json_object("--where", filter.as_deref())?;
                    print_json(&store.query(&collection, &query, limit, filter.as_ref())?)
                }
                VectorCommand::Stats => print_json(&store.stats()?),
                VectorCommand::Reset { collection, yes } => {
                    if !yes {
                        return Err("refusing to reset without --yes".into());
                    }
                    let handle = store.reset(&collection)?;
                    println!("Reset {} ({})", handle.name, handle.id);
                    Ok(())
                }
            }
        }

        Command::Connect {
            provider,
            bind,
            port,
            redirect_base,
        } => {
            if !provider.eq_ignore_ascii_case("google") {
                return Err("provider must be google".into());
            }
            let settings = Settings::load()?;
            run_oauth_broker(&settings.gmail, &bind, port, redirect_base)?;
            Ok(())
        }

        Command::Config { command } => match command {
            ConfigCommand::Show => {
                let source = SettingsSource::from_env();
                let mut shown = Map::new();
                for key in SETTING_KEYS {
                    let value = match source.get(key) {
                        Some(v) if is_secret_key(key) => Value::String(mask(&v)),
                        Some(v) => Value::String(v),
                        None => Value::Null,
                    };
                    shown.insert((*key).to_string(), value);
                }
                println!("# {}", config_file_path().display());
                print_json(&shown)
            }
            ConfigCommand::Set { key, value } => {
                if !SETTING_KEYS.contains(&key.as_str()) {
                    tracing::warn!(%key, "key is not read by any component");
                }
                let path = config_file_path();
                let mut file = load_file_config(&path);
                file.set(&key, &value);
                save_file_config(&path, &file)?;
                println!("Set {key} in {}", path.display());
                Ok(())
            }
        },
    }
}
