use anyhow::{anyhow, Context, Result};
use ce_kernel::kv::{Kv, RedisKv};
use ce_kernel::registry::{DataType, Query, Registry};
use ce_kernel::rpc;
use ce_kernel::services::{ContainerEngine, NullEngine, ServiceManager};
use ce_kernel::KernelError;
use clap::{arg, value_parser, Command};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("ce-kernel")
        .version(VERSION)
        .about("A federated RPC kernel for containerized worker services")
        .arg(arg!(--host <HOST> "Listen address of the rpc switchboard"))
        .arg(arg!(--port <PORT> "Listen port of the rpc switchboard").value_parser(value_parser!(u16)))
        .get_matches();

    let env: HashMap<String, String> = std::env::vars().collect();
    init_logging(&env);

    let node = env
        .get("CE_NODE_NAME")
        .cloned()
        .ok_or_else(|| anyhow!("CE_NODE_NAME must be set"))?;
    let project = env
        .get("CE_PROJECT_NAME")
        .cloned()
        .unwrap_or_else(|| "default".to_string());

    let host = matches
        .get_one::<String>("host")
        .cloned()
        .or_else(|| env.get("rpc.host").cloned())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .or_else(|| env.get("rpc.port").and_then(|p| p.parse().ok()))
        .unwrap_or(2011);

    // local store and registry scope
    let redis_host = env
        .get("REDIS_HOST")
        .cloned()
        .unwrap_or_else(|| "redis".to_string());
    let redis_port: u16 = env
        .get("REDIS_PORT")
        .and_then(|p| p.parse().ok())
        .unwrap_or(6379);
    let redis_db: i64 = env
        .get("REDIS_DB")
        .and_then(|db| db.parse().ok())
        .unwrap_or(0);
    let redis_password = env.get("REDIS_PASSWORD").cloned();
    let kv_local: Arc<dyn Kv> = Arc::new(
        RedisKv::connect(&redis_host, redis_port, redis_db, redis_password)
            .await
            .context("connection to the local store refused")?,
    );
    let registry_local = Registry::local(kv_local);

    for key in ["kernel/env", "kernel/services"] {
        declare_key(&registry_local, key).await?;
    }

    // the global store endpoint lives in the local registry; a node that
    // has none configured shares the local endpoint
    let global = registry_local
        .get(
            "kernel/env",
            &Query::keys(["REDIS_HOST", "REDIS_PORT", "REDIS_DB", "REDIS_PASSWORD"]),
        )
        .await
        .context("could not read kernel/env")?;
    let g_host = global
        .get("REDIS_HOST")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| redis_host.clone());
    let g_port = global
        .get("REDIS_PORT")
        .and_then(json_int)
        .map(|p| p as u16)
        .unwrap_or(redis_port);
    let g_db = global
        .get("REDIS_DB")
        .and_then(json_int)
        .unwrap_or(redis_db);
    let g_password = global
        .get("REDIS_PASSWORD")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let kv_global: Arc<dyn Kv> = Arc::new(
        RedisKv::connect(&g_host, g_port, g_db, g_password)
            .await
            .context("connection to the global store refused")?,
    );
    let registry_global = Registry::global(kv_global);
    declare_key(&registry_global, "kernel/nodes").await?;

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("could not bind {host}:{port}"))?;
    info!("starting server ({host}:{port})");

    let engine: Arc<dyn ContainerEngine> = Arc::new(NullEngine);
    let services = Arc::new(ServiceManager::new(
        registry_local.clone(),
        engine,
        &project,
        &node,
    ));

    let (handle, command_rx) = rpc::command_channel();
    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(rpc::switchboard(
        node.clone(),
        listener,
        registry_local.clone(),
        registry_global.clone(),
        services.clone(),
        env.clone(),
        handle.clone(),
        command_rx,
    ));

    for (name, descriptor) in services.list().await? {
        if let Err(e) = services.start(&name, Some(descriptor.scale)).await {
            error!("could not start service `{name}`: {e}");
        }
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("could not install the terminate handler")?;
    let crash: Option<String> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            None
        }
        _ = sigterm.recv() => {
            info!("terminate received");
            None
        }
        joined = tasks.join_next() => match joined {
            // a clean return is a requested shutdown (kernel.exit)
            Some(Ok(Ok(()))) => {
                info!("switchboard stopped by request");
                None
            }
            Some(Ok(Err(e))) => Some(format!("switchboard failed: {e}")),
            Some(Err(e)) => Some(format!("switchboard panicked: {e}")),
            None => Some("no tasks left to run".to_string()),
        },
    };

    info!("stopping kernel...");
    for name in services.list().await.unwrap_or_default().into_keys() {
        if let Err(e) = services.stop(&name).await {
            warn!("error stopping service `{name}`: {e}");
        }
    }
    handle.shutdown();
    while tasks.join_next().await.is_some() {}

    match crash {
        Some(reason) => Err(anyhow!(reason)),
        None => Ok(()),
    }
}

async fn declare_key(registry: &Registry, key: &str) -> Result<()> {
    match registry.create(key, DataType::Hash, None, None).await {
        Ok(_) => {
            info!("declared registry key `{key}`");
            Ok(())
        }
        // another kernel (or an earlier run) beat us to it
        Err(KernelError::Consistency(_)) => Ok(()),
        Err(e) => Err(anyhow!("could not declare registry key `{key}`: {e}")),
    }
}

// kernel/env values arrive JSON-decoded; admins write numbers and strings
// interchangeably
fn json_int(v: &serde_json::Value) -> Option<i64> {
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn init_logging(env: &HashMap<String, String>) {
    let level = env
        .get("kernel.logging.level")
        .or_else(|| env.get("logging_level"))
        .map(String::as_str)
        .unwrap_or("debug");
    env_logger::Builder::new()
        .parse_filters(&level.to_lowercase())
        .init();
}
