mod config;
mod error;
mod messages;
mod relay;
mod server;
mod store;

use std::sync::Arc;

use log::{error, info};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use warp::Filter;

use config::Config;
use relay::{MemoryBus, RedisBus, RelayBus};
use server::Server;
use store::{RedisBackend, SessionStore};

/// Join request from the page-serving side: the rendered chat view embeds
/// these two values so the client can open a connection and send `join`.
#[derive(Deserialize)]
struct JoinForm {
    user: String,
    room: String,
}

async fn connect_shared(
    url: &str,
    config: &Config,
) -> Result<(Arc<SessionStore>, Arc<dyn RelayBus>), error::Error> {
    let client = redis::Client::open(url)?;
    let conn = client.get_multiplexed_tokio_connection().await?;
    let bus = RedisBus::connect(&client).await?;
    let backend = Arc::new(RedisBackend::new(conn));
    let store = Arc::new(SessionStore::shared(
        backend,
        config.session_ttl,
        config.store_timeout,
    ));
    info!("shared store connected");
    Ok((store, Arc::new(bus)))
}

fn render_chat_page(user: &str, room: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Gossip - {room}</title></head>\n\
         <body data-username=\"{user}\" data-roomname=\"{room}\">\n\
         <h2 id=\"roomNameDisplay\">{room}</h2>\n\
         <div id=\"msg-container\"></div>\n\
         <form><input id=\"msg\" autocomplete=\"off\"><button id=\"btn\">Send</button></form>\n\
         <script src=\"/chat.js\"></script>\n\
         </body>\n</html>\n"
    )
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let (store, bus): (Arc<SessionStore>, Arc<dyn RelayBus>) = match &config.redis_url {
        Some(url) => match connect_shared(url, &config).await {
            Ok(pair) => pair,
            // Serving every connection from the local fallback would
            // defeat a multi-instance deployment, so refuse to start.
            Err(err) => {
                error!("shared store initialization failed: {err}");
                std::process::exit(1);
            }
        },
        None => {
            info!("REDIS_URL not set, running single-instance with in-process state");
            (
                Arc::new(SessionStore::local(config.session_ttl)),
                Arc::new(MemoryBus::new()),
            )
        }
    };

    let server = Server::new(Arc::clone(&store), Arc::clone(&bus));

    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);
    let bus_task = tokio::spawn({
        let bus = Arc::clone(&bus);
        async move {
            if let Err(err) = bus.run(relay_tx, stop_rx).await {
                error!("relay subscription failed: {err}");
            }
        }
    });
    let dispatch_task = tokio::spawn({
        let server = server.clone();
        async move { server.relay_loop(relay_rx).await }
    });
    let sweep = store.spawn_sweep(config.sweep_interval);

    let ws_server = server.clone();
    let ws_route = warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
        let server = ws_server.clone();
        ws.on_upgrade(move |socket| async move {
            server.handle_connection(socket).await;
        })
    });

    let join_route = warp::path("join")
        .and(warp::post())
        .and(warp::body::form())
        .map(|form: JoinForm| warp::reply::html(render_chat_page(&form.user, &form.room)));

    let static_files = warp::fs::dir("public");

    let routes = join_route
        .or(ws_route)
        .or(static_files)
        .with(warp::cors().allow_any_origin());

    info!("server starting on port {}", config.port);
    let (_addr, serving) = warp::serve(routes).bind_with_graceful_shutdown(
        ([0, 0, 0, 0], config.port),
        async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, closing connections");
        },
    );
    serving.await;

    // stop relaying before tearing down the store connections
    let _ = stop_tx.send(true);
    let _ = bus_task.await;
    let _ = dispatch_task.await;
    sweep.stop().await;
    info!("server closed gracefully");
}
