use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::*;

use hobbyfarm_operator::config::{Args, Settings, StoreKind};
use hobbyfarm_operator::leader::LeaderElector;
use hobbyfarm_operator::runtime::{Clock, Terms};
use hobbyfarm_operator::store::{KubeStore, MemoryStore, ObjectStore};
use hobbyfarm_operator::{controllers, telemetry, Context, Metrics, State};

#[derive(Debug, clap::Parser)]
#[command(version, about = "Reconciles HobbyFarm scheduled events, machines, claims and sessions")]
struct Arguments {
    #[command(flatten)]
    args: Args,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

/// Runs every controller's caches, and campaigns for the terms in which
/// their reconcilers work unless `campaign` is off
async fn run_controllers<S: ObjectStore>(
    store: S,
    state: State,
    reconcile_metrics: Metrics,
    token: CancellationToken,
    campaign: bool,
) {
    let ctx = Context::new(store.clone(), &state, reconcile_metrics, Clock::System);
    let (terms, publisher) = Terms::new();
    let controllers = controllers::run_all(ctx, token.clone(), terms);
    if !campaign {
        info!("Controllers are disabled; only caches run");
        drop(publisher);
        return controllers.await;
    }

    let elector = LeaderElector::new(store, &state, Clock::System);
    let publisher = &publisher;
    let campaign = elector.run(token, |term| async move {
        publisher.publish(term.clone());
        term.cancelled().await;
        publisher.withdraw();
    });
    tokio::join!(controllers, campaign);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Arguments { args } = Arguments::parse();
    telemetry::init(args.log_format)?;

    let bind_address = args.bind_address.clone();
    let state = State::new(Settings::from(&args));
    let reconcile_metrics = Metrics::default().register(&state.registry)?;
    let token = CancellationToken::new();

    let controller = {
        let (state, token) = (state.clone(), token.clone());
        async move {
            let campaign = !args.disable_controllers;
            match args.store {
                StoreKind::Kubernetes => {
                    let client = kube::Client::try_default().await?;
                    let store = KubeStore::new(client);
                    run_controllers(store, state, reconcile_metrics, token, campaign).await
                }
                StoreKind::Memory => {
                    warn!("Using the in-memory store; nothing outlives this process");
                    let store = MemoryStore::default();
                    run_controllers(store, state, reconcile_metrics, token, campaign).await
                }
            }
            anyhow::Ok(())
        }
    };

    let shutdown = {
        let token = token.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
                return;
            }
            info!("Shutting down");
            token.cancel();
        }
    };
    tokio::spawn(shutdown);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&bind_address)?
    .shutdown_timeout(5)
    .run();

    // Both runtimes implements graceful shutdown, so poll until both are done
    let (controller, server) = tokio::join!(controller, server);
    controller?;
    server?;
    Ok(())
}
