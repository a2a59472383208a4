use clap::{Parser, Subcommand};
use credflow_sdk::{
    CredentialOffer, Error, FlowCallbacks, FlowProgressEvent, FlowRequest, IssuanceFlow,
    PresentationFlow, SessionConfig, SessionContext, Transport,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "credflow")]
#[command(about = "Run credential issuance and presentation flows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, help = "WebSocket endpoint of the flow backend")]
    ws_url: Option<Url>,
    #[arg(long, help = "Base URL of the stateless proxy")]
    proxy_url: Option<Url>,
    #[arg(long, help = "Backend URL used for capability discovery")]
    backend_url: Option<Url>,
    #[arg(short, long, help = "Bearer token of the session")]
    token: Option<String>,
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the backend capabilities and the selected transport
    Status,
    #[command(arg_required_else_help = true)]
    Issue { offer_uri: String },
    #[command(arg_required_else_help = true)]
    Present { request_uri: String },
    #[command(arg_required_else_help = true)]
    Request {
        action: String,
        #[arg(short, long, help = "JSON payload, sends a POST over the proxy")]
        payload: Option<String>,
    },
}

fn print_json(value: &impl Serialize) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);

    Ok(())
}

fn progress_printer() -> FlowCallbacks {
    FlowCallbacks {
        on_progress: Some(Arc::new(|event: &FlowProgressEvent| {
            info!(
                "{}: {} ({}%)",
                event.flow_id,
                event.message.as_deref().unwrap_or(&event.stage),
                event.progress.unwrap_or_default()
            );
        })),
        ..Default::default()
    }
}

async fn run() -> Result<(), Error> {
    let args = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact().without_time())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if args.verbose {
                    "credflow=trace,credflow_sdk=trace"
                } else {
                    "credflow=info,credflow_sdk=info"
                }
                .into()
            }),
        )
        .init();

    let mut config = SessionConfig::from_env()?;
    if let Some(url) = args.ws_url {
        config.websocket_url = Some(url);
    }
    if let Some(url) = args.proxy_url {
        config.proxy_url = Some(url);
    }
    if let Some(url) = args.backend_url {
        config.backend_url = Some(url);
    }
    trace!("session config {config:?}");

    let session = Arc::new(SessionContext::new(config));
    session.refresh_capabilities().await;
    session.set_auth_token(args.token).await;

    match args.command {
        Commands::Status => {
            if let Some(endpoint) = session.config().discovery_endpoint() {
                let manifest = session.discovery().try_fetch_status(endpoint).await?;
                print_json(&manifest)?;
            }

            print_json(&session.connection_state())?;
        }
        Commands::Issue { offer_uri } => {
            let flow = IssuanceFlow::new(session.clone(), progress_printer());
            let result = flow.handle_offer(CredentialOffer::Uri(offer_uri)).await;
            info!("issuance flow ended in step {:?}", flow.step());

            print_json(&result)?;
        }
        Commands::Present { request_uri } => {
            let flow = PresentationFlow::new(session.clone(), progress_printer());
            let result = flow.handle_authorization_request(&request_uri).await;
            info!("presentation flow ended in step {:?}", flow.step());

            print_json(&result)?;
        }
        Commands::Request { action, payload } => {
            let payload = payload
                .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
                .transpose()?;
            let active = session.active_transport();
            info!("sending '{action}' over {}", active.kind().as_str());

            let response = active
                .transport()
                .request(FlowRequest::generic(action, payload))
                .await?;

            print_json(&response)?;
        }
    }

    session.shutdown().await;

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
