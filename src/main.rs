use std::env;
use std::io;
use std::process::ExitCode;

use ticketflow::csv::{ScenarioRow, read_scenario, write_summary};
use ticketflow::{Config, Engine};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: ticketflow <scenario.csv>");
        return ExitCode::from(2);
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let rows = match read_scenario(&path) {
        Ok(rows) => rows,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let engine = Engine::new(Config::from_env());
    engine.start();

    // events first, so every purchase sees its resource
    let mut purchases = Vec::new();
    for result in rows {
        match result {
            Ok(ScenarioRow::Event(resource)) => {
                if let Err(e) = engine.create_resource(resource).await {
                    warn!("{e}");
                }
            }
            Ok(ScenarioRow::Purchase(request)) => purchases.push(request),
            Err(e) => warn!("{e}"),
        }
    }

    let (sender, receiver) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        for request in purchases {
            if sender.send(request).await.is_err() {
                break;
            }
        }
    });

    for (request, result) in engine.run(ReceiverStream::new(receiver)).await {
        if let Err(e) = result {
            warn!(
                resource = %request.resource_id,
                requester = %request.requester_id,
                "{e}"
            );
        }
    }

    engine.wait_settled().await;
    engine.shutdown().await;

    let summary = match engine.summary().await {
        Ok(summary) => summary,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = write_summary(io::stdout().lock(), summary) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
