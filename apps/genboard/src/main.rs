mod cli;
mod logging;
mod render;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command, ConnectionArgs};
use genboard_sync::{
    CommandMode, GenerationSession, HttpCommandTransport, HttpPollChannel, OfflinePush,
    PushChannel, PushEvent, SessionStatus, SessionStore, SessionView, SyncConfig, ViewExit,
    WsPushChannel,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&logging::LogConfig {
        level: cli.logging.log_level,
        file: cli.logging.log_file.clone(),
    })?;
    let config = resolve_config(&cli.connection)?;
    run(cli, config).await
}

/// Environment first, then any flags given on the command line.
fn resolve_config(args: &ConnectionArgs) -> Result<SyncConfig> {
    let from_env = SyncConfig::from_env().context("invalid GENBOARD_* environment")?;
    if args.api_base.is_none() && args.push_url.is_none() && args.token.is_none() {
        return Ok(from_env);
    }
    let api_base = args
        .api_base
        .clone()
        .unwrap_or_else(|| from_env.api_base.to_string());
    // A new API base gets its own derived push URL unless one is given.
    let push_url = match (&args.push_url, &args.api_base) {
        (Some(url), _) => Some(url.clone()),
        (None, Some(_)) => None,
        (None, None) => Some(from_env.push_url.to_string()),
    };
    let token = args.token.clone().or(from_env.token);
    Ok(SyncConfig::from_parts(
        &api_base,
        push_url.as_deref(),
        token,
        from_env.timings,
    )?)
}

async fn run(cli: Cli, config: SyncConfig) -> Result<ExitCode> {
    info!(
        target = "genboard::cli",
        api_base = %config.api_base,
        push_url = %config.push_url,
        push = !cli.connection.no_push,
        "starting"
    );
    let store = Arc::new(SessionStore::new());
    let endpoint = config.endpoint();
    let poll = Arc::new(HttpPollChannel::new(endpoint.clone(), &config.timings)?);
    let transport = Arc::new(HttpCommandTransport::new(endpoint, &config.timings)?);

    let (ws, push_events) = if cli.connection.no_push {
        // Closed right away; the view falls back to polling.
        let (_closed, events) = mpsc::unbounded_channel::<PushEvent>();
        (None, events)
    } else {
        let (channel, events) = WsPushChannel::connect(config.push_settings());
        (Some(Arc::new(channel)), events)
    };
    let push: Arc<dyn PushChannel> = match &ws {
        Some(channel) => Arc::clone(channel) as Arc<dyn PushChannel>,
        None => Arc::new(OfflinePush),
    };

    let view = SessionView::new(Arc::clone(&store), push, poll, transport, &config.timings);
    let outcome = drive(&view, &store, &cli.command, push_events).await;

    view.close();
    if let Some(ws) = ws {
        ws.close().await;
    }
    outcome
}

async fn drive(
    view: &SessionView,
    store: &Arc<SessionStore>,
    command: &Command,
    push_events: mpsc::UnboundedReceiver<PushEvent>,
) -> Result<ExitCode> {
    let session_id = command.session().to_string();
    view.open(&session_id)
        .await
        .with_context(|| format!("could not open session {session_id}"))?;

    match command {
        Command::Watch { .. } => {}
        Command::Chat { message, .. } => {
            view.send(message, CommandMode::FireAndForget).await?;
            println!("> {message}");
        }
        Command::Create { prompt, .. } => {
            view.send(prompt, CommandMode::Streamed).await?;
            println!("> {prompt}");
        }
    }

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!(target = "genboard::cli", "interrupted");
            interrupt.cancel();
        }
    });

    let follower = tokio::spawn({
        let store = Arc::clone(store);
        let session_id = session_id.clone();
        let shutdown = shutdown.clone();
        async move {
            let settled = render::follow(store, session_id, shutdown.clone()).await;
            // Settling ends the view as well.
            shutdown.cancel();
            settled
        }
    });

    let exit = view.run(push_events, shutdown.clone()).await;
    shutdown.cancel();
    let settled = follower.await.context("timeline printer panicked")?;

    if let ViewExit::Abandoned { session_id, reason } = exit {
        bail!("session {session_id} abandoned: {reason}");
    }
    match settled {
        Some(session) => Ok(report(command, &session)),
        None => {
            println!("left session {session_id}; generation continues server-side");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report(command: &Command, session: &GenerationSession) -> ExitCode {
    if matches!(command, Command::Create { .. }) {
        for line in render::summary(session) {
            println!("{line}");
        }
    }
    match session.status {
        SessionStatus::Failed | SessionStatus::Error => ExitCode::FAILURE,
        // A rejected command settles back to idle with a warning.
        SessionStatus::Idle if session.warning.is_some() && !matches!(command, Command::Watch { .. }) => {
            ExitCode::FAILURE
        }
        _ => ExitCode::SUCCESS,
    }
}
