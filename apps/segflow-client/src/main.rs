#![forbid(unsafe_code)]

mod observer;

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use segflow_abr::{AlgorithmKind, AlgorithmParams};
use segflow_core::{
    ClientController, DiagnosticsObserver, RequestQueue, SessionConfig, SessionDriver, TimerQueue,
};
use segflow_media::DEFAULT_SEGMENT_DURATION_US;
use segflow_network::encode_request;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};
use tracing::info;

use crate::observer::{LogDirObserver, LogTarget};

const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "segflow-client",
    version,
    about = "Adaptive segment streaming client"
)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8080", help = "Segment server address")]
    server: String,

    #[arg(
        long,
        default_value = "tobasco",
        help = "Adaptation algorithm: tobasco, panda or festive"
    )]
    algorithm: AlgorithmKind,

    #[arg(long, help = "Segment size table, one line of byte sizes per representation")]
    segment_sizes: PathBuf,

    #[arg(
        long,
        default_value_t = DEFAULT_SEGMENT_DURATION_US,
        help = "Segment duration in microseconds"
    )]
    segment_duration_us: i64,

    #[arg(long, help = "JSON file overriding algorithm parameters")]
    params_file: Option<PathBuf>,

    #[arg(long, help = "Directory for per-client diagnostics logs")]
    log_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 0, help = "Simulation id used in log file names")]
    simulation_id: u32,

    #[arg(long, default_value_t = 0, help = "Client id used in log file names")]
    client_id: u32,

    #[arg(long, default_value_t = 1, help = "Number of clients in the simulation")]
    number_of_clients: u32,

    #[arg(long, help = "Seed for randomized algorithm decisions")]
    seed: Option<u64>,
}

/// Session time in microseconds since the client started.
#[derive(Debug, Clone, Copy)]
struct SessionClock {
    started: Instant,
}

impl SessionClock {
    fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn now_us(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_micros()).unwrap_or(i64::MAX)
    }

    fn instant_at(&self, at_us: i64) -> Instant {
        self.started + Duration::from_micros(at_us.max(0) as u64)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut params = load_params(args.params_file.as_deref())?;
    if let Some(seed) = args.seed {
        params.festive.seed = Some(seed);
    }
    let config = SessionConfig {
        segment_duration_us: args.segment_duration_us,
        algorithm: args.algorithm,
        params,
    };
    let catalog = config
        .load_catalog(&args.segment_sizes)
        .with_context(|| format!("load segment sizes failed: {}", args.segment_sizes.display()))?;
    info!(
        algorithm = %config.algorithm,
        representations = catalog.representation_count(),
        segments = catalog.segment_count(),
        "catalog loaded"
    );

    let stream = TcpStream::connect(&args.server)
        .await
        .with_context(|| format!("connect to segment server failed: {}", args.server))?;
    stream.set_nodelay(true).context("set TCP_NODELAY failed")?;
    info!("connected to {}", args.server);

    match &args.log_dir {
        Some(root) => {
            let observer = LogDirObserver::create(
                root,
                LogTarget {
                    algorithm: config.algorithm,
                    number_of_clients: args.number_of_clients,
                    simulation_id: args.simulation_id,
                    client_id: args.client_id,
                },
            )?;
            let controller = ClientController::new(catalog, &config, observer);
            let controller = stream_session(stream, controller).await?;
            log_summary(&controller);
            controller.into_observer().finish()?;
        }
        None => {
            let controller = ClientController::new(catalog, &config, ());
            let controller = stream_session(stream, controller).await?;
            log_summary(&controller);
        }
    }
    Ok(())
}

fn load_params(path: Option<&Path>) -> Result<AlgorithmParams> {
    let Some(path) = path else {
        return Ok(AlgorithmParams::default());
    };
    let raw =
        fs::read(path).with_context(|| format!("read params file failed: {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("parse params file failed: {}", path.display()))
}

/// Runs one controller to completion over `stream`.
async fn stream_session<S, O>(
    stream: S,
    controller: ClientController<O>,
) -> Result<ClientController<O>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    O: DiagnosticsObserver,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut driver = SessionDriver::new(controller, RequestQueue::default(), TimerQueue::default());
    let clock = SessionClock::start();
    let mut buf = vec![0_u8; READ_BUFFER_BYTES];

    driver.start(clock.now_us())?;
    loop {
        while let Some(bytes) = driver.transport_mut().pop() {
            writer
                .write_all(&encode_request(bytes))
                .await
                .context("send segment request failed")?;
        }
        if driver.is_finished() {
            break;
        }

        let deadline = driver.scheduler().next_deadline();
        let wake = clock.instant_at(deadline.unwrap_or_default());
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read.context("read segment bytes failed")?;
                if n == 0 {
                    bail!(
                        "server closed the connection in state {:?}",
                        driver.controller().state()
                    );
                }
                driver.on_bytes(clock.now_us(), n as u64)?;
            }
            _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                let now = clock.now_us();
                while let Some((_, event)) = driver.scheduler_mut().pop_due(now) {
                    driver.on_timer(event, now)?;
                }
            }
        }
    }

    writer.shutdown().await.context("close segment connection failed")?;
    Ok(driver.into_controller())
}

fn log_summary<O: DiagnosticsObserver>(controller: &ClientController<O>) {
    let session = controller.session();
    let decisions = session.playback().decisions();
    let mean_representation = if decisions.is_empty() {
        0.0
    } else {
        decisions.iter().sum::<usize>() as f64 / decisions.len() as f64
    };
    info!(
        algorithm = %controller.algorithm().kind(),
        segments = session.playback_index(),
        underruns = session.underrun_count(),
        mean_representation,
        "session finished"
    );
}
