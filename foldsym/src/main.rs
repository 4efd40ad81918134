use anyhow::{Context, Result};
use clap::Parser;
use foldsym::{
    args::{Commands, Opt},
    pipeline::Pipeline,
    symbolication::dump_elf::dump_elf,
};
use tokio::{signal, sync::watch};
use tracing::info;

fn init_logger() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FOLDSYM_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let opt = Opt::parse();
    match opt.command {
        Commands::Symbols { paths } => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for p in &paths {
                dump_elf(p, &mut out)?;
            }
        }
        Commands::Fold(args) => {
            let config = args.config()?;
            let pipeline = Pipeline::new(config)?;

            // for awaiting Ctrl-C signal
            let (stop_tx, stop_rx) = watch::channel(());
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    info!("interrupted, no output will be written");
                    let _ = stop_tx.send(());
                }
            });

            let summary = pipeline
                .run(&args.inputs(), stop_rx)
                .await
                .with_context(|| format!("unable to fold {}", args.capture.display()))?;
            if let Some(path) = &args.summary {
                summary.write_json(path)?;
            }
        }
    }

    Ok(())
}
