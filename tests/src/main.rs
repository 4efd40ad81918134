use std::env::args;

use anyhow::{bail, Context, Result};
use foldsym::{folder::write_folded, pipeline::RunInputs, Pipeline};
use foldsym_tests::{local_libfoo, pulled_libfoo, Workspace};
use tokio::sync::watch;

/// Runs a fixture scenario end to end and prints the folded stacks
#[tokio::main]
async fn main() -> Result<()> {
    let test = args().nth(1).context("no scenario given")?;
    let ws = Workspace::new();
    pulled_libfoo(&ws);
    ws.write(
        "capture.txt",
        "buildid:b1b1b1b1+0x1010\nbuildid:b1b1b1b1+0x2004\n\nbuildid:b1b1b1b1+0x1010\nbuildid:b1b1b1b1+0x2004\n",
    );

    let config = match test.as_str() {
        "stripped" => ws.config(),
        "override" => {
            local_libfoo(&ws);
            ws.with_symbol_dir(ws.config())
        }
        other => bail!("unknown scenario {other}"),
    };

    let inputs = RunInputs {
        capture: ws.path("capture.txt"),
        manifest: Some(ws.path("manifest.txt")),
        ..Default::default()
    };
    let (_stop_tx, stop_rx) = watch::channel(());
    let outcome = Pipeline::new(config)?.fold(&inputs, stop_rx).await?;

    let stdout = std::io::stdout();
    write_folded(&outcome.entries, &mut stdout.lock())?;
    eprintln!(
        "Processed: {} samples, {} overrides.",
        outcome.summary.samples, outcome.summary.overrides
    );
    Ok(())
}
