use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use clap::Parser;
use log::{info, warn};
use phomemo::{
    ble::BleLink,
    session,
    sim::{SimControl, SimulatedLink},
    ConvertMode, PrintJob, PrinterState, RadioLink, SessionConfig, WriteSelection,
};

#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Image to print.
    image: PathBuf,

    /// Plain threshold instead of dithering.
    #[arg(long)]
    threshold: bool,

    /// Only connect to devices whose name contains this.
    #[arg(long)]
    name: Option<String>,

    /// Give up if the printer isn't ready after this many seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    #[arg(long, value_name = "MS", default_value_t = 500)]
    poll_interval_ms: u64,

    /// Write to the second characteristic of the first service.
    #[arg(long)]
    positional_write: bool,

    /// Save the converted raster as a PNG.
    #[arg(long, value_name = "PATH")]
    preview: Option<PathBuf>,

    /// Convert only.
    #[arg(long)]
    no_print: bool,

    /// Print to an in-memory printer instead of BLE.
    #[arg(long)]
    simulate: bool,

    /// With --simulate, write what the printer received to this file.
    #[arg(long, value_name = "PATH", requires = "simulate")]
    dump: Option<PathBuf>,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ready_timeout: self.timeout.map(Duration::from_secs),
            write_selection: if self.positional_write {
                WriteSelection::Positional
            } else {
                WriteSelection::Capability
            },
            ..SessionConfig::default()
        }
    }
}

async fn print_on<L: RadioLink>(link: L, config: SessionConfig, job: PrintJob) -> anyhow::Result<()> {
    let (handle, task) = session::spawn(link, config);

    let mut states = handle.observe().await?;
    tokio::spawn(async move {
        while let Some(state) = states.recv().await {
            if let PrinterState::Error(fault) = state {
                warn!("{}", fault);
            }
        }
    });

    // gives up by itself on faults the session can't get past
    let printer = handle.wait_ready().await?;
    printer.print(job).await.context("printer refused the job")?;
    let state = handle
        .wait_for(|s| *s != PrinterState::Printing)
        .await?;
    if !state.is_ready() {
        bail!("print didn't finish, printer {}", state);
    }
    info!("done");

    drop(handle);
    task.await??;
    Ok(())
}

fn dump(control: &SimControl, path: &Path) -> anyhow::Result<()> {
    let printed = control.printed().concat();
    std::fs::write(path, &printed)
        .with_context(|| format!("couldn't write {}", path.display()))?;
    info!("wrote {} bytes to {}", printed.len(), path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();

    let mode = if args.threshold {
        ConvertMode::Threshold
    } else {
        ConvertMode::Dithered
    };
    let job = PrintJob::open(&args.image, mode)
        .with_context(|| format!("can't convert {}", args.image.display()))?;
    info!(
        "converted {} to {} rows",
        args.image.display(),
        job.raster().height()
    );

    if let Some(path) = &args.preview {
        job.raster()
            .to_preview()
            .save(path)
            .with_context(|| format!("couldn't save preview to {}", path.display()))?;
    }
    if args.no_print {
        return Ok(());
    }

    let config = args.session_config();
    if args.simulate {
        let link = SimulatedLink::default();
        let control = link.control();
        print_on(link, config, job).await?;
        if let Some(path) = &args.dump {
            dump(&control, path)?;
        }
    } else {
        let link = BleLink::new(args.name.clone())
            .await
            .context("can't get a BLE adapter")?;
        print_on(link, config, job).await?;
    }

    Ok(())
}
