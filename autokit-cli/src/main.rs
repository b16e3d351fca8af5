mod cli;

use std::{path::Path, process::ExitCode};

use anyhow::Context;
use autokit::{Autokit, Status, config::AutokitConfig};
use clap::{CommandFactory, Parser};
use cli::{Commands, Opt};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let opt = Opt::parse();

    let res = match opt.command {
        Commands::GenerateCompletion { shell } => {
            generate_completion(shell);
            Ok(())
        }
        Commands::ListDestinations { no_frills } => list_destinations(no_frills),
        _ => run(opt).await,
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(opt: Opt) -> anyhow::Result<()> {
    let config = load_config(&opt).await?;
    let mut kit = Autokit::open(config).context("Failed to open tester")?;

    let res = tokio::select! {
        res = execute(&mut kit, opt.command) => res,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("Interrupted")),
    };

    // Leave the hardware in a safe state unless the command completed.
    if res.is_err() {
        kit.teardown().await;
    }

    res
}

async fn execute(kit: &mut Autokit, command: Commands) -> anyhow::Result<()> {
    kit.setup().await.context("Tester setup failed")?;

    match command {
        Commands::Flash {
            img,
            power_on,
            quiet,
        } => {
            flash(kit, &img, quiet).await?;
            if power_on {
                kit.power_on().await?;
            }
        }
        Commands::PowerOn => kit.power_on().await?,
        Commands::PowerOff => kit.power_off().await?,
        Commands::ReadPower => {
            let (volts, amps) = kit.read_power().await?;
            console::Term::stdout().write_line(&format!("{volts:.3} V  {amps:.3} A"))?;
        }
        Commands::ListDestinations { no_frills } => list_destinations(no_frills)?,
        Commands::GenerateCompletion { shell } => generate_completion(shell),
    }

    Ok(())
}

async fn load_config(opt: &Opt) -> anyhow::Result<AutokitConfig> {
    let mut config = match &opt.config {
        Some(p) => AutokitConfig::load(p).await?,
        None => AutokitConfig::default(),
    };

    if let Some(x) = &opt.device_type {
        config.device_type = x.clone();
    }
    if let Some(x) = opt.usb_port {
        config.usb_boot_port = Some(x);
    }

    config.validate()?;
    Ok(config)
}

async fn flash(kit: &Autokit, img: &Path, quiet: bool) -> anyhow::Result<()> {
    if quiet {
        return Ok(kit.flash(img, None).await?);
    }

    let (tx, rx) = futures::channel::mpsc::channel(20);
    let progress = tokio::task::spawn(show_progress(rx));

    let res = kit.flash(img, Some(tx)).await;
    progress.await??;

    res?;
    console::Term::stdout().write_line("Flashing successful")?;
    Ok(())
}

async fn show_progress(mut rx: futures::channel::mpsc::Receiver<Status>) -> anyhow::Result<()> {
    let term = console::Term::stdout();
    let bar_style =
        indicatif::ProgressStyle::with_template("{msg:15}  [{wide_bar}] [{percent:3} %]")?;
    let bars = indicatif::MultiProgress::new();

    let mut last_bar: Option<indicatif::ProgressBar> = None;
    let mut last_state = Status::Preparing;
    let mut stage = 1;

    term.write_line(&stage_msg(Status::Preparing, stage))?;

    while let Some(progress) = rx.next().await {
        if progress == last_state {
            continue;
        }

        let same_stage = matches!(
            (progress, last_state),
            (Status::Flashing(_), Status::Flashing(_)) | (Status::Verifying(_), Status::Verifying(_))
        );

        match progress {
            // Same stage, only the position moved
            Status::Flashing(p) | Status::Verifying(p) if same_stage => {
                if let Some(b) = &last_bar {
                    b.set_position((p * 100.0) as u64);
                }
            }
            Status::Flashing(p) | Status::Verifying(p) => {
                if let Some(b) = last_bar.take() {
                    b.finish();
                }

                stage += 1;

                let bar = bars.add(indicatif::ProgressBar::new(100));
                bar.set_style(bar_style.clone());
                bar.set_message(stage_msg(progress, stage));
                bar.set_position((p * 100.0) as u64);
                last_bar = Some(bar);
            }
            Status::Preparing => {
                if let Some(b) = last_bar.take() {
                    b.finish();
                }

                stage += 1;
                term.write_line(&stage_msg(progress, stage))?;
            }
        }

        last_state = progress;
    }

    if let Some(b) = last_bar.take() {
        b.finish();
    }

    Ok(())
}

const fn progress_msg(status: Status) -> &'static str {
    match status {
        Status::Preparing => "Preparing",
        Status::Flashing(_) => "Flashing",
        Status::Verifying(_) => "Verifying",
    }
}

fn stage_msg(status: Status, stage: usize) -> String {
    format!("[{stage}] {}", progress_msg(status))
}

fn list_destinations(no_frills: bool) -> anyhow::Result<()> {
    const NAME_HEADER: &str = "Drive";
    const PATH_HEADER: &str = "Path";
    const SIZE_HEADER: &str = "Size (in G)";
    const BYTES_IN_GB: u64 = 1024 * 1024 * 1024;

    let term = console::Term::stdout();
    let dsts: Vec<_> = autokit_drivelist::drive_list()?
        .into_iter()
        .filter(|x| !x.is_system)
        .collect();

    if no_frills {
        for d in dsts {
            term.write_line(&d.raw)?;
        }
        return Ok(());
    }

    let dsts_str: Vec<_> = dsts
        .into_iter()
        .map(|x| {
            (
                x.description.trim().to_string(),
                x.raw,
                (x.size / BYTES_IN_GB).to_string(),
            )
        })
        .collect();

    let width = |f: fn(&(String, String, String)) -> usize, header: &str| {
        dsts_str.iter().map(f).chain([header.len()]).max().unwrap_or_default()
    };
    let max_name_len = width(|x| x.0.len(), NAME_HEADER);
    let max_path_len = width(|x| x.1.len(), PATH_HEADER);
    let max_size_len = width(|x| x.2.len(), SIZE_HEADER);

    let table_border = format!(
        "+-{}-+-{}-+-{}-+",
        "-".repeat(max_name_len),
        "-".repeat(max_path_len),
        "-".repeat(max_size_len),
    );

    term.write_line(&table_border)?;
    term.write_line(&format!(
        "| {} | {} | {} |",
        console::pad_str(NAME_HEADER, max_name_len, console::Alignment::Left, None),
        console::pad_str(PATH_HEADER, max_path_len, console::Alignment::Left, None),
        console::pad_str(SIZE_HEADER, max_size_len, console::Alignment::Left, None),
    ))?;
    term.write_line(&table_border)?;

    for d in dsts_str {
        term.write_line(&format!(
            "| {} | {} | {} |",
            console::pad_str(&d.0, max_name_len, console::Alignment::Left, None),
            console::pad_str(&d.1, max_path_len, console::Alignment::Left, None),
            console::pad_str(&d.2, max_size_len, console::Alignment::Right, None)
        ))?;
    }

    term.write_line(&table_border)?;
    Ok(())
}

fn generate_completion(target: clap_complete::Shell) {
    let mut cmd = Opt::command();
    const BIN_NAME: &str = "autokit";

    clap_complete::generate(target, &mut cmd, BIN_NAME, &mut std::io::stdout())
}
