use std::path::PathBuf;

use anyhow::Context;
use diskcaddy_core::capture_local_offset;
use diskcaddyd::daemon::{DaemonConfig, DaemonRuntime};
use diskcaddyd::logging::init_logging;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Mount(Vec<PathBuf>),
    Export {
        out: PathBuf,
        inputs: Vec<PathBuf>,
        optimize: bool,
    },
    ExportSession(PathBuf),
    DownloadModified(PathBuf),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(first) = args.next() else {
        return Ok(CliMode::Run);
    };
    match first.as_str() {
        "--help" | "-h" => Ok(CliMode::Help),
        "--mount" => {
            let inputs: Vec<PathBuf> = args.map(PathBuf::from).collect();
            if inputs.is_empty() {
                anyhow::bail!("--mount needs at least one path");
            }
            Ok(CliMode::Mount(inputs))
        }
        "--export" => {
            let mut optimize = false;
            let mut positional = Vec::new();
            for arg in args {
                match arg.as_str() {
                    "--optimize" => optimize = true,
                    other if other.starts_with("--") => {
                        anyhow::bail!("unknown argument: {other}")
                    }
                    other => positional.push(PathBuf::from(other)),
                }
            }
            if positional.len() < 2 {
                anyhow::bail!("--export needs an output and at least one input");
            }
            let out = positional.remove(0);
            Ok(CliMode::Export {
                out,
                inputs: positional,
                optimize,
            })
        }
        "--export-session" => Ok(CliMode::ExportSession(single_path(args, "--export-session")?)),
        "--download-modified" => {
            let out = single_path(args, "--download-modified")?;
            Ok(CliMode::DownloadModified(out))
        }
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

fn single_path<I>(mut args: I, flag: &str) -> anyhow::Result<PathBuf>
where
    I: Iterator<Item = String>,
{
    let out = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("{flag} needs an output path"))?;
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(PathBuf::from(out))
}

fn print_usage() {
    println!("Usage: diskcaddyd [MODE]");
    println!("  (no mode)                          Watch the device and log its status");
    println!("  --mount PATH...                    Send disk images to the device");
    println!("  --export OUT PATH... [--optimize]  Write the queue archive to OUT");
    println!("  --export-session OUT               Save the device's active set to OUT");
    println!("  --download-modified DIR            Save disks the device changed into DIR");
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }

    // Must run before the runtime starts its worker threads.
    capture_local_offset();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?
        .block_on(run(mode))
}

async fn run(mode: CliMode) -> anyhow::Result<()> {
    let config = DaemonConfig::from_env()?;
    init_logging(config.log_verbosity)?;
    let runtime = DaemonRuntime::bootstrap(config)?;

    match mode {
        CliMode::Run => runtime.run().await,
        CliMode::Mount(inputs) => {
            let items = runtime.mount(&inputs).await?;
            info!(items, "disk images mounted");
            Ok(())
        }
        CliMode::Export {
            out,
            inputs,
            optimize,
        } => {
            let written = runtime.export_queue(&out, &inputs, optimize).await?;
            println!("{}", written.display());
            Ok(())
        }
        CliMode::ExportSession(out) => {
            match runtime.export_session(&out).await? {
                Some(written) => println!("{}", written.display()),
                None => info!("device has no active disks"),
            }
            Ok(())
        }
        CliMode::DownloadModified(out) => {
            let written = runtime.download_modified(&out).await?;
            for path in &written {
                println!("{}", path.display());
            }
            info!(disks = written.len(), "modified disks downloaded");
            Ok(())
        }
        CliMode::Help => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        std::iter::once("diskcaddyd")
            .chain(values.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_collects_mount_inputs() {
        assert_eq!(
            parse_cli_mode(args(&["--mount", "a.d64", "disks"])).unwrap(),
            CliMode::Mount(vec![PathBuf::from("a.d64"), PathBuf::from("disks")])
        );
        assert!(parse_cli_mode(args(&["--mount"])).is_err());
    }

    #[test]
    fn parse_cli_mode_reads_export_flags_anywhere() {
        assert_eq!(
            parse_cli_mode(args(&["--export", "out.zip", "--optimize", "a.d64"])).unwrap(),
            CliMode::Export {
                out: PathBuf::from("out.zip"),
                inputs: vec![PathBuf::from("a.d64")],
                optimize: true,
            }
        );
        assert!(parse_cli_mode(args(&["--export", "out.zip"])).is_err());
        assert!(parse_cli_mode(args(&["--export", "out.zip", "a.d64", "--fast"])).is_err());
    }

    #[test]
    fn parse_cli_mode_takes_one_session_output() {
        assert_eq!(
            parse_cli_mode(args(&["--export-session", "backup"])).unwrap(),
            CliMode::ExportSession(PathBuf::from("backup"))
        );
        assert!(parse_cli_mode(args(&["--export-session"])).is_err());
        assert!(parse_cli_mode(args(&["--export-session", "a", "b"])).is_err());
    }

    #[test]
    fn parse_cli_mode_takes_one_download_directory() {
        assert_eq!(
            parse_cli_mode(args(&["--download-modified", "saves"])).unwrap(),
            CliMode::DownloadModified(PathBuf::from("saves"))
        );
        assert!(parse_cli_mode(args(&["--download-modified"])).is_err());
        assert!(parse_cli_mode(args(&["--download-modified", "a", "b"])).is_err());
    }

    #[test]
    fn parse_cli_mode_rejects_unknown() {
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
    }
}
