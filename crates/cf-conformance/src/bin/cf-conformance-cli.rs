#![forbid(unsafe_code)]

use std::path::PathBuf;

use cf_conformance::{HarnessConfig, run_suite};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut fixture_root: Option<PathBuf> = None;
    let mut name_filter: Option<String> = None;
    let mut require_green = false;
    let mut json = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fixture-root" => {
                let value = args.next().ok_or("--fixture-root requires a directory")?;
                fixture_root = Some(PathBuf::from(value));
            }
            "--name" => {
                let value = args
                    .next()
                    .ok_or("--name requires a substring (e.g. sharded)")?;
                name_filter = Some(value);
            }
            "--require-green" => {
                require_green = true;
            }
            "--json" => {
                json = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match fixture_root {
        Some(root) => HarnessConfig::with_fixture_root(root),
        None => HarnessConfig::default_paths(),
    };
    let report = run_suite(&config, name_filter.as_deref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for fixture in &report.reports {
            let status = if fixture.passed { "ok" } else { "FAIL" };
            println!(
                "{status:<4} {name} func={func} rows={rows} groups={groups} \
                 strategy={strategy} shards={shards}",
                name = fixture.name,
                func = fixture.func,
                rows = fixture.rows,
                groups = fixture.groups,
                strategy = fixture.strategy,
                shards = fixture.shards,
            );
            for mismatch in &fixture.mismatches {
                println!("       {mismatch}");
            }
        }
        println!(
            "fixtures={} passed={} failed={}",
            report.fixture_count, report.passed, report.failed
        );
    }

    if require_green && !report.is_green() {
        return Err(format!("{} fixture(s) failed", report.failed).into());
    }
    Ok(())
}

fn print_help() {
    println!(
        "cf-conformance-cli [--fixture-root DIR] [--name SUBSTRING] [--require-green] [--json]\n\
         \n\
         Runs groupby fixtures against the brute-force oracle.\n\
         Log verbosity follows RUST_LOG (default: warn)."
    );
}
