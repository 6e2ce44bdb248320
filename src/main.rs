//! Bulk STARTTLS auditing CLI.
//!
//! Checks a single mail domain or sweeps a CSV of them, emitting per-domain
//! JSON or aggregated MTA-STS statistics.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use starttls_audit::checker::{AggregatedScan, Checker, DomainTotals, ResultHandler};
use starttls_audit::config::{LogFormat, LogLevel};
use starttls_audit::initialization::{
    init_crypto_provider, init_http_client, init_logger_with, init_policy_client, init_resolver,
};

/// Run STARTTLS and MTA-STS checks against mail domains.
#[derive(Parser, Debug)]
#[command(name = "starttls-audit", version, about)]
struct Opt {
    /// Domain to check
    #[arg(long)]
    domain: Option<String>,

    /// File path to a CSV of domains to check
    #[arg(long)]
    file: Option<PathBuf>,

    /// URL of a CSV of domains to check
    #[arg(long)]
    url: Option<String>,

    /// Emit aggregated MTA-STS statistics instead of per-domain JSON
    #[arg(long)]
    aggregate: bool,

    /// 0-based index of the CSV column holding the domain
    #[arg(long, default_value_t = 0)]
    column: usize,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Log format
    #[arg(long, value_enum, default_value = "plain")]
    log_format: LogFormat,
}

/// Prints each result as one JSON object per line.
struct DomainWriter;

impl ResultHandler for DomainWriter {
    fn handle_domain(&mut self, result: starttls_audit::DomainResult) {
        match serde_json::to_string(&result) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("could not serialize result for {}: {e}", result.domain);
                std::process::exit(1);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    init_logger_with(opt.log_level.clone().into(), opt.log_format.clone())
        .context("Failed to initialize logger")?;
    init_crypto_provider();

    if opt.domain.is_none() && opt.file.is_none() && opt.url.is_none() {
        anyhow::bail!("one of --domain, --file, or --url is required");
    }

    let resolver = init_resolver();
    let policy_client = init_policy_client().context("Failed to initialize HTTP client")?;
    let checker = Checker::new(resolver, policy_client);

    // Single domain: check it, print it, done.
    if let Some(domain) = &opt.domain {
        let result = checker.check_domain(domain, None).await;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let (input, label): (Box<dyn std::io::Read + Send>, String) = if let Some(path) = &opt.file {
        let file = std::fs::File::open(path)
            .with_context(|| format!("could not open {}", path.display()))?;
        (
            Box::new(std::io::BufReader::new(file)),
            path.display().to_string(),
        )
    } else {
        let url = opt.url.as_deref().context("no input source")?;
        let client = init_http_client().context("Failed to initialize HTTP client")?;
        let body = client
            .get(url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("could not fetch {url}"))?
            .bytes()
            .await
            .context("could not read CSV body")?;
        (Box::new(std::io::Cursor::new(body.to_vec())), url.to_string())
    };

    let reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    if opt.aggregate {
        let mut totals = DomainTotals::new(&label);
        checker.check_csv(reader, &mut totals, opt.column).await;
        info!(
            "{}: {} domains scanned, {} reachable",
            totals.source, totals.attempted, totals.with_mxs
        );
        println!("{}", serde_json::to_string_pretty(&AggregatedScan::from(&totals))?);
    } else {
        let mut writer = DomainWriter;
        checker.check_csv(reader, &mut writer, opt.column).await;
    }

    Ok(())
}
