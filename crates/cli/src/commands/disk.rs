//! Exchange disk commands

use anyhow::{bail, Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;
use telemetry_lib::exchange::{ExchangeError, MetricsExchangeDisk, DISK_SIZE, MAX_PAYLOAD};
use telemetry_lib::report::describe;

use crate::output::{color_state, format_bytes, print_success, print_warning, OutputFormat};

/// Row for the metrics table
#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Context")]
    context: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    metric_type: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Unit")]
    unit: String,
    #[tabled(rename = "Description")]
    description: String,
}

#[derive(Debug, Serialize)]
struct HeaderReport {
    path: String,
    signature: String,
    flag: i32,
    checksum: i32,
    length: i32,
    state: String,
}

/// Create an empty exchange disk
pub fn create(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    MetricsExchangeDisk::new(path)
        .create()
        .with_context(|| format!("Failed to create exchange disk {}", path.display()))?;

    print_success(&format!(
        "Created exchange disk {} ({})",
        path.display(),
        format_bytes(DISK_SIZE as u64)
    ));
    Ok(())
}

/// Show the header and whether the payload is currently readable
pub fn show_header(path: &Path, format: OutputFormat) -> Result<()> {
    let disk = MetricsExchangeDisk::new(path);
    let header = disk
        .read_header()
        .with_context(|| format!("Failed to read header of {}", path.display()))?;

    let state = match disk.read_payload() {
        Ok(_) => "valid".to_string(),
        Err(ExchangeError::WriteInProgress(_)) => "write in progress".to_string(),
        Err(e) => e.to_string(),
    };

    let report = HeaderReport {
        path: path.display().to_string(),
        signature: String::from_utf8_lossy(&header.signature).into_owned(),
        flag: header.flag,
        checksum: header.checksum,
        length: header.length,
        state,
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            println!("{}", "Exchange Disk Header".bold());
            println!("{}", "=".repeat(50));
            println!("Path:       {}", report.path.cyan());
            println!("Signature:  {}", report.signature);
            println!("Flag:       {}", report.flag);
            println!("Checksum:   {}", report.checksum);
            println!(
                "Length:     {} of {}",
                format_bytes(report.length.max(0) as u64),
                format_bytes(MAX_PAYLOAD as u64)
            );
            println!("State:      {}", color_state(&report.state));
        }
        OutputFormat::Xml => bail!("XML output is only available for dump"),
    }

    Ok(())
}

/// Print the published metrics document
pub fn dump(path: &Path, format: OutputFormat) -> Result<()> {
    let disk = MetricsExchangeDisk::new(path);

    match format {
        OutputFormat::Xml => {
            let payload = disk
                .read_payload()
                .with_context(|| format!("Failed to read {}", path.display()))?;
            print!("{}", String::from_utf8_lossy(&payload));
        }
        OutputFormat::Json => {
            let doc = read_document(&disk)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Table => {
            let doc = read_document(&disk)?;
            if doc.is_empty() {
                print_warning("No metrics published");
                return Ok(());
            }

            let rows: Vec<MetricRow> = doc
                .iter()
                .map(|m| MetricRow {
                    context: m.context.to_string(),
                    name: m.name.clone(),
                    metric_type: m.metric_type.to_string(),
                    value: m.value.clone(),
                    unit: m.unit.clone().unwrap_or_default(),
                    description: describe(&m.name, m.context).unwrap_or("-").to_string(),
                })
                .collect();

            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);
            println!("\nTotal: {} metrics", doc.len());
        }
    }

    Ok(())
}

fn read_document(disk: &MetricsExchangeDisk) -> Result<telemetry_lib::MetricsDocument> {
    disk.read().map_err(|e| match e {
        ExchangeError::WriteInProgress(_) => {
            anyhow::anyhow!("{}: write in progress, retry shortly", disk.path().display())
        }
        other => anyhow::Error::new(other)
            .context(format!("Failed to read {}", disk.path().display())),
    })
}
