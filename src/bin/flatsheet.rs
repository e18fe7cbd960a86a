//! flatsheet: Flatten schema-described JSON records into CSV tables
//!
//! Usage:
//!   # Release package, tables configured in a file
//!   flatsheet releases.json --schema release-schema.json --config tables.json -o ./out
//!
//!   # NDJSON stream, count columns, one child table left out
//!   flatsheet --format stream releases.jsonl --schema release-schema.json \
//!       --config tables.json --count --exclude tenders_items
//!
//!   # Also write result.xlsx, splitting only arrays of 5 or more elements
//!   flatsheet releases.json -s release-schema.json -c tables.json --xlsx --split-threshold 5

// Use MiMalloc allocator for better performance (recommended by simd-json)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use flatsheet::{read_records, CsvWriter, Flattener, InputFormat, PipelineConfig, Preprocessor, XlsxWriter};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    /// A single document with the records under --root-key
    Document,
    /// NDJSON or concatenated JSON records
    Stream,
}

#[derive(Parser, Debug)]
#[command(name = "flatsheet")]
#[command(about = "Flatten schema-described JSON records into CSV tables", long_about = None)]
struct Args {
    /// Input data file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// JSON Schema describing one record
    #[arg(long, short = 's')]
    schema: PathBuf,

    /// Pipeline configuration (tables to analyse and flatten options)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Output directory for the .csv files
    #[arg(long, short = 'o', default_value = ".")]
    output_dir: PathBuf,

    /// Layout of the input file
    #[arg(long, value_enum, default_value_t = Format::Document)]
    format: Format,

    /// Key holding the records in document input
    #[arg(long, default_value = "releases")]
    root_key: String,

    /// Emit <array>Count columns
    #[arg(long)]
    count: bool,

    /// Comma-separated tables to leave out
    #[arg(long)]
    exclude: Option<String>,

    /// Split child arrays only when analysis saw at least this many elements
    #[arg(long)]
    split_threshold: Option<usize>,

    /// Also write every table into <output-dir>/result.xlsx
    #[arg(long)]
    xlsx: bool,
}

impl Args {
    fn input_format(&self) -> InputFormat {
        match self.format {
            Format::Document => InputFormat::Document {
                root_key: self.root_key.clone(),
            },
            Format::Stream => InputFormat::Stream,
        }
    }

    fn records(&self) -> Result<impl Iterator<Item = Value>> {
        let file = File::open(&self.input)
            .with_context(|| format!("Failed to open input: {}", self.input.display()))?;
        let records = read_records(BufReader::new(file), self.input_format())?;
        Ok(records.map_while(|record| match record {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "stopping at unreadable record");
                None
            }
        }))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if args.count {
        config.flatten.count = true;
    }
    if let Some(threshold) = args.split_threshold {
        config.flatten.split_threshold = threshold;
    }
    if let Some(exclude) = &args.exclude {
        config.flatten.exclude.extend(
            exclude
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
        );
    }
    if config.analysis.root_tables.is_empty() && config.analysis.combined_tables.is_empty() {
        warn!("no tables configured, nothing to flatten");
    }

    let schema: Value = {
        let file = File::open(&args.schema)
            .with_context(|| format!("Failed to open schema: {}", args.schema.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse schema: {}", args.schema.display()))?
    };

    // Analysis pass
    let mut preprocessor = Preprocessor::new(&schema, &config.analysis)?;
    let analysed = preprocessor.process_items(args.records()?)?;
    let registry = preprocessor.into_tables();
    info!(records = analysed, tables = registry.len(), "analysis finished");

    if config.flatten.selection.is_empty() {
        for name in config
            .analysis
            .root_tables
            .keys()
            .chain(config.analysis.combined_tables.keys())
        {
            config.flatten.selection.insert(name.clone(), Default::default());
        }
    }

    // Flatten pass
    let flattener = Flattener::new(config.flatten, &registry)?;
    let mut writer = CsvWriter::create_in(&args.output_dir, &flattener)?;
    let mut workbook = args.xlsx.then(|| XlsxWriter::for_flattener(&flattener));
    let mut flattened = 0;
    for (_, tables) in flattener.flatten(args.records()?) {
        writer.write(&tables);
        if let Some(workbook) = workbook.as_mut() {
            workbook.write(&tables);
        }
        flattened += 1;
    }
    writer.flush()?;

    let mut warnings = writer.warnings();
    if let Some(mut workbook) = workbook {
        let path = args.output_dir.join("result.xlsx");
        workbook.save(&path)?;
        warnings += workbook.warnings();
        info!(rows = workbook.rows(), path = %path.display(), "workbook written");
    }

    info!(
        records = flattened,
        rows = writer.rows(),
        warnings,
        output = %args.output_dir.display(),
        "flatten finished"
    );
    Ok(())
}
