//! defo: calculate deformation at a time and place using a deformation
//! model, either for single points or streaming a CSV of points.

use anyhow::{bail, Context, Result};
use clap::Parser;
use deformation::prelude::*;
use std::io::Write;

#[derive(Parser, Debug)]
#[command(name = "defo", about = "Evaluate a crustal deformation model")]
struct Cli {
    /// Directory in which the deformation model is defined
    #[arg(short = 'm', long = "model-dir")]
    model_dir: std::path::PathBuf,

    /// Date at which to calculate the deformation (default now), or
    /// ":column" to read the date from the input file
    #[arg(short = 'd', long = "date")]
    date: Option<String>,

    /// Base date: calculate the difference in deformation since this date
    #[arg(short = 'b', long = "base-date")]
    base_date: Option<String>,

    /// Version of the model to calculate (default latest)
    #[arg(long = "version")]
    version: Option<String>,

    /// Calculate change relative to this base version
    #[arg(long = "base-version")]
    base_version: Option<String>,

    /// Apply the deformation to update the coordinates
    #[arg(short = 'a', long = "apply")]
    apply: bool,

    /// Subtract the deformation when updating the coordinates
    #[arg(short = 's', long = "subtract")]
    subtract: bool,

    /// Column names of longitude, latitude and (optional) height
    #[arg(short = 'c', long = "columns", default_value = "lon:lat:hgt")]
    columns: String,

    /// Displacement components to calculate, of de:dn:du:eh:ev
    #[arg(short = 'e', long = "elements", default_value = "de:dn:du")]
    elements: String,

    /// Evaluate at a single longitude/latitude instead of streaming files
    #[arg(
        short = 'x',
        long = "atpoint",
        num_args = 2,
        value_names = ["LON", "LAT"],
        allow_negative_numbers = true
    )]
    atpoint: Option<Vec<f64>>,

    /// Only calculate for the given submodels (e.g. "ndm+c1_20100904")
    #[arg(short = 'o', long = "only")]
    only: Option<String>,

    /// Number of decimal places for displacement values
    #[arg(short = 'n', long = "ndp", default_value_t = 4)]
    ndp: usize,

    /// List the model catalog and exit
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Check that the model is correctly formatted - no calculations
    #[arg(short = 'k', long = "check")]
    check: bool,

    /// Cache handling: use, ignore, clear (rebuild), or reset (delete)
    #[arg(long = "cache", default_value = "use")]
    cache: String,

    /// Input CSV file of points
    input: Option<std::path::PathBuf>,

    /// Output CSV file
    output: Option<std::path::PathBuf>,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,
}

fn parse_date(text: &str) -> Result<Time> {
    Time::parse_required(text).with_context(|| format!("Invalid date {text}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbosity.log_level_filter())
        .init();

    let (use_cache, clear_cache) = match cli.cache.as_str() {
        "use" => (true, false),
        "ignore" => (false, false),
        "clear" | "reset" => (true, true),
        other => bail!("Invalid cache option {other} - must be use, ignore, clear or reset"),
    };

    let mut options = ModelOptions::new();
    options.version = cli.version.as_deref();
    options.base_version = cli.base_version.as_deref();
    options.submodels = cli.only.as_deref();
    options.load_all = cli.check;
    options.use_cache = use_cache;
    options.clear_cache = clear_cache;

    let mut model = Model::open_with(&cli.model_dir, &options)
        .with_context(|| format!("Failed to load deformation model from {}", cli.model_dir.display()))?;

    if cli.list {
        print!("{}", model.description(true, true));
        return Ok(());
    }
    if cli.check {
        println!(
            "Deformation model {} version {} loaded successfully",
            model.name(),
            model.version()
        );
        return Ok(());
    }

    let update = cli.apply || cli.subtract;
    let base_date = cli.base_date.as_deref().map(parse_date).transpose()?;

    let elements = parse_elements(&cli.elements)?;

    // Single point mode
    if let Some(point) = &cli.atpoint {
        let date = match cli.date.as_deref() {
            Some(d) if d.starts_with(':') => bail!("A date column needs an input file"),
            Some(d) => Some(parse_date(d)?),
            None => None,
        };
        let (lon, lat) = (point[0], point[1]);
        if update {
            let coord = model.apply_to(lon, lat, 0.0, date, base_date, cli.subtract)?;
            println!("{:.9} {:.9} {:.4}", coord[0], coord[1], coord[2]);
        } else {
            let value = model.calc_deformation(lon, lat, date, base_date)?;
            let parts: Vec<String> = elements
                .iter()
                .map(|&e| format!("{:.*}", cli.ndp, value[e]))
                .collect();
            println!("{}", parts.join(" "));
        }
        return Ok(());
    }

    // Streaming mode
    let (Some(input), Some(output)) = (&cli.input, &cli.output) else {
        bail!("Input and output files are required unless using --atpoint, --list or --check");
    };
    stream_points(&mut model, &cli, input, output, base_date, &elements)
}

fn parse_elements(spec: &str) -> Result<Vec<usize>> {
    const FIELDS: [&str; 5] = ["de", "dn", "du", "eh", "ev"];
    let mut elements = Vec::new();
    for name in spec.to_lowercase().split(':') {
        match FIELDS.iter().position(|f| *f == name) {
            Some(i) => elements.push(i),
            None => bail!("Invalid calculated value {name} requested, must be one of de dn du eh ev"),
        }
    }
    Ok(elements)
}

fn stream_points(
    model: &mut Model,
    cli: &Cli,
    input: &std::path::Path,
    output: &std::path::Path,
    base_date: Option<Time>,
    elements: &[usize],
) -> Result<()> {
    let names: Vec<&str> = cli.columns.split(':').collect();
    if names.len() < 2 || names.len() > 3 {
        bail!("Invalid columns specified - must be 2 or 3 colon separated column names");
    }

    let (date, date_column) = match cli.date.as_deref() {
        Some(d) if d.starts_with(':') => (None, Some(d[1..].to_string())),
        Some(d) => (Some(parse_date(d)?), None),
        None => (Some(Time::now()), None),
    };

    let mut reader = csv::Reader::from_path(input)
        .with_context(|| format!("Cannot open input file {}", input.display()))?;
    let headers = reader.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h.trim() == name);

    let lon_col = position(names[0])
        .with_context(|| format!("Column {} missing from {}", names[0], input.display()))?;
    let lat_col = position(names[1])
        .with_context(|| format!("Column {} missing from {}", names[1], input.display()))?;
    let hgt_col = names.get(2).and_then(|n| position(*n));
    let date_col = match &date_column {
        Some(name) => Some(
            position(name.as_str())
                .with_context(|| format!("Date column {name} missing from {}", input.display()))?,
        ),
        None => None,
    };

    let mut writer = std::io::BufWriter::new(
        std::fs::File::create(output)
            .with_context(|| format!("Cannot open output file {}", output.display()))?,
    );
    let mut out = csv::Writer::from_writer(&mut writer);

    let update = cli.apply || cli.subtract;
    let mut header_row: Vec<String> = headers.iter().map(str::to_string).collect();
    if !update {
        const FIELDS: [&str; 5] = ["de", "dn", "du", "eh", "ev"];
        header_row.extend(elements.iter().map(|&e| FIELDS[e].to_string()));
    }
    out.write_record(&header_row)?;

    for (recno, row) in reader.records().enumerate() {
        let row = row?;
        let field = |i: usize| row.get(i).unwrap_or("").trim().to_string();
        let lon: f64 = field(lon_col)
            .parse()
            .with_context(|| format!("Bad longitude in record {}", recno + 1))?;
        let lat: f64 = field(lat_col)
            .parse()
            .with_context(|| format!("Bad latitude in record {}", recno + 1))?;
        let hgt: f64 = match hgt_col {
            Some(i) => field(i).parse().unwrap_or(0.0),
            None => 0.0,
        };
        let date = match date_col {
            Some(i) => Some(parse_date(&field(i))?),
            None => date,
        };

        let mut cells: Vec<String> = row.iter().map(str::to_string).collect();
        if update {
            let coord = model.apply_to(lon, lat, hgt, date, base_date, cli.subtract)?;
            cells[lon_col] = format!("{:.9}", coord[0]);
            cells[lat_col] = format!("{:.9}", coord[1]);
            if let Some(i) = hgt_col {
                cells[i] = format!("{:.4}", coord[2]);
            }
        } else {
            let value = model.calc_deformation(lon, lat, date, base_date)?;
            cells.extend(elements.iter().map(|&e| format!("{:.*}", cli.ndp, value[e])));
        }
        out.write_record(&cells)?;
    }
    out.flush()?;
    drop(out);
    writer.flush()?;
    Ok(())
}
