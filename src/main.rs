use std::env;
use std::error::Error;
use std::io::{self, Write};
use std::path;
use std::process::ExitCode;

use log::error;

use mztopp::identification::QuantifiedRecord;
use mztopp::io::{write_tabular, IdXMLReader};
use mztopp::pipeline::{Pipeline, PipelineSettings};
use mztopp::tool::{CancellationToken, LogProgress, ProcessRunner};

const USAGE: &str = "usage: mztopp run <settings.json>\n       mztopp idxml <file.idXML>";

fn run_pipeline(settings_path: &path::Path) -> Result<(), Box<dyn Error>> {
    let settings = PipelineSettings::from_json_path(settings_path)?;
    let pipeline = Pipeline::new(settings)?;
    let report = pipeline.run(&ProcessRunner::default(), &LogProgress, &CancellationToken::new())?;
    println!(
        "Completed {} stages ({} tool runs) in {:0.1} seconds",
        report.stages.len(),
        report.completed_steps,
        (report.finished - report.started).num_milliseconds() as f64 / 1000.0
    );
    if let Some(ids) = report.artifacts.indexed_identifications.as_ref() {
        let n = IdXMLReader::open_path(ids, 0)?.read_all()?.len();
        println!("Identifications: {} ({n} peptide hits)", ids.display());
    }
    if let Some(quant) = report.artifacts.quantification.as_ref() {
        println!("Quantification: {}", quant.display());
    }
    Ok(())
}

fn dump_identifications(path: &path::Path) -> Result<(), Box<dyn Error>> {
    let records: Vec<QuantifiedRecord> = IdXMLReader::open_path(path, 0)?
        .map(|rec| {
            rec.map(|record| QuantifiedRecord {
                record,
                channels: Vec::new(),
            })
        })
        .collect::<Result<_, _>>()?;
    let stdout = io::stdout();
    let mut handle = io::BufWriter::new(stdout.lock());
    write_tabular(&mut handle, &records)?;
    handle.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let result = match (args.get(1).map(String::as_str), args.get(2)) {
        (Some("run"), Some(settings)) => run_pipeline(path::Path::new(settings)),
        (Some("idxml"), Some(file)) => dump_identifications(path::Path::new(file)),
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("mztopp: {e}");
            ExitCode::FAILURE
        }
    }
}
