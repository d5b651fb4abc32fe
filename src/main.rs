use args::Args;
use getopts::Occur;
use glob::glob;
use leak_analyzer::LeakReport;
use num_format::{Locale, ToFormattedString};

const PROGRAM_DESC: &str = "Print leak reports saved by leak_analyzer";
const PROGRAM_NAME: &str = "la_print";

fn main() -> Result<(), anyhow::Error> {
    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "d",
        "dir",
        "Directory that stores saved reports",
        "DIR",
        Occur::Req,
        None,
    );

    args.parse_from_cli()?;

    let dir: String = args.value_of("dir")?;
    let wildcard = format!("{}/leak_analyzer.*.yaml", dir);

    let mut reports = vec![];

    for path in glob(wildcard.as_str())? {
        let path = path?;
        eprintln!("found report in {}", path.display());
        reports.push(LeakReport::load(&path)?);
    }

    let mut leaks = 0;
    let mut bytes = 0;

    for report in reports.iter() {
        eprintln!("Process {}:\n{}", report.pid, report);
        leaks += report.leaks.len();
        bytes += report.total_bytes();
    }

    eprintln!(
        "{} reports, {} leaks, {} bytes total",
        reports.len(),
        leaks.to_formatted_string(&Locale::en),
        bytes.to_formatted_string(&Locale::en)
    );

    Ok(())
}
