use std::path::PathBuf;

use clap::builder::RangedU64ValueParser;
use clap::{Parser, ValueEnum};

use crate::workflow::RunOptions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportType {
    Areas,
    Employees,
    #[default]
    Both,
}

impl ReportType {
    pub fn includes_areas(self) -> bool {
        matches!(self, ReportType::Areas | ReportType::Both)
    }

    pub fn includes_employees(self) -> bool {
        matches!(self, ReportType::Employees | ReportType::Both)
    }
}

/// Export Power BI paginated reports to PDF and publish them to SharePoint.
#[derive(Debug, Parser)]
#[command(name = "report-publisher", version, about)]
pub struct Cli {
    /// Path to the YAML settings file
    #[arg(long, default_value = "config/config.yaml")]
    pub config: PathBuf,

    /// Which reports to generate
    #[arg(long, value_enum, default_value_t = ReportType::Both)]
    pub report_type: ReportType,

    /// Query and export only; nothing is uploaded and no email is sent
    #[arg(long)]
    pub dry_run: bool,

    /// Skip share link generation for employee PDFs
    #[arg(long)]
    pub skip_links: bool,

    /// Concurrent exports, overriding both configured batch sizes
    #[arg(long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub batch_size: Option<usize>,

    /// Also write every generated PDF under this directory
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

impl Cli {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            report_type: self.report_type,
            dry_run: self.dry_run,
            skip_links: self.skip_links,
            batch_size: self.batch_size,
            output_dir: self.output_dir.clone(),
        }
    }
}
