use std::collections::HashMap;
use std::io::Write;

use chrono::Local;

use crate::aggregator::{FlowRate, Snapshot};
use crate::config::OutputFormat;
use crate::error::Result;
use crate::labeler::{AddressLabel, AddressLabeler};
use crate::models::domain::{Address, Mode};
use crate::models::dto::{FlowRateDTO, SnapshotDTO};

pub const HEADER: &str = "--- Traffic Breakdown (last 1s) ---";
pub const NO_TRAFFIC: &str = "No traffic detected.";

/// Writes snapshots to the observer stream.
///
/// Text output keeps the line format existing consumers parse; JSON output
/// writes one object per snapshot.
pub struct Reporter<W: Write> {
    out: W,
    labeler: AddressLabeler,
    format: OutputFormat,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, labeler: AddressLabeler, format: OutputFormat) -> Self {
        Reporter {
            out,
            labeler,
            format,
        }
    }

    pub fn banner(&mut self, interface: &str, mode: Mode) -> Result<()> {
        if self.format != OutputFormat::Text {
            return Ok(());
        }
        match mode {
            Mode::Tumbling => {
                writeln!(self.out, "Monitoring traffic on interface: {}", interface)?;
                writeln!(self.out, "Press CTRL+C to stop.\n")?;
            }
            Mode::Sliding => {
                writeln!(self.out, "Starting detailed bandwidth monitor on {}", interface)?;
                writeln!(self.out, "Press Ctrl-C to stop.\n")?;
            }
        }
        self.out.flush()?;
        Ok(())
    }

    pub fn report(&mut self, snapshot: &Snapshot) -> Result<()> {
        match self.format {
            OutputFormat::Text => {
                let lines = self.render_lines(snapshot);
                writeln!(self.out, "\n{}", HEADER)?;
                for line in lines {
                    writeln!(self.out, "{}", line)?;
                }
            }
            OutputFormat::Json => {
                let dto = self.to_dto(snapshot);
                serde_json::to_writer(&mut self.out, &dto)?;
                writeln!(self.out)?;
            }
        }
        self.out.flush()?;
        Ok(())
    }

    /// The breakdown lines for one snapshot, header excluded.
    pub fn render_lines(&self, snapshot: &Snapshot) -> Vec<String> {
        if snapshot.is_empty() {
            return vec![NO_TRAFFIC.to_string()];
        }

        let rates = snapshot.rates();
        if snapshot.mode == Mode::Sliding {
            return rates
                .iter()
                .map(|rate| format!("{}: {:.2} Kbps", rate.key, rate.kbps))
                .collect();
        }

        let labels = self.labels_for(&rates);
        rates
            .iter()
            .map(|rate| {
                format!(
                    "{} ({}) → {} ({}) ({}): {:.2} Kbps",
                    rate.key.source,
                    label_of(&labels, &rate.key.source),
                    rate.key.destination,
                    label_of(&labels, &rate.key.destination),
                    rate.key.protocol,
                    rate.kbps
                )
            })
            .collect()
    }

    pub fn to_dto(&self, snapshot: &Snapshot) -> SnapshotDTO {
        let rates = snapshot.rates();
        let labelled = snapshot.mode == Mode::Tumbling;
        let labels = if labelled {
            self.labels_for(&rates)
        } else {
            HashMap::new()
        };
        let flows = rates
            .iter()
            .map(|rate| FlowRateDTO {
                source: rate.key.source.to_string(),
                source_label: labelled.then(|| label_of(&labels, &rate.key.source).to_string()),
                destination: rate.key.destination.to_string(),
                destination_label: labelled
                    .then(|| label_of(&labels, &rate.key.destination).to_string()),
                protocol: rate.key.protocol.clone(),
                bytes: rate.bytes,
                kbps: rate.kbps,
            })
            .collect();

        SnapshotDTO {
            timestamp: Local::now().to_rfc3339(),
            mode: snapshot.mode,
            window_secs: snapshot.window.as_secs_f64(),
            flows,
            skipped: snapshot.skipped,
            truncated: snapshot.truncated,
        }
    }

    // One batch per report: each address is looked up once and all lookups
    // share a single DNS deadline. Nothing survives the report.
    fn labels_for(&self, rates: &[FlowRate<'_>]) -> HashMap<Address, AddressLabel> {
        self.labeler.label_all(
            rates
                .iter()
                .flat_map(|rate| [&rate.key.source, &rate.key.destination]),
        )
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

static UNRESOLVED: AddressLabel = AddressLabel::Unresolved;

fn label_of<'a>(labels: &'a HashMap<Address, AddressLabel>, addr: &Address) -> &'a AddressLabel {
    labels.get(addr).unwrap_or(&UNRESOLVED)
}
