use anyhow::{Result, anyhow, bail};
use std::fs;
use std::path::Path;

pub const REQUIRED_COLUMNS: [&str; 8] = [
    "campaign_name",
    "channel",
    "audience_segment",
    "date",
    "impressions",
    "clicks",
    "conversions",
    "spend",
];

/// The campaign table handed to every sandbox, kept as the raw CSV text.
///
/// Sandboxes parse their own copy, so nothing a fragment does can reach this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    name: String,
    csv_text: String,
    columns: Vec<String>,
    row_count: usize,
}

impl Dataset {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            anyhow!(
                "Failed to load dataset {}: unable to read file: {err}",
                path.display()
            )
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Self::from_csv_text(&name, &text)
            .map_err(|err| anyhow!("Failed to load dataset {}: {err}", path.display()))
    }

    pub fn from_csv_text(name: &str, csv_text: &str) -> Result<Self> {
        let csv_text = csv_text.trim_start_matches('\u{feff}');
        if csv_text.trim().is_empty() {
            bail!("dataset is empty");
        }

        let mut reader = csv::ReaderBuilder::new().from_reader(csv_text.as_bytes());
        let columns = reader
            .headers()
            .map_err(|err| anyhow!("unreadable header: {err}"))?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let missing = REQUIRED_COLUMNS
            .iter()
            .filter(|required| !columns.iter().any(|column| column == *required))
            .copied()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            bail!("missing required columns: {}", missing.join(", "));
        }

        let mut row_count = 0;
        for record in reader.records() {
            record.map_err(|err| anyhow!("malformed record {}: {err}", row_count + 1))?;
            row_count += 1;
        }

        Ok(Self {
            name: name.to_string(),
            csv_text: csv_text.to_string(),
            columns,
            row_count,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn csv_text(&self) -> &str {
        &self.csv_text
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }
}

#[cfg(test)]
mod tests {
    use super::Dataset;
    use std::fs;

    const HEADER: &str =
        "campaign_name,channel,audience_segment,date,impressions,clicks,conversions,spend";

    #[test]
    fn from_csv_text_counts_rows_and_columns() {
        let text = format!("{HEADER}\nA,Facebook,18-24,2024-01-01,1000,50,5,10\n\n");
        let dataset = Dataset::from_csv_text("campaigns.csv", &text).expect("dataset");
        assert_eq!(dataset.row_count(), 1);
        assert_eq!(dataset.columns().len(), 8);
        assert_eq!(dataset.name(), "campaigns.csv");
    }

    #[test]
    fn quoted_newlines_stay_inside_one_record() {
        let text = format!(
            "\u{feff}{HEADER}\n\"Spring\nLaunch\",Facebook,18-24,2024-01-01,1000,50,5,10\n"
        );
        let dataset = Dataset::from_csv_text("campaigns.csv", &text).expect("dataset");
        assert_eq!(dataset.row_count(), 1);
        assert_eq!(dataset.columns()[0], "campaign_name");
        assert!(dataset.csv_text().starts_with("campaign_name,"));
    }

    #[test]
    fn ragged_records_are_rejected() {
        let text = format!("{HEADER}\nA,Facebook,18-24\n");
        let err = Dataset::from_csv_text("ragged.csv", &text).expect_err("short record");
        assert!(err.to_string().contains("malformed record 1"));
    }

    #[test]
    fn from_csv_text_rejects_missing_columns() {
        let err = Dataset::from_csv_text("bad.csv", "campaign_name,channel\nA,Facebook\n")
            .expect_err("missing columns should fail");
        assert!(err.to_string().contains("missing required columns"));
        assert!(err.to_string().contains("impressions"));
    }

    #[test]
    fn from_csv_text_rejects_empty_input() {
        let err = Dataset::from_csv_text("empty.csv", "\n\n").expect_err("empty should fail");
        assert!(err.to_string().contains("dataset is empty"));
    }

    #[test]
    fn load_reports_path_on_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("campaigns.csv");
        fs::write(&path, "x,y\n1,2\n").expect("write csv");

        let err = Dataset::load(&path).expect_err("invalid dataset");
        assert!(err.to_string().contains("Failed to load dataset"));
        assert!(err.to_string().contains("campaigns.csv"));
    }
}
