use anyhow::{Context, Result, ensure};
use std::fs;
use std::path::Path;

use crate::data::LabeledCorpus;

/// Column appended to the input table
pub const PREDICTION_COLUMN: &str = "predictions";

/// Write the input table with a trailing `predictions` column
pub fn write_predictions<P: AsRef<Path>>(corpus: &LabeledCorpus, predictions: &[u8], path: P) -> Result<()> {
    let path = path.as_ref();
    ensure!(
        corpus.len() == predictions.len(),
        "{} rows but {} predictions",
        corpus.len(),
        predictions.len()
    );
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut header: Vec<&str> = corpus.headers().iter().map(String::as_str).collect();
    header.push(PREDICTION_COLUMN);
    writer.write_record(&header)?;

    for (row, prediction) in corpus.rows().iter().zip(predictions) {
        let mut record: Vec<String> = row.clone();
        record.push(prediction.to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;

    log::info!("Wrote {} predictions to {}", predictions.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictions_column_is_appended() {
        let corpus = LabeledCorpus::from_reader("input,labels\n\"good, really\",1\nbad,0\n".as_bytes()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        write_predictions(&corpus, &[1, 1], &path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "input,labels,predictions\n\"good, really\",1,1\nbad,0,1\n");
    }

    #[test]
    fn test_length_mismatch() {
        let corpus = LabeledCorpus::from_reader("input\na\n".as_bytes()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(write_predictions(&corpus, &[], dir.path().join("r.csv")).is_err());
    }
}
