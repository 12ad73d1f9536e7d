use anyhow::{Context, Result, anyhow};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::SentimentError;

/// Column holding the review text
pub const TEXT_COLUMN: &str = "input";

/// Column holding the 0/1 sentiment label
pub const LABEL_COLUMN: &str = "labels";

/// A CSV table of reviews, kept row-for-row so results can echo every input column
#[derive(Debug, Clone)]
pub struct LabeledCorpus {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    text_col: usize,
    label_col: Option<usize>,
}

/// Open `path`, transparently decompressing `.gz` files
pub fn open_maybe_gzip<P: AsRef<Path>>(path: P) -> Result<Box<dyn Read>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(MultiGzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

impl LabeledCorpus {
    /// Read a `.csv` or `.csv.gz` file with a header row
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_maybe_gzip(path)?;
        let corpus = Self::from_reader(reader)
            .with_context(|| format!("Failed to parse CSV {}", path.display()))?;
        log::info!(
            "Read {} rows from {} (labels: {})",
            corpus.len(),
            path.display(),
            if corpus.has_labels() { "yes" } else { "no" }
        );
        Ok(corpus)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();

        let text_col = headers
            .iter()
            .position(|h| h == TEXT_COLUMN)
            .ok_or_else(|| SentimentError::Data(format!("missing `{}` column", TEXT_COLUMN)))?;
        let label_col = headers.iter().position(|h| h == LABEL_COLUMN);

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self {
            headers,
            rows,
            text_col,
            label_col,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn has_labels(&self) -> bool {
        self.label_col.is_some()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r[self.text_col].as_str()).collect()
    }

    /// Parsed labels, or `None` when the file has no label column
    pub fn labels(&self) -> Result<Option<Vec<u8>>> {
        let Some(col) = self.label_col else {
            return Ok(None);
        };
        self.rows
            .iter()
            .enumerate()
            .map(|(i, r)| parse_label(&r[col]).ok_or_else(|| anyhow!("row {}: invalid label {:?}", i + 1, r[col])))
            .collect::<Result<Vec<u8>>>()
            .map(Some)
    }

    /// Labels that must be present, as required for training
    pub fn require_labels(&self) -> Result<Vec<u8>> {
        self.labels()?
            .ok_or_else(|| SentimentError::Data(format!("missing `{}` column", LABEL_COLUMN)).into())
    }
}

fn parse_label(raw: &str) -> Option<u8> {
    match raw.trim() {
        "0" | "0.0" => Some(0),
        "1" | "1.0" => Some(1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const CSV: &str = "id,input,labels\n1,\"Loved it, works great\",1\n2,Broke after a day,0\n";

    #[test]
    fn test_read_plain_csv() {
        let corpus = LabeledCorpus::from_reader(CSV.as_bytes()).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.texts(), vec!["Loved it, works great", "Broke after a day"]);
        assert_eq!(corpus.labels().unwrap(), Some(vec![1, 0]));
        assert_eq!(corpus.headers(), &["id", "input", "labels"]);
    }

    #[test]
    fn test_read_gzip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train_text.csv.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(CSV.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let corpus = LabeledCorpus::read(&path).unwrap();
        assert_eq!(corpus.require_labels().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_unlabeled_file() {
        let corpus = LabeledCorpus::from_reader("input\nhello\n".as_bytes()).unwrap();
        assert!(!corpus.has_labels());
        assert_eq!(corpus.labels().unwrap(), None);
        assert!(corpus.require_labels().is_err());
    }

    #[test]
    fn test_missing_text_column() {
        assert!(LabeledCorpus::from_reader("text,labels\nx,1\n".as_bytes()).is_err());
    }

    #[test]
    fn test_bad_label() {
        let corpus = LabeledCorpus::from_reader("input,labels\nx,positive\n".as_bytes()).unwrap();
        assert!(corpus.labels().is_err());
    }
}
