//! File acquisition: HTTP fetch, ZIP detection and entry selection, and
//! text decoding.
//!
//! The acquirer is deliberately stateless and never retries; retry policy
//! belongs to the orchestrator. [`Fetch`] is a trait so the rest of the
//! pipeline can be exercised against canned payloads.

use std::future::Future;
use std::io::{Cursor, Read};
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::IngestError;

// ---

/// Local-file ZIP signature. Content sniffing, not URL suffixes: some TSO
/// servers serve archives with a `text/csv` content type.
const ZIP_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// Browser-like UA; a few TSO servers reject default HTTP clients.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Csv,
    Zip,
}

/// Raw bytes plus the detected content kind.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub bytes: Vec<u8>,
    pub kind: ContentKind,
}

impl RawPayload {
    pub fn detect(bytes: Vec<u8>) -> Self {
        let kind = if bytes.len() >= 4 && bytes[..4] == ZIP_SIGNATURE {
            ContentKind::Zip
        } else {
            ContentKind::Csv
        };
        RawPayload { bytes, kind }
    }

    /// Decoded CSV text for the requested date, extracting from the archive
    /// first when the payload is a ZIP.
    pub fn csv_text(&self, date: NaiveDate) -> Result<String, IngestError> {
        match self.kind {
            ContentKind::Csv => Ok(decode_text(&self.bytes)),
            ContentKind::Zip => {
                let entry = select_entry(&self.bytes, date)?;
                Ok(decode_text(&entry))
            }
        }
    }
}

/// UTF-8 first, Shift_JIS fallback. The TSO servers are split between the
/// two and none of them advertises a charset.
fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, had_errors) = encoding_rs::SHIFT_JIS.decode(bytes);
            if had_errors {
                warn!("payload decoded with replacement characters");
            }
            decoded.into_owned()
        }
    }
}

// ---

/// Pick the CSV entry of an archive that best matches the requested date.
///
/// Selection order:
/// 1. a single-entry archive is accepted regardless of naming;
/// 2. among CSV-bearing entries (sniffed by content, not extension), an
///    exact `YYYYMMDD` name match wins over a partial `YYYYMM` match;
/// 3. entries with some other date-like name fall back to the lexically
///    first candidate, with a warning;
/// 4. multiple entries with nothing date-like anywhere is ambiguous.
fn select_entry(bytes: &[u8], date: NaiveDate) -> Result<Vec<u8>, IngestError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| IngestError::ArchiveCorrupt(e.to_string()))?;

    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| IngestError::ArchiveCorrupt(e.to_string()))?;
        if !file.is_file() {
            continue;
        }
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| IngestError::ArchiveCorrupt(e.to_string()))?;
        entries.push((file.name().to_string(), buf));
    }

    if entries.is_empty() {
        return Err(IngestError::ArchiveCorrupt("archive holds no files".into()));
    }
    if entries.len() == 1 {
        let (name, bytes) = entries.into_iter().next().unwrap();
        debug!(entry = %name, "single-entry archive accepted");
        return Ok(bytes);
    }

    let mut candidates: Vec<(String, Vec<u8>)> = entries
        .iter()
        .filter(|(_, bytes)| looks_like_csv(bytes))
        .cloned()
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    match candidates.len() {
        0 => Err(IngestError::ArchiveCorrupt(
            "no CSV-bearing entry in archive".into(),
        )),
        1 => {
            let (name, bytes) = candidates.into_iter().next().unwrap();
            debug!(entry = %name, "sole CSV-bearing entry selected");
            Ok(bytes)
        }
        _ => {
            let exact = date.format("%Y%m%d").to_string();
            let partial = date.format("%Y%m").to_string();

            if let Some((name, bytes)) = candidates
                .iter()
                .find(|(name, _)| name.contains(&exact))
                .or_else(|| candidates.iter().find(|(name, _)| name.contains(&partial)))
            {
                debug!(entry = %name, "date-matching entry selected");
                return Ok(bytes.clone());
            }

            let any_dated = candidates
                .iter()
                .any(|(name, _)| has_digit_run(name, 6) || has_digit_run(name, 8));
            if any_dated {
                let (name, bytes) = &candidates[0];
                warn!(
                    entry = %name,
                    requested = %exact,
                    "no entry matches the requested date; using lexically first"
                );
                Ok(bytes.clone())
            } else {
                Err(IngestError::AmbiguousArchiveContent {
                    entries: candidates.into_iter().map(|(name, _)| name).collect(),
                })
            }
        }
    }
}

/// Cheap content sniff: text with at least one comma-delimited line.
fn looks_like_csv(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(512)];
    if head.contains(&0) {
        return false;
    }
    let text = String::from_utf8_lossy(head);
    text.lines().any(|line| line.contains(','))
}

/// Whether `name` carries a run of exactly `len` consecutive digits.
fn has_digit_run(name: &str, len: usize) -> bool {
    let mut run = 0usize;
    let mut runs = Vec::new();
    for c in name.chars() {
        if c.is_ascii_digit() {
            run += 1;
        } else {
            if run > 0 {
                runs.push(run);
            }
            run = 0;
        }
    }
    if run > 0 {
        runs.push(run);
    }
    runs.contains(&len)
}

// ---

/// The network boundary of the pipeline.
pub trait Fetch: Send + Sync {
    fn fetch(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<RawPayload, IngestError>> + Send;
}

/// Production fetcher: one bounded-timeout GET per call, no internal retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(HttpFetcher { client })
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<RawPayload, IngestError> {
        // ---
        debug!(%url, "fetching");
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|e| IngestError::RemoteUnavailable {
                    url: url.to_string(),
                    status: e.status().map(|s| s.as_u16()),
                })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::RemoteUnavailable {
                url: url.to_string(),
                status: Some(status.as_u16()),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IngestError::RemoteUnavailable {
                url: url.to_string(),
                status: e.status().map(|s| s.as_u16()),
            })?;

        Ok(RawPayload::detect(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        // ---
        let mut buf = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buf));
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            for (name, content) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    const CSV_BODY: &str = "DATE,TIME,demand\n2024/04/01,0:00,100\n";

    #[test]
    fn zip_detection_is_by_signature() {
        // ---
        let zipped = build_zip(&[("a.csv", CSV_BODY)]);
        assert_eq!(RawPayload::detect(zipped).kind, ContentKind::Zip);
        // A CSV that merely mentions PK is still a CSV
        assert_eq!(
            RawPayload::detect(b"DATE,TIME\nPK,1".to_vec()).kind,
            ContentKind::Csv
        );
    }

    #[test]
    fn plain_csv_passes_through() {
        // ---
        let payload = RawPayload::detect(CSV_BODY.as_bytes().to_vec());
        assert_eq!(payload.csv_text(d(2024, 4, 1)).unwrap(), CSV_BODY);
    }

    #[test]
    fn shift_jis_payload_is_decoded() {
        // ---
        let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode("DATE,TIME,エリア需要\n");
        let payload = RawPayload::detect(encoded.into_owned());
        let text = payload.csv_text(d(2024, 4, 1)).unwrap();
        assert!(text.contains("エリア需要"));
    }

    #[test]
    fn csv_entry_wins_over_readme() {
        // ---
        // readme is excluded by content (no delimited lines), so the CSV is
        // the only candidate whatever its name says about dates.
        let zipped = build_zip(&[
            ("readme.txt", "About this archive.\nContact us."),
            ("tohoku_20240401.csv", CSV_BODY),
        ]);
        let payload = RawPayload::detect(zipped);
        assert_eq!(payload.csv_text(d(2099, 1, 1)).unwrap(), CSV_BODY);
    }

    #[test]
    fn exact_date_match_beats_partial() {
        // ---
        let zipped = build_zip(&[
            ("eria_jukyu_202404.csv", "a,b\n1,2\n"),
            ("eria_jukyu_20240401.csv", "c,d\n3,4\n"),
        ]);
        let payload = RawPayload::detect(zipped);
        assert_eq!(payload.csv_text(d(2024, 4, 1)).unwrap(), "c,d\n3,4\n");
    }

    #[test]
    fn partial_match_used_when_no_exact() {
        // ---
        let zipped = build_zip(&[
            ("eria_jukyu_202403.csv", "m,a\n5,6\n"),
            ("eria_jukyu_202404.csv", "m,b\n7,8\n"),
        ]);
        let payload = RawPayload::detect(zipped);
        assert_eq!(payload.csv_text(d(2024, 4, 15)).unwrap(), "m,b\n7,8\n");
    }

    #[test]
    fn lexical_fallback_when_dates_do_not_match() {
        // ---
        let zipped = build_zip(&[
            ("b_202301.csv", "x,y\n1,1\n"),
            ("a_202302.csv", "x,y\n2,2\n"),
        ]);
        let payload = RawPayload::detect(zipped);
        // neither entry matches 2024-04; lexically first candidate wins
        assert_eq!(payload.csv_text(d(2024, 4, 1)).unwrap(), "x,y\n2,2\n");
    }

    #[test]
    fn undated_multi_entry_archive_is_ambiguous() {
        // ---
        let zipped = build_zip(&[
            ("first.csv", "a,b\n1,2\n"),
            ("second.csv", "a,b\n3,4\n"),
        ]);
        let payload = RawPayload::detect(zipped);
        assert!(matches!(
            payload.csv_text(d(2024, 4, 1)),
            Err(IngestError::AmbiguousArchiveContent { .. })
        ));
    }

    #[test]
    fn single_entry_accepted_regardless_of_naming() {
        // ---
        let zipped = build_zip(&[("whatever.bin", CSV_BODY)]);
        let payload = RawPayload::detect(zipped);
        assert_eq!(payload.csv_text(d(2024, 4, 1)).unwrap(), CSV_BODY);
    }

    #[test]
    fn truncated_archive_is_corrupt() {
        // ---
        let mut zipped = build_zip(&[("a.csv", CSV_BODY), ("b.csv", CSV_BODY)]);
        zipped.truncate(20);
        let payload = RawPayload::detect(zipped);
        assert!(matches!(
            payload.csv_text(d(2024, 4, 1)),
            Err(IngestError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn digit_runs_are_exact_length() {
        // ---
        assert!(has_digit_run("eria_jukyu_202404.csv", 6));
        assert!(has_digit_run("eria_jukyu_20240401.csv", 8));
        assert!(!has_digit_run("eria_jukyu_20240401.csv", 6));
        assert!(!has_digit_run("juyo_v2.csv", 6));
    }
}
