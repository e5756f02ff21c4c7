use crate::models::Bar;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const BAR_SNAPSHOT_VERSION: u32 = 1;

const DATE_ALIASES: [&str; 5] = ["date", "dt", "time", "datetime", "trade_date"];
const VOLUME_ALIASES: [&str; 2] = ["volume", "vol"];
const SYMBOL_ALIASES: [&str; 4] = ["symbol", "code", "ts_code", "ticker"];

#[derive(Debug, Serialize, Deserialize)]
struct BarSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    bars: Vec<Bar>,
}

struct CsvColumns {
    date: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: Option<usize>,
    symbol: Option<usize>,
}

impl CsvColumns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self> {
        let normalized: Vec<String> = headers
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
            .collect();
        let find = |aliases: &[&str]| {
            normalized
                .iter()
                .position(|h| aliases.iter().any(|alias| h == alias))
        };
        let require = |aliases: &[&str]| {
            find(aliases).ok_or_else(|| anyhow!("CSV header is missing a '{}' column", aliases[0]))
        };
        Ok(Self {
            date: require(&DATE_ALIASES)?,
            open: require(&["open"])?,
            high: require(&["high"])?,
            low: require(&["low"])?,
            close: require(&["close"])?,
            volume: find(&VOLUME_ALIASES),
            symbol: find(&SYMBOL_ALIASES),
        })
    }

    fn parse(&self, record: &csv::StringRecord, default_symbol: &str) -> Result<Bar> {
        let field = |index: usize| {
            record
                .get(index)
                .map(str::trim)
                .ok_or_else(|| anyhow!("row has no column {}", index))
        };
        let number = |index: usize| -> Result<f64> {
            let raw = field(index)?;
            raw.parse::<f64>()
                .map_err(|_| anyhow!("'{}' is not a number", raw))
        };
        let symbol = match self.symbol {
            Some(index) => field(index)?.to_string(),
            None => default_symbol.to_string(),
        };
        let volume = match self.volume {
            Some(index) if !field(index)?.is_empty() => number(index)?,
            _ => 0.0,
        };
        let bar = Bar {
            symbol,
            date: parse_date(field(self.date)?)?,
            open: number(self.open)?,
            high: number(self.high)?,
            low: number(self.low)?,
            close: number(self.close)?,
            volume,
        };
        bar.validate()?;
        Ok(bar)
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    for format in ["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Ok(date);
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(datetime.date());
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|datetime| datetime.date_naive())
        .map_err(|_| anyhow!("Unrecognized date '{}'", raw))
}

/// Sorts by (symbol, date) and keeps the last bar for a repeated date.
pub fn normalize_bars(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.date.cmp(&b.date)));
    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last_mut() {
            Some(last) if last.symbol == bar.symbol && last.date == bar.date => *last = bar,
            _ => out.push(bar),
        }
    }
    out
}

/// Reads bars from CSV. Rows that fail to parse or validate are skipped and
/// counted.
pub fn read_csv<R: Read>(reader: R, default_symbol: &str) -> Result<Vec<Bar>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    let columns = CsvColumns::from_headers(&headers)?;

    let mut bars = Vec::new();
    let mut skipped = 0usize;
    for (row, record) in reader.records().enumerate() {
        let parsed = record
            .map_err(anyhow::Error::from)
            .and_then(|record| columns.parse(&record, default_symbol));
        match parsed {
            Ok(bar) => bars.push(bar),
            Err(err) => {
                skipped += 1;
                debug!("Skipping CSV row {} for {}: {}", row + 2, default_symbol, err);
            }
        }
    }
    if skipped > 0 {
        warn!("Skipped {} invalid rows while loading {}", skipped, default_symbol);
    }
    Ok(normalize_bars(bars))
}

pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open bar file {}", path.display()))?;
    read_csv(BufReader::new(file), &file_symbol(path))
        .with_context(|| format!("Failed to load bars from {}", path.display()))
}

pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open bar file {}", path.display()))?;
    let bars: Vec<Bar> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to decode bars from {}", path.display()))?;
    Ok(normalize_bars(keep_valid(bars, path)))
}

pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open bar snapshot at {}", path.display()))?;
    let snapshot: BarSnapshot = bincode::deserialize_from(BufReader::new(file))
        .context("Bar snapshot decode failed")?;
    if snapshot.version != BAR_SNAPSHOT_VERSION {
        return Err(anyhow!(
            "Bar snapshot version mismatch (found {}, expected {})",
            snapshot.version,
            BAR_SNAPSHOT_VERSION
        ));
    }
    info!(
        "Loaded {} bars from snapshot generated at {}",
        snapshot.bars.len(),
        snapshot.generated_at
    );
    Ok(normalize_bars(keep_valid(snapshot.bars, path)))
}

pub fn save_snapshot<P: AsRef<Path>>(path: P, bars: &[Bar]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create snapshot directory {}", parent.display())
            })?;
        }
    }
    let file = File::create(path)
        .with_context(|| format!("Unable to create bar snapshot at {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let snapshot = BarSnapshot {
        version: BAR_SNAPSHOT_VERSION,
        generated_at: Utc::now(),
        bars: bars.to_vec(),
    };
    bincode::serialize_into(&mut writer, &snapshot).context("Failed to serialize bar snapshot")?;
    writer
        .flush()
        .context("Failed to flush bar snapshot to disk")?;
    Ok(())
}

/// Loads a bar file, choosing the format by extension (`csv`, `json`, `bin`).
pub fn load_bars<P: AsRef<Path>>(path: P) -> Result<Vec<Bar>> {
    let path = path.as_ref();
    match extension(path).as_deref() {
        Some("csv") => load_csv(path),
        Some("json") => load_json(path),
        Some("bin") => load_snapshot(path),
        other => Err(anyhow!(
            "Unsupported bar file {} (extension {:?})",
            path.display(),
            other
        )),
    }
}

/// Loads every supported bar file in `dir`, grouped by symbol.
pub fn load_directory<P: AsRef<Path>>(dir: P) -> Result<HashMap<String, Vec<Bar>>> {
    let dir = dir.as_ref();
    let mut paths: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read data directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && matches!(extension(path).as_deref(), Some("csv" | "json" | "bin"))
        })
        .collect();
    paths.sort();

    let mut by_symbol: HashMap<String, Vec<Bar>> = HashMap::new();
    for path in &paths {
        for bar in load_bars(path)? {
            by_symbol.entry(bar.symbol.clone()).or_default().push(bar);
        }
    }
    for bars in by_symbol.values_mut() {
        *bars = normalize_bars(std::mem::take(bars));
    }
    info!(
        "Loaded {} symbols from {} files in {}",
        by_symbol.len(),
        paths.len(),
        dir.display()
    );
    Ok(by_symbol)
}

/// Keeps bars dated within `[beg, end]`. Either bound may be open.
pub fn filter_dates(bars: Vec<Bar>, beg: Option<NaiveDate>, end: Option<NaiveDate>) -> Vec<Bar> {
    bars.into_iter()
        .filter(|bar| beg.map_or(true, |beg| bar.date >= beg))
        .filter(|bar| end.map_or(true, |end| bar.date <= end))
        .collect()
}

/// Picks the `index_symbol` series out of an index file. A file holding a
/// single unnamed series (symbol taken from the file name) is used as is.
pub fn select_index(bars: Vec<Bar>, index_symbol: &str) -> Vec<Bar> {
    if bars.iter().any(|bar| bar.symbol == index_symbol) {
        return bars
            .into_iter()
            .filter(|bar| bar.symbol == index_symbol)
            .collect();
    }
    let first = bars.first().map(|bar| bar.symbol.clone());
    if bars.iter().all(|bar| Some(&bar.symbol) == first.as_ref()) {
        return bars;
    }
    warn!(
        "Index file has no {} series and holds several symbols; ignoring it",
        index_symbol
    );
    Vec::new()
}

fn keep_valid(bars: Vec<Bar>, path: &Path) -> Vec<Bar> {
    let total = bars.len();
    let valid: Vec<Bar> = bars.into_iter().filter(|bar| bar.validate().is_ok()).collect();
    if valid.len() < total {
        warn!(
            "Skipped {} invalid bars while loading {}",
            total - valid.len(),
            path.display()
        );
    }
    valid
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn file_symbol(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("UNKNOWN")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn csv_headers_are_matched_by_alias() {
        let csv = "Trade_Date,Open,High,Low,Close,Vol\n\
                   20240103,10.1,10.5,9.9,10.2,1200\n\
                   20240102,10.0,10.4,9.8,10.1,1000\n";
        let bars = read_csv(csv.as_bytes(), "600000.SH").unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, date("2024-01-02"));
        assert_eq!(bars[0].symbol, "600000.SH");
        assert_eq!(bars[1].volume, 1200.0);
    }

    #[test]
    fn csv_skips_invalid_rows_and_keeps_last_duplicate() {
        let csv = "date,open,high,low,close,volume\n\
                   2024-01-02,10,10.5,9.5,10.1,100\n\
                   2024-01-03,10,9.0,9.5,10.1,100\n\
                   2024-01-04,abc,10.5,9.5,10.1,100\n\
                   2024-01-02,11,11.5,10.5,11.1,200\n";
        let bars = read_csv(csv.as_bytes(), "X").unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 11.1);
    }

    #[test]
    fn csv_without_date_column_is_an_error() {
        let csv = "open,high,low,close\n1,2,0.5,1.5\n";
        assert!(read_csv(csv.as_bytes(), "X").is_err());
    }

    #[test]
    fn csv_symbol_column_overrides_file_name() {
        let csv = "ts_code,datetime,open,high,low,close\n\
                   000001.SZ,2024-01-02 15:00:00,10,10.5,9.5,10.1\n";
        let bars = read_csv(csv.as_bytes(), "fallback").unwrap();
        assert_eq!(bars[0].symbol, "000001.SZ");
        assert_eq!(bars[0].volume, 0.0);
    }

    #[test]
    fn snapshot_and_directory_loading() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("AAA.csv");
        fs::write(
            &csv_path,
            "date,open,high,low,close,volume\n2024-01-02,10,10.5,9.5,10.1,100\n",
        )
        .unwrap();

        let snapshot_bars = vec![Bar {
            symbol: "BBB".to_string(),
            date: date("2024-01-02"),
            open: 5.0,
            high: 5.5,
            low: 4.5,
            close: 5.2,
            volume: 10.0,
        }];
        let bin_path = dir.path().join("nested").join("bbb.bin");
        save_snapshot(&bin_path, &snapshot_bars).unwrap();
        assert_eq!(load_snapshot(&bin_path).unwrap(), snapshot_bars);

        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let json_path = dir.path().join("ccc.json");
        fs::write(&json_path, serde_json::to_string(&snapshot_bars).unwrap()).unwrap();

        let loaded = load_directory(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["AAA"].len(), 1);
        assert_eq!(loaded["BBB"].len(), 1);
    }

    #[test]
    fn date_filter_bounds_are_inclusive() {
        let bars: Vec<Bar> = ["2024-01-01", "2024-01-02", "2024-01-03", "2024-01-04"]
            .iter()
            .map(|d| Bar {
                symbol: "A".to_string(),
                date: date(d),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
            })
            .collect();
        let kept = filter_dates(bars.clone(), Some(date("2024-01-02")), Some(date("2024-01-03")));
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].date, date("2024-01-02"));
        assert_eq!(kept[1].date, date("2024-01-03"));
        assert_eq!(filter_dates(bars.clone(), None, None).len(), 4);
        assert_eq!(filter_dates(bars, None, Some(date("2024-01-01"))).len(), 1);
    }

    #[test]
    fn index_series_is_selected_by_symbol() {
        let bar = |symbol: &str, d: &str| Bar {
            symbol: symbol.to_string(),
            date: date(d),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        };
        let mixed = vec![
            bar("000300.SH", "2024-01-01"),
            bar("000905.SH", "2024-01-01"),
            bar("000300.SH", "2024-01-02"),
        ];
        let picked = select_index(mixed.clone(), "000300.SH");
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|b| b.symbol == "000300.SH"));
        assert!(select_index(mixed, "399001.SZ").is_empty());

        let single = vec![bar("hs300", "2024-01-01"), bar("hs300", "2024-01-02")];
        assert_eq!(select_index(single, "000300.SH").len(), 2);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        assert!(load_bars("prices.parquet").is_err());
    }
}
