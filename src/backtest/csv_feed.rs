//! CSV-backed data feed.
//!
//! Reads OHLCV rows lazily from one or more files. A file either carries a
//! symbol column or is bound to one symbol at registration time. Rows are
//! parsed as the stream is pulled; a malformed row surfaces as a stream error
//! carrying the file and row number.

use crate::backtest::clock::{parse_timestamp, Nanos};
use crate::backtest::events::MarketDataEvent;
use crate::backtest::feed::{in_range, DataFeed};
use crate::backtest::queue::BarStream;
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Column names looked up in the header row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvColumns {
    pub date: String,
    pub symbol: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

impl Default for CsvColumns {
    fn default() -> Self {
        Self {
            date: "Date".into(),
            symbol: "Symbol".into(),
            open: "Open".into(),
            high: "High".into(),
            low: "Low".into(),
            close: "Close".into(),
            volume: "Volume".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CsvSource {
    path: PathBuf,
    /// Every row belongs to this symbol; the symbol column is ignored.
    symbol: Option<String>,
}

/// Header positions resolved once per file.
#[derive(Debug, Clone, Copy)]
struct Layout {
    date: usize,
    symbol: Option<usize>,
    open: Option<usize>,
    high: Option<usize>,
    low: Option<usize>,
    close: usize,
    volume: Option<usize>,
}

impl Layout {
    fn resolve(headers: &csv::StringRecord, columns: &CsvColumns, needs_symbol: bool) -> anyhow::Result<Self> {
        let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let date = find(&columns.date).ok_or_else(|| anyhow!("missing column '{}'", columns.date))?;
        let close = find(&columns.close).ok_or_else(|| anyhow!("missing column '{}'", columns.close))?;
        let symbol = find(&columns.symbol);
        if needs_symbol && symbol.is_none() {
            bail!("missing column '{}' and no symbol bound to the file", columns.symbol);
        }
        Ok(Self {
            date,
            symbol,
            open: find(&columns.open),
            high: find(&columns.high),
            low: find(&columns.low),
            close,
            volume: find(&columns.volume),
        })
    }

    fn parse(&self, record: &csv::StringRecord, symbol: &str) -> anyhow::Result<MarketDataEvent> {
        let field = |idx: usize| record.get(idx).unwrap_or("");
        let number = |idx: usize| -> anyhow::Result<f64> {
            let raw = field(idx);
            raw.parse::<f64>()
                .with_context(|| format!("invalid number '{raw}'"))
        };

        let raw_date = field(self.date);
        let timestamp =
            parse_timestamp(raw_date).ok_or_else(|| anyhow!("invalid date '{raw_date}'"))?;
        let close = number(self.close)?;
        let or_close = |idx: Option<usize>| idx.map_or(Ok(close), number);

        Ok(MarketDataEvent {
            timestamp,
            symbol: symbol.to_string(),
            open: or_close(self.open)?,
            high: or_close(self.high)?,
            low: or_close(self.low)?,
            close,
            volume: self.volume.map_or(Ok(0.0), number)?,
        })
    }
}

pub struct CsvFeed {
    name: String,
    columns: CsvColumns,
    sources: Vec<CsvSource>,
}

impl CsvFeed {
    pub fn new(columns: CsvColumns) -> Self {
        Self {
            name: "csv".to_string(),
            columns,
            sources: Vec::new(),
        }
    }

    /// Register a file. With `symbol` set every row is attributed to it.
    pub fn add_file(&mut self, path: impl AsRef<Path>, symbol: Option<String>) {
        self.sources.push(CsvSource {
            path: path.as_ref().to_path_buf(),
            symbol,
        });
    }

    pub fn with_file(mut self, path: impl AsRef<Path>, symbol: Option<String>) -> Self {
        self.add_file(path, symbol);
        self
    }

    pub fn file_count(&self) -> usize {
        self.sources.len()
    }

    fn open(
        &self,
        source: &CsvSource,
        symbol: &str,
        start: Option<Nanos>,
        end: Option<Nanos>,
    ) -> anyhow::Result<BarStream> {
        let path = source.path.clone();
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("failed to read header of {}", path.display()))?
            .clone();
        let layout = Layout::resolve(&headers, &self.columns, source.symbol.is_none())
            .with_context(|| format!("unusable header in {}", path.display()))?;

        let bound = source.symbol.is_some();
        let symbol = symbol.to_string();
        let rows = reader.into_records().enumerate().filter_map(move |(idx, record)| {
            // Header is line 1.
            let line = idx + 2;
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    return Some(Err(anyhow::Error::new(e)
                        .context(format!("{} line {}", path.display(), line))))
                }
            };
            if !bound {
                let row_symbol = layout.symbol.and_then(|i| record.get(i));
                if row_symbol != Some(symbol.as_str()) {
                    return None;
                }
            }
            match layout.parse(&record, &symbol) {
                Ok(bar) if in_range(bar.timestamp, start, end) => Some(Ok(bar)),
                Ok(_) => None,
                Err(e) => Some(Err(e.context(format!("{} line {}", path.display(), line)))),
            }
        });
        Ok(Box::new(rows))
    }
}

impl Default for CsvFeed {
    fn default() -> Self {
        Self::new(CsvColumns::default())
    }
}

impl DataFeed for CsvFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self, symbol: &str, start: Option<Nanos>, end: Option<Nanos>) -> anyhow::Result<BarStream> {
        let matching: Vec<&CsvSource> = self
            .sources
            .iter()
            .filter(|s| s.symbol.as_deref().map_or(true, |bound| bound == symbol))
            .collect();
        if matching.is_empty() {
            bail!("no CSV file provides symbol {symbol}");
        }
        tracing::debug!(symbol, files = matching.len(), "opening csv streams");

        let streams = matching
            .into_iter()
            .map(|source| self.open(source, symbol, start, end))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Box::new(streams.into_iter().flatten()))
    }
}
