// ===============================
// src/series.rs
// ===============================
//
// Chunked time-series cache. Complete calendar buckets live on disk at
//   <root>/<venue>/<klines|fundingfees>/<instrument>/<interval|none>/<bucket>.<ext>
// and only the gaps between them are pulled from the venue. A bucket that
// has not ended yet is never written.
//
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::domain::{FundingRate, Kline};
use crate::error::{VenueError, VenueResult};
use crate::metrics::SERIES_CHUNKS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucketing {
    Day,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub start: i64,
    pub end: i64,
}

fn utc(ms: i64) -> VenueResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| VenueError::InvalidRequest(format!("timestamp out of range: {ms}")))
}

fn midnight_ms(d: NaiveDate) -> i64 {
    d.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp_millis())
}

impl Bucketing {
    fn start_of(&self, ms: i64) -> VenueResult<NaiveDate> {
        let d = utc(ms)?.date_naive();
        Ok(match self {
            Bucketing::Day => d,
            Bucketing::Month => d.with_day(1).unwrap_or(d),
        })
    }

    fn next(&self, d: NaiveDate) -> NaiveDate {
        match self {
            Bucketing::Day => d.succ_opt().unwrap_or(d),
            Bucketing::Month => {
                let (y, m) = if d.month() == 12 { (d.year() + 1, 1) } else { (d.year(), d.month() + 1) };
                NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(d)
            }
        }
    }

    /// Buckets overlapping `[t0, t1)`.
    pub fn enumerate(&self, t0: i64, t1: i64) -> VenueResult<Vec<Bucket>> {
        let mut out = Vec::new();
        if t1 <= t0 {
            return Ok(out);
        }
        let mut d = self.start_of(t0)?;
        loop {
            let start = midnight_ms(d);
            if start >= t1 {
                break;
            }
            let next = self.next(d);
            if next == d {
                break;
            }
            out.push(Bucket { start, end: midnight_ms(next) });
            d = next;
        }
        Ok(out)
    }

    pub fn name(&self, b: &Bucket) -> VenueResult<String> {
        let d = utc(b.start)?;
        Ok(match self {
            Bucketing::Day => d.format("%Y%m%d").to_string(),
            Bucketing::Month => d.format("%Y%m").to_string(),
        })
    }
}

/// What a series stores and how its chunks look on disk.
pub trait SeriesKind: Send + Sync + 'static {
    type Point: Clone + Send + Sync + 'static;

    const DIR: &'static str;
    const EXT: &'static str;
    const BUCKETING: Bucketing;

    fn ts(p: &Self::Point) -> i64;
    fn encode(points: &[Self::Point]) -> VenueResult<Vec<u8>>;
    fn decode(bytes: &[u8]) -> VenueResult<Vec<Self::Point>>;

    /// A finished bucket may be persisted when this holds for its points.
    fn persistable(points: &[Self::Point], bucket: &Bucket, interval_ms: Option<i64>) -> bool;
}

pub struct Klines;

pub const KLINE_RECORD_LEN: usize = 48;

impl SeriesKind for Klines {
    type Point = Kline;

    const DIR: &'static str = "klines";
    const EXT: &'static str = "bin";
    const BUCKETING: Bucketing = Bucketing::Day;

    fn ts(p: &Kline) -> i64 {
        p.open_time
    }

    fn encode(points: &[Kline]) -> VenueResult<Vec<u8>> {
        let mut out = Vec::with_capacity(points.len() * KLINE_RECORD_LEN);
        for k in points {
            out.extend_from_slice(&k.open_time.to_le_bytes());
            for v in [k.open, k.high, k.low, k.close, k.volume] {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> VenueResult<Vec<Kline>> {
        if bytes.len() % KLINE_RECORD_LEN != 0 {
            return Err(VenueError::Decode(format!("kline chunk of {} bytes", bytes.len())));
        }
        let f = |r: &[u8], at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&r[at..at + 8]);
            b
        };
        Ok(bytes
            .chunks_exact(KLINE_RECORD_LEN)
            .map(|r| Kline {
                open_time: i64::from_le_bytes(f(r, 0)),
                open: f64::from_le_bytes(f(r, 8)),
                high: f64::from_le_bytes(f(r, 16)),
                low: f64::from_le_bytes(f(r, 24)),
                close: f64::from_le_bytes(f(r, 32)),
                volume: f64::from_le_bytes(f(r, 40)),
            })
            .collect())
    }

    /// Dense at the interval, first bar at the bucket start.
    fn persistable(points: &[Kline], bucket: &Bucket, interval_ms: Option<i64>) -> bool {
        let Some(step) = interval_ms.filter(|s| *s > 0) else { return false };
        let expected = (bucket.end - bucket.start) / step;
        points.len() as i64 == expected
            && points.iter().enumerate().all(|(i, k)| k.open_time == bucket.start + i as i64 * step)
    }
}

pub struct FundingFees;

impl SeriesKind for FundingFees {
    type Point = FundingRate;

    const DIR: &'static str = "fundingfees";
    const EXT: &'static str = "json";
    const BUCKETING: Bucketing = Bucketing::Month;

    fn ts(p: &FundingRate) -> i64 {
        p.funding_time
    }

    fn encode(points: &[FundingRate]) -> VenueResult<Vec<u8>> {
        Ok(serde_json::to_vec(points)?)
    }

    fn decode(bytes: &[u8]) -> VenueResult<Vec<FundingRate>> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn persistable(points: &[FundingRate], _bucket: &Bucket, _interval_ms: Option<i64>) -> bool {
        !points.is_empty()
    }
}

/// `1m`, `15m`, `1h`, `1d`, `1w` style interval to milliseconds.
pub fn interval_ms(interval: &str) -> Option<i64> {
    let split = interval.find(|c: char| !c.is_ascii_digit())?;
    let (n, unit) = interval.split_at(split);
    let n: i64 = n.parse().ok()?;
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        _ => return None,
    };
    Some(n * unit_ms)
}

/// Venue side of a series: one page per call.
#[async_trait]
pub trait SeriesSource<K: SeriesKind>: Send + Sync {
    /// Points with `start <= ts < end`, ascending, at most `page_limit()`.
    async fn fetch_page(
        &self,
        instrument: &str,
        interval: Option<&str>,
        start: i64,
        end: i64,
    ) -> VenueResult<Vec<K::Point>>;

    fn page_limit(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct SeriesConfig {
    pub root: PathBuf,
    pub enabled: bool,
    /// Minimum spacing between page requests.
    pub min_interval: Duration,
    pub retry_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./cache"),
            enabled: true,
            min_interval: Duration::from_millis(250),
            retry_backoff: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

pub type NowFn = Arc<dyn Fn() -> i64 + Send + Sync>;

struct Pull<P> {
    points: Vec<P>,
    complete: bool,
}

pub struct SeriesCache<K: SeriesKind> {
    venue: String,
    source: Arc<dyn SeriesSource<K>>,
    cfg: SeriesConfig,
    now: NowFn,
    last_call: AsyncMutex<Option<Instant>>,
    _kind: PhantomData<K>,
}

pub type KlineCache = SeriesCache<Klines>;
pub type FundingCache = SeriesCache<FundingFees>;

impl<K: SeriesKind> SeriesCache<K> {
    pub fn new(venue: impl Into<String>, source: Arc<dyn SeriesSource<K>>, cfg: SeriesConfig) -> Self {
        Self {
            venue: venue.into(),
            source,
            cfg,
            now: Arc::new(crate::domain::now_ms),
            last_call: AsyncMutex::new(None),
            _kind: PhantomData,
        }
    }

    /// Replace the wall clock used to decide which bucket is still forming.
    pub fn with_now(mut self, now: NowFn) -> Self {
        self.now = now;
        self
    }

    pub fn chunk_path(&self, instrument: &str, interval: Option<&str>, bucket: &Bucket) -> VenueResult<PathBuf> {
        Ok(self
            .cfg
            .root
            .join(&self.venue)
            .join(K::DIR)
            .join(instrument)
            .join(interval.unwrap_or("none"))
            .join(format!("{}.{}", K::BUCKETING.name(bucket)?, K::EXT)))
    }

    async fn read_chunk(&self, path: &Path) -> Option<Vec<K::Point>> {
        let bytes = fs::read(path).await.ok()?;
        match K::decode(&bytes) {
            Ok(points) if !points.is_empty() => Some(points),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable chunk ignored");
                None
            }
        }
    }

    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(at) = *last {
            let since = at.elapsed();
            if since < self.cfg.min_interval {
                tokio::time::sleep(self.cfg.min_interval - since).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Page through `[start, end)`. Transport trouble past the retry cap
    /// yields what was collected so far, flagged incomplete.
    async fn pull(&self, instrument: &str, interval: Option<&str>, start: i64, end: i64) -> VenueResult<Pull<K::Point>> {
        let mut points: Vec<K::Point> = Vec::new();
        let mut cursor = start;
        let limit = self.source.page_limit().max(1);
        while cursor < end {
            let mut attempt = 0;
            let page = loop {
                attempt += 1;
                self.pace().await;
                match self.source.fetch_page(instrument, interval, cursor, end).await {
                    Ok(p) => break p,
                    Err(e) if e.is_retryable() && attempt < self.cfg.max_attempts => {
                        warn!(venue = %self.venue, kind = K::DIR, instrument, attempt, error = %e, "series pull retry");
                        tokio::time::sleep(self.cfg.retry_backoff).await;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(venue = %self.venue, kind = K::DIR, instrument, error = %e, "series pull gave up, partial result");
                        return Ok(Pull { points, complete: false });
                    }
                    Err(e) => return Err(e),
                }
            };
            let n = page.len();
            let mut advanced = false;
            for p in page {
                let ts = K::ts(&p);
                if ts >= cursor && ts < end {
                    cursor = ts + 1;
                    advanced = true;
                    points.push(p);
                }
            }
            if n < limit || !advanced {
                break;
            }
        }
        debug!(venue = %self.venue, kind = K::DIR, instrument, start, end, count = points.len(), "series pulled");
        Ok(Pull { points, complete: true })
    }

    async fn persist(&self, instrument: &str, interval: Option<&str>, buckets: &[Bucket], points: &[K::Point]) {
        let now = (self.now)();
        let step = interval.and_then(interval_ms);
        for b in buckets {
            if b.end > now {
                SERIES_CHUNKS.with_label_values(&[K::DIR, "forming"]).inc();
                continue;
            }
            let chunk: Vec<K::Point> =
                points.iter().filter(|p| (b.start..b.end).contains(&K::ts(p))).cloned().collect();
            if chunk.is_empty() || !K::persistable(&chunk, b, step) {
                SERIES_CHUNKS.with_label_values(&[K::DIR, "skip"]).inc();
                continue;
            }
            let path = match self.chunk_path(instrument, interval, b) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "chunk path");
                    continue;
                }
            };
            match self.write_chunk(&path, &chunk).await {
                Ok(true) => {
                    SERIES_CHUNKS.with_label_values(&[K::DIR, "write"]).inc();
                    debug!(path = %path.display(), count = chunk.len(), "chunk written");
                }
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "chunk write failed"),
            }
        }
    }

    /// Write-once: temp file then rename; an existing chunk is left alone.
    async fn write_chunk(&self, path: &Path, chunk: &[K::Point]) -> VenueResult<bool> {
        if fs::try_exists(path).await.unwrap_or(false) {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = K::encode(chunk)?;
        let tmp = path.with_extension(format!("{}.tmp{}", K::EXT, std::process::id()));
        fs::write(&tmp, &bytes).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(true)
    }

    async fn fill_gap(
        &self,
        instrument: &str,
        interval: Option<&str>,
        gap: &[Bucket],
        result: &mut Vec<K::Point>,
    ) -> VenueResult<()> {
        let (Some(first), Some(last)) = (gap.first(), gap.last()) else { return Ok(()) };
        let pulled = self.pull(instrument, interval, first.start, last.end).await?;
        if pulled.complete {
            self.persist(instrument, interval, gap, &pulled.points).await;
        }
        result.extend(pulled.points);
        Ok(())
    }

    /// Points with `t0 <= ts < t1`, strictly ascending, no duplicates.
    pub async fn get(&self, instrument: &str, interval: Option<&str>, t0: i64, t1: i64) -> VenueResult<Vec<K::Point>> {
        if t1 <= t0 {
            return Ok(Vec::new());
        }
        let mut result: Vec<K::Point> = Vec::new();
        if !self.cfg.enabled {
            let pulled = self.pull(instrument, interval, t0, t1).await?;
            result = pulled.points;
        } else {
            let buckets = K::BUCKETING.enumerate(t0, t1)?;
            let mut gap: Vec<Bucket> = Vec::new();
            for b in &buckets {
                let path = self.chunk_path(instrument, interval, b)?;
                match self.read_chunk(&path).await {
                    Some(points) => {
                        SERIES_CHUNKS.with_label_values(&[K::DIR, "hit"]).inc();
                        self.fill_gap(instrument, interval, &gap, &mut result).await?;
                        gap.clear();
                        result.extend(points);
                    }
                    None => {
                        SERIES_CHUNKS.with_label_values(&[K::DIR, "miss"]).inc();
                        gap.push(*b);
                    }
                }
            }
            self.fill_gap(instrument, interval, &gap, &mut result).await?;
        }

        result.retain(|p| (t0..t1).contains(&K::ts(p)));
        result.sort_by_key(|p| K::ts(p));
        result.dedup_by_key(|p| K::ts(p));
        info!(venue = %self.venue, kind = K::DIR, instrument, t0, t1, count = result.len(), "series served");
        Ok(result)
    }
}

impl SeriesCache<Klines> {
    pub async fn get_kline(&self, instrument: &str, interval: &str, t0: i64, t1: i64) -> VenueResult<Vec<Kline>> {
        if interval_ms(interval).is_none() {
            return Err(VenueError::InvalidRequest(format!("bad kline interval {interval}")));
        }
        self.get(instrument, Some(interval), t0, t1).await
    }
}

impl SeriesCache<FundingFees> {
    pub async fn get_funding_fees(&self, instrument: &str, t0: i64, t1: i64) -> VenueResult<Vec<FundingRate>> {
        self.get(instrument, None, t0, t1).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> i64 {
        midnight_ms(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn day_and_month_buckets() {
        let b = Bucketing::Day.enumerate(day(2024, 1, 1) + 5, day(2024, 1, 3)).unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].start, day(2024, 1, 1));
        assert_eq!(Bucketing::Day.name(&b[1]).unwrap(), "20240102");

        let m = Bucketing::Month.enumerate(day(2023, 12, 15), day(2024, 2, 1) + 1).unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m[1], Bucket { start: day(2024, 1, 1), end: day(2024, 2, 1) });
        assert_eq!(Bucketing::Month.name(&m[0]).unwrap(), "202312");
    }

    #[test]
    fn kline_records_are_48_bytes() {
        let k = Kline { open_time: 60_000, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 10.0 };
        let bytes = Klines::encode(&[k, k]).unwrap();
        assert_eq!(bytes.len(), 96);
        assert_eq!(Klines::decode(&bytes).unwrap()[1], k);
        assert!(Klines::decode(&bytes[..47]).is_err());
    }

    #[test]
    fn only_dense_kline_chunks_persist() {
        let b = Bucket { start: 0, end: 180_000 };
        let k = |t: i64| Kline { open_time: t, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 0.0 };
        assert!(Klines::persistable(&[k(0), k(60_000), k(120_000)], &b, Some(60_000)));
        assert!(!Klines::persistable(&[k(0), k(120_000)], &b, Some(60_000)));
        assert!(!Klines::persistable(&[k(0), k(60_000), k(120_000)], &b, None));
    }

    #[test]
    fn intervals() {
        assert_eq!(interval_ms("1m"), Some(60_000));
        assert_eq!(interval_ms("4h"), Some(14_400_000));
        assert_eq!(interval_ms("1d"), Some(86_400_000));
        assert_eq!(interval_ms("m"), None);
        assert_eq!(interval_ms("3x"), None);
    }
}
