use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

/// Prices seen during one time bucket
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSegment {
    pub start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub mean: f64, // Running average of every tick in the bucket
    pub count: u64,
}

impl PriceSegment {
    fn new(start: DateTime<Utc>, price: f64) -> Self {
        Self {
            start,
            open: price,
            high: price,
            low: price,
            mean: price,
            count: 1,
        }
    }

    fn aggregate(&mut self, price: f64) {
        self.mean = (self.mean * self.count as f64 + price) / (self.count + 1) as f64;
        self.count += 1;

        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
    }
}

/// Averages across the retained segments of one asset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceWindow {
    /// Open of the oldest retained bucket
    pub open: f64,
    /// Mean of the segment means
    pub mid: f64,
    /// Mean of the segment highs
    pub ceiling: f64,
    /// Mean of the segment lows
    pub floor: f64,
    pub segments: usize,
}

/// Thread-safe time-bucketed price aggregation
///
/// Keeps the last `capacity` buckets per asset. Instantaneous ticks are too
/// noisy to anchor triggers on, so baselines come from these windows.
pub struct FeedAggregator {
    segments: DashMap<String, VecDeque<PriceSegment>>,
    bucket: Duration,
    capacity: usize,
}

impl FeedAggregator {
    /// # Arguments
    /// * `bucket_secs` - Width of each bucket
    /// * `capacity` - Buckets retained per asset
    pub fn new(bucket_secs: i64, capacity: usize) -> Self {
        Self {
            segments: DashMap::new(),
            bucket: Duration::seconds(bucket_secs.max(1)),
            capacity: capacity.max(1),
        }
    }

    fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.bucket.num_seconds();
        let start = at.timestamp().div_euclid(width) * width;
        DateTime::from_timestamp(start, 0).unwrap_or(at)
    }

    /// Fold one tick into its bucket
    pub fn record(&self, asset_id: &str, price: f64, at: DateTime<Utc>) {
        let start = self.bucket_start(at);
        let mut buckets = self.segments.entry(asset_id.to_string()).or_default();

        match buckets.back().map(|s| s.start) {
            Some(last) if last >= start => {
                // Late ticks fold into their bucket if it is still retained
                if let Some(segment) = buckets.iter_mut().rev().find(|s| s.start == start) {
                    segment.aggregate(price);
                }
            }
            _ => buckets.push_back(PriceSegment::new(start, price)),
        }

        while buckets.len() > self.capacity {
            buckets.pop_front();
        }
    }

    /// Retained segments for an asset, oldest first
    pub fn segments(&self, asset_id: &str) -> Vec<PriceSegment> {
        self.segments
            .get(asset_id)
            .map(|buckets| buckets.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rolling open/mid/high/low, or None before the first tick
    pub fn window(&self, asset_id: &str) -> Option<PriceWindow> {
        let buckets = self.segments.get(asset_id)?;
        let first = buckets.front()?;
        let n = buckets.len() as f64;

        Some(PriceWindow {
            open: first.open,
            mid: buckets.iter().map(|s| s.mean).sum::<f64>() / n,
            ceiling: buckets.iter().map(|s| s.high).sum::<f64>() / n,
            floor: buckets.iter().map(|s| s.low).sum::<f64>() / n,
            segments: buckets.len(),
        })
    }

    /// Drop assets for which `keep` is false
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.segments.retain(|asset, _| keep(asset));
    }

    pub fn assets(&self) -> Vec<String> {
        self.segments.iter().map(|e| e.key().clone()).collect()
    }
}
