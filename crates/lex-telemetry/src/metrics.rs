use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Histogram for upstream call latency.
pub const UPSTREAM_DURATION: &str = "upstream_request_duration_seconds";
/// Histogram for HTTP handler latency.
pub const HTTP_DURATION: &str = "http_request_duration_seconds";

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Distribution of observed values across fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    pub sum: AtomicU64,
    pub count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 sum stored as bits for atomic add
        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Latency buckets in seconds, sized for a remote JSON API.
fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing series of one metric family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    /// Format as `{key="value",key2="value2"}`. Quotes and backslashes in
    /// values are escaped.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of counters, gauges, and histograms.
///
/// Families are registered lazily under a write lock; updates to an existing
/// series only take the read lock.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    /// A collector with the gateway's latency histograms pre-registered so
    /// they appear in exports before the first observation.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        {
            let mut h = write(&collector.histograms);
            for name in [UPSTREAM_DURATION, HTTP_DURATION] {
                h.insert(name.to_string(), Histogram::new(default_duration_buckets()));
            }
        }
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.counters);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = write(&self.counters);
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        read(&self.gauges)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with default buckets if needed.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = read(&self.histograms);
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    /// `(count, sum)` of a histogram, if registered.
    pub fn histogram_summary(&self, name: &str) -> Option<(u64, f64)> {
        read(&self.histograms)
            .get(name)
            .map(|h| (h.get_count(), h.get_sum()))
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&str> = grouped.keys().copied().collect();
            names.sort_unstable();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                let mut entries = grouped[name].clone();
                entries.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
                for (labels, value) in entries {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = read(&self.gauges);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} gauge\n", name));
                out.push_str(&format!("{} {}\n", name, map[name].load(Ordering::Relaxed)));
            }
        }

        {
            let map = read(&self.histograms);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {} histogram\n", name));
                // bucket counts are already cumulative (observe bumps every bucket >= value)
                for (i, boundary) in h.buckets.iter().enumerate() {
                    out.push_str(&format!(
                        "{}_bucket{{le=\"{}\"}} {}\n",
                        name,
                        boundary,
                        h.counts[i].load(Ordering::Relaxed)
                    ));
                }
                out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, h.get_count()));
                out.push_str(&format!("{}_sum {}\n", name, h.get_sum()));
                out.push_str(&format!("{}_count {}\n", name, h.get_count()));
            }
        }

        out
    }

    /// All metrics as one JSON document.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters_json = serde_json::Map::new();
        for ((name, labels), val) in read(&self.counters).iter() {
            let key = if labels.0.is_empty() {
                name.clone()
            } else {
                format!("{}{}", name, labels.prometheus_str())
            };
            counters_json.insert(key, serde_json::json!(val.load(Ordering::Relaxed)));
        }

        let mut gauges_json = serde_json::Map::new();
        for (name, val) in read(&self.gauges).iter() {
            gauges_json.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
        }

        let mut histograms_json = serde_json::Map::new();
        for (name, h) in read(&self.histograms).iter() {
            let buckets: Vec<serde_json::Value> = h
                .buckets
                .iter()
                .enumerate()
                .map(|(i, b)| serde_json::json!({ "le": b, "count": h.counts[i].load(Ordering::Relaxed) }))
                .collect();
            histograms_json.insert(
                name.clone(),
                serde_json::json!({ "buckets": buckets, "sum": h.get_sum(), "count": h.get_count() }),
            );
        }

        serde_json::json!({
            "counters": counters_json,
            "gauges": gauges_json,
            "histograms": histograms_json,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Process-wide collector shared by the HTTP layer and the tool pipeline.
pub fn global_metrics() -> &'static MetricsCollector {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::with_defaults)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_by_labels() {
        let m = MetricsCollector::new();
        m.increment_counter("tool_calls_total", &[("tool", "get_opinion"), ("outcome", "ok")]);
        m.increment_counter("tool_calls_total", &[("outcome", "ok"), ("tool", "get_opinion")]);
        m.increment_counter("tool_calls_total", &[("tool", "get_opinion"), ("outcome", "error")]);

        // label order does not matter
        assert_eq!(
            m.get_counter("tool_calls_total", &[("tool", "get_opinion"), ("outcome", "ok")]),
            2
        );
        assert_eq!(
            m.get_counter("tool_calls_total", &[("tool", "get_opinion"), ("outcome", "error")]),
            1
        );
    }

    #[test]
    fn test_histogram_record() {
        let m = MetricsCollector::with_defaults();
        m.record_histogram(UPSTREAM_DURATION, 0.05);
        m.record_histogram(UPSTREAM_DURATION, 0.5);
        m.record_histogram(UPSTREAM_DURATION, 2.0);

        let (count, sum) = m.histogram_summary(UPSTREAM_DURATION).unwrap();
        assert_eq!(count, 3);
        assert!((sum - 2.55).abs() < 0.001);
    }

    #[test]
    fn test_histogram_buckets_cumulative() {
        let h = Histogram::new(vec![0.1, 1.0]);
        h.observe(0.05);
        h.observe(0.5);
        h.observe(5.0);
        assert_eq!(h.counts[0].load(Ordering::Relaxed), 1);
        assert_eq!(h.counts[1].load(Ordering::Relaxed), 2);
        assert_eq!(h.get_count(), 3);
    }

    #[test]
    fn test_label_escaping() {
        let l = Labels::new(&[("client", "a\"b")]);
        assert_eq!(l.prometheus_str(), "{client=\"a\\\"b\"}");
    }
}
