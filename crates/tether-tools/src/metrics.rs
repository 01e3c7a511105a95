//! Per-tool call metrics.

use std::collections::BTreeMap;

use serde::Serialize;

/// Call counts and latency for one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolMetrics {
    pub total_calls: u64,
    pub success_calls: u64,
    pub error_calls: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
    /// 0 until the first call.
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl ToolMetrics {
    fn record(&mut self, success: bool, duration_ms: u64) {
        if self.total_calls == 0 || duration_ms < self.min_duration_ms {
            self.min_duration_ms = duration_ms;
        }
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        self.total_calls += 1;
        if success {
            self.success_calls += 1;
        } else {
            self.error_calls += 1;
        }
        self.total_duration_ms = self.total_duration_ms.saturating_add(duration_ms);
        self.avg_duration_ms = self.total_duration_ms as f64 / self.total_calls as f64;
    }

    /// Success rate as a percentage; 100 when nothing has run.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            100.0
        } else {
            (self.success_calls as f64 / self.total_calls as f64) * 100.0
        }
    }
}

/// Aggregate over every tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub success_calls: u64,
    pub error_calls: u64,
    pub success_rate: f64,
    pub tools: BTreeMap<String, ToolMetrics>,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    tools: BTreeMap<String, ToolMetrics>,
}

impl MetricsRegistry {
    pub fn record(&mut self, tool: &str, success: bool, duration_ms: u64) {
        self.tools
            .entry(tool.to_string())
            .or_default()
            .record(success, duration_ms);
    }

    pub fn tool(&self, tool: &str) -> Option<&ToolMetrics> {
        self.tools.get(tool)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_calls: u64 = self.tools.values().map(|m| m.total_calls).sum();
        let success_calls: u64 = self.tools.values().map(|m| m.success_calls).sum();
        MetricsSnapshot {
            total_calls,
            success_calls,
            error_calls: total_calls - success_calls,
            success_rate: if total_calls == 0 {
                100.0
            } else {
                (success_calls as f64 / total_calls as f64) * 100.0
            },
            tools: self.tools.clone(),
        }
    }

    pub fn reset(&mut self) {
        self.tools.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_counts_and_latency() {
        let mut registry = MetricsRegistry::default();
        registry.record("fetch", true, 30);
        registry.record("fetch", false, 10);
        registry.record("fetch", true, 50);

        let m = registry.tool("fetch").unwrap();
        assert_eq!(m.total_calls, 3);
        assert_eq!(m.success_calls, 2);
        assert_eq!(m.error_calls, 1);
        assert_eq!(m.total_duration_ms, 90);
        assert_eq!(m.avg_duration_ms, 30.0);
        assert_eq!(m.min_duration_ms, 10);
        assert_eq!(m.max_duration_ms, 50);
    }

    #[test]
    fn first_call_sets_min_even_when_slow() {
        let mut registry = MetricsRegistry::default();
        registry.record("slow", true, 900);
        assert_eq!(registry.tool("slow").unwrap().min_duration_ms, 900);
    }

    #[test]
    fn snapshot_aggregates_tools() {
        let mut registry = MetricsRegistry::default();
        registry.record("a", true, 1);
        registry.record("b", false, 1);
        registry.record("b", true, 1);
        registry.record("b", true, 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.error_calls, 1);
        assert_eq!(snapshot.success_rate, 75.0);
        assert_eq!(snapshot.tools.len(), 2);
    }

    #[test]
    fn empty_rates_and_reset() {
        let mut registry = MetricsRegistry::default();
        assert_eq!(registry.snapshot().success_rate, 100.0);
        assert_eq!(ToolMetrics::default().success_rate(), 100.0);

        registry.record("a", true, 5);
        registry.reset();
        assert!(registry.tool("a").is_none());
        assert_eq!(registry.snapshot().total_calls, 0);
    }
}
