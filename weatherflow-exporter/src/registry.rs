//! Per-device metric registry and Prometheus text rendering.

use std::io::Write;
use std::sync::Arc;

use crate::catalog::MetricDefinition;
use crate::collector::DeviceCollector;
use crate::config::FilterConfig;
use crate::snapshot::MetricValue;

/// Glob-based filter on metric names.
#[derive(Debug, Default)]
pub struct MetricFilter {
    include_metrics: Vec<glob::Pattern>,
    exclude_metrics: Vec<glob::Pattern>,
}

impl MetricFilter {
    /// Create a new filter from configuration.
    ///
    /// Patterns that fail to compile are ignored; configuration validation
    /// rejects them before this point.
    pub fn new(config: &FilterConfig) -> Self {
        let include_metrics = config
            .include_metrics
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();

        let exclude_metrics = config
            .exclude_metrics
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();

        Self {
            include_metrics,
            exclude_metrics,
        }
    }

    /// Check if a metric should be exported.
    pub fn should_include(&self, name: &str) -> bool {
        if !self.include_metrics.is_empty() && !self.include_metrics.iter().any(|p| p.matches(name))
        {
            return false;
        }

        !self.exclude_metrics.iter().any(|p| p.matches(name))
    }
}

/// Exposition options shared by all registries.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Append the observation timestamp to every sample.
    pub timestamps: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { timestamps: true }
    }
}

/// Exporter object bound to one device session.
///
/// Enumerates definitions and current values of its collector for the scrape
/// renderer. Lives exactly as long as the session.
#[derive(Debug)]
pub struct DeviceRegistry {
    collector: Arc<DeviceCollector>,
    filter: Arc<MetricFilter>,
    options: RenderOptions,
}

impl DeviceRegistry {
    pub fn new(
        collector: Arc<DeviceCollector>,
        filter: Arc<MetricFilter>,
        options: RenderOptions,
    ) -> Self {
        Self {
            collector,
            filter,
            options,
        }
    }

    pub fn collector(&self) -> &Arc<DeviceCollector> {
        &self.collector
    }

    /// Definitions this registry exports.
    pub fn describe(&self) -> Vec<&Arc<MetricDefinition>> {
        self.collector
            .describe()
            .iter()
            .filter(|d| self.filter.should_include(&d.name))
            .collect()
    }

    /// Values currently present for exported metrics.
    pub fn collect(&self) -> Vec<MetricValue> {
        self.collector
            .collect()
            .into_iter()
            .filter(|v| self.filter.should_include(&v.definition.name))
            .collect()
    }

    /// Render the device's metrics in Prometheus exposition format.
    ///
    /// Families without an observed value are left out entirely.
    pub fn render(&self) -> String {
        let values = self.collect();
        let mut output = Vec::with_capacity(values.len() * 160);

        for value in &values {
            let def = &value.definition;

            writeln!(output, "# HELP {} {}", def.name, escape_help(&def.help)).ok();
            writeln!(output, "# TYPE {} {}", def.name, def.kind.as_str()).ok();

            let labels = format_labels(def.label_names.iter().zip(value.label_values.iter()));
            if self.options.timestamps {
                writeln!(
                    output,
                    "{}{} {} {}",
                    def.name,
                    labels,
                    format_value(value.value),
                    value.timestamp_ms
                )
                .ok();
            } else {
                writeln!(output, "{}{} {}", def.name, labels, format_value(value.value)).ok();
            }
        }

        String::from_utf8(output).unwrap_or_default()
    }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape special characters in HELP text.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format labels for Prometheus exposition format.
fn format_labels<'a>(labels: impl Iterator<Item = (&'a String, &'a String)>) -> String {
    let parts: Vec<String> = labels
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    if parts.is_empty() {
        return String::new();
    }

    format!("{{{}}}", parts.join(","))
}
