//! Prometheus text exposition (format version 0.0.4).
//!
//! A pure function of a [`RecorderSnapshot`]; it never touches live metrics.

use std::collections::BTreeMap;

use crate::primitives::HistogramSnapshot;
use crate::recorder::{FamilySnapshot, RecorderSnapshot, SampleValue};

/// Content type of [`render`]'s output.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render every family in `snapshot`, in catalog order.
pub fn render(snapshot: &RecorderSnapshot) -> String {
    let mut out = String::new();
    for family in &snapshot.families {
        write_family(&mut out, family);
    }
    out
}

fn write_family(out: &mut String, family: &FamilySnapshot) {
    let metric = family.name;
    out.push_str(&format!("# HELP {metric} {}\n", escape_help(family.help)));
    out.push_str(&format!("# TYPE {metric} {}\n", family.kind.as_str()));

    for sample in &family.samples {
        match &sample.value {
            SampleValue::Scalar(value) => {
                out.push_str(&format!(
                    "{metric}{} {}\n",
                    label_set(&sample.labels, None),
                    format_value(*value)
                ));
            }
            SampleValue::Histogram(hist) => write_histogram(out, metric, &sample.labels, hist),
        }
    }
}

fn write_histogram(
    out: &mut String,
    metric: &str,
    labels: &BTreeMap<String, String>,
    hist: &HistogramSnapshot,
) {
    for bucket in &hist.buckets {
        let le = format_value(bucket.le);
        out.push_str(&format!(
            "{metric}_bucket{} {}\n",
            label_set(labels, Some(&le)),
            bucket.count
        ));
    }
    out.push_str(&format!(
        "{metric}_bucket{} {}\n",
        label_set(labels, Some("+Inf")),
        hist.inf
    ));
    out.push_str(&format!(
        "{metric}_sum{} {}\n",
        label_set(labels, None),
        format_value(hist.sum)
    ));
    out.push_str(&format!(
        "{metric}_count{} {}\n",
        label_set(labels, None),
        hist.count
    ));
}

fn label_set(labels: &BTreeMap<String, String>, le: Option<&str>) -> String {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(name, value)| format!("{name}=\"{}\"", escape_label_value(value)))
        .collect();
    if let Some(le) = le {
        pairs.push(format!("le=\"{le}\""));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::new();
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
