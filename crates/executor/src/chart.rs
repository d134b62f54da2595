//! Vega-Lite spec construction. Pure: no data access, deterministic for a
//! given input, hashed for replay.

use datagate_contracts::canonical;

use crate::GenerateChartInputs;

const SUPPORTED_CHART_TYPES: &[&str] = &["bar", "line", "point", "area"];

pub fn is_supported_chart_type(chart_type: &str) -> bool {
    SUPPORTED_CHART_TYPES.contains(&chart_type)
}

pub fn build_spec(inputs: &GenerateChartInputs) -> serde_json::Value {
    let x_type = infer_x_type(&inputs.data, &inputs.columns.x);
    let title = inputs.title.clone().unwrap_or_else(|| {
        format!("{} by {}", inputs.columns.y, inputs.columns.x)
    });

    let mut encoding = serde_json::json!({
        "x": {
            "field": inputs.columns.x,
            "type": x_type,
            "axis": {"labelAngle": -45}
        },
        "y": {
            "field": inputs.columns.y,
            "type": "quantitative",
            "axis": {"format": "~s"}
        }
    });

    if let Some(color) = inputs.columns.color.as_deref() {
        encoding["color"] = serde_json::json!({"field": color, "type": "nominal"});
    }

    serde_json::json!({
        "$schema": "https://vega.github.io/schema/vega-lite/v5.json",
        "title": {"text": title, "fontSize": 16, "fontWeight": "bold"},
        "width": 600,
        "height": 400,
        "data": {"values": inputs.data},
        "mark": {"type": inputs.chart_type, "tooltip": true},
        "encoding": encoding,
        "config": {
            "background": "#ffffff",
            "view": {"stroke": "transparent"}
        }
    })
}

/// Date-shaped strings in the x column get a temporal axis; everything else
/// is nominal.
fn infer_x_type(data: &[serde_json::Value], x_field: &str) -> &'static str {
    let Some(sample) = data.first().and_then(|row| row.get(x_field)) else {
        return "nominal";
    };
    match sample.as_str() {
        Some(s) if s.contains('-') || s.contains('/') => "temporal",
        _ => "nominal",
    }
}

pub fn data_hash(data: &[serde_json::Value]) -> String {
    let value = serde_json::Value::Array(data.to_vec());
    canonical::hash_canonical_json(&value)[..16].to_string()
}
