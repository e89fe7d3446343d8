//! Turning a subscription's stored query string into a render request.

use chrono::NaiveDateTime;
use serde::Serialize;

use super::{DefaultExpr, Report};
use crate::config::{SettingsSource, ALLOW_COMPUTED_DEFAULTS};
use crate::domain::ValidationError;

/// Marker key telling the render service to fill in its own defaults.
pub const USE_DEFAULTS: &str = "use_defaults";

/// Everything the render service needs to produce one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRequest {
    pub report_id: i64,
    pub params: Vec<(String, String)>,
    pub use_defaults: bool,
}

impl ReportRequest {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Encode as an `application/x-www-form-urlencoded` query string.
    pub fn query_string(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.params {
            ser.append_pair(k, v);
        }
        if self.use_defaults {
            ser.append_key_only(USE_DEFAULTS);
        }
        ser.finish()
    }
}

/// Resolve the parameters for one delivery.
///
/// Stored overrides win. With no overrides, a report that declares
/// parameters is rendered with `use_defaults`. When computed defaults are
/// enabled, parameters left blank (or absent under `use_defaults`) are
/// filled from their default expression.
pub fn resolve_parameters(
    report: &Report,
    stored: Option<&str>,
    settings: &dyn SettingsSource,
    now: NaiveDateTime,
) -> Result<ReportRequest, ValidationError> {
    let stored = stored
        .map(|s| s.trim().trim_start_matches('?'))
        .filter(|s| !s.is_empty());

    let mut request = ReportRequest {
        report_id: report.id,
        params: Vec::new(),
        use_defaults: false,
    };

    match stored {
        Some(query) => {
            for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
                if k == USE_DEFAULTS {
                    request.use_defaults = true;
                } else {
                    request.params.push((k.into_owned(), v.into_owned()));
                }
            }
        }
        None => request.use_defaults = !report.parameters.is_empty(),
    }

    if !settings.flag(ALLOW_COMPUTED_DEFAULTS) {
        return Ok(request);
    }

    for param in &report.parameters {
        let Some(expr) = param.default_expr.as_deref().filter(|e| !e.trim().is_empty()) else {
            continue;
        };
        let slot = request.params.iter().position(|(k, _)| *k == param.name);
        let needs_value = match slot {
            Some(i) => request.params[i].1.trim().is_empty(),
            None => request.use_defaults,
        };
        if !needs_value {
            continue;
        }

        let value = expr.parse::<DefaultExpr>()?.evaluate(now);
        match slot {
            Some(i) => request.params[i].1 = value,
            None => request.params.push((param.name.clone(), value)),
        }
    }

    Ok(request)
}
