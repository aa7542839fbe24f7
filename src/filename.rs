//! Output filename template expansion (spec.md §4.G's "Filename policy").
//!
//! Grounded on `examples/original_source/src/recstation/tprintf.go`
//! (`Tsprintf`) and `main.go`'s `MakeFilenameMaker`. Deliberately
//! dependency-free beyond `chrono` for the `{{timestamp}}` token, exactly as
//! the original keeps this as a trivial string-substitution helper rather
//! than a templating engine.

use std::collections::HashMap;

use chrono::Local;

/// Substitutes every `{{key}}` occurrence in `template` with `params[key]`,
/// leaving unknown placeholders untouched (mirrors `strings.Replace` called
/// once per known key, same as the original).
pub fn expand(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, val) in params {
        out = out.replace(&format!("{{{{{}}}}}", key), val);
    }
    out
}

/// Builds the substitution parameters for one filename-maker invocation:
/// `{{hostname}}`, `{{stream}}`, `{{year}}`, `{{month}}`, `{{day}}`,
/// `{{timestamp}}` (formatted per `timestamp_format`), and `{{start}}`
/// (`1`/`0`).
pub fn params(hostname: &str, stream: &str, timestamp_format: &str, start: bool) -> HashMap<String, String> {
    let now = Local::now();

    let mut params = HashMap::with_capacity(6);
    params.insert("hostname".to_string(), hostname.to_string());
    params.insert("stream".to_string(), stream.to_string());
    params.insert("year".to_string(), format!("{:04}", now.format("%Y")));
    params.insert("month".to_string(), format!("{:02}", now.format("%m")));
    params.insert("day".to_string(), format!("{:02}", now.format("%d")));
    params.insert("timestamp".to_string(), now.format(timestamp_format).to_string());
    params.insert("start".to_string(), if start { "1" } else { "0" }.to_string());
    params
}

/// Builds a [`crate::sink::Namer`] closure for `stream` against `settings`,
/// the Rust analogue of the original's `MakeFilenameMaker`.
pub fn namer(
    template: String,
    timestamp_format: String,
    hostname: String,
    stream: String,
) -> impl Fn(bool) -> String + Send + 'static {
    move |start: bool| expand(&template, &params(&hostname, &stream, &timestamp_format, start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_substitutes_known_placeholders() {
        let mut params = HashMap::new();
        params.insert("hostname".to_string(), "rec1".to_string());
        params.insert("stream".to_string(), "cam1".to_string());

        let out = expand("{{hostname}}/{{stream}}.ts", &params);
        assert_eq!(out, "rec1/cam1.ts");
    }

    #[test]
    fn expand_leaves_unknown_placeholders_untouched() {
        let params = HashMap::new();
        let out = expand("{{nope}}.ts", &params);
        assert_eq!(out, "{{nope}}.ts");
    }

    #[test]
    fn params_reports_start_as_one_or_zero() {
        let started = params("host", "cam1", "%Y%m%d", true);
        assert_eq!(started.get("start").unwrap(), "1");

        let rotated = params("host", "cam1", "%Y%m%d", false);
        assert_eq!(rotated.get("start").unwrap(), "0");
    }

    #[test]
    fn namer_expands_the_configured_template() {
        let make = namer(
            "{{hostname}}/{{stream}}-{{start}}.ts".to_string(),
            "%Y%m%d".to_string(),
            "rec1".to_string(),
            "cam1".to_string(),
        );
        assert_eq!(make(true), "rec1/cam1-1.ts");
        assert_eq!(make(false), "rec1/cam1-0.ts");
    }
}
