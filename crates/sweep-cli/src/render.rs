//! Rendering merged parameters into a configuration template.
//!
//! Parameter names are key-paths into the template. Both `overall.max_time`
//! and `./overall/max_time` address `{"overall": {"max_time": ...}}` in a
//! JSON template and `<root><overall><max_time>` in an XML one. Paths that
//! do not exist in the template are skipped, as are excluded paths.
//!
//! Cell values arrive as text. When a JSON template already holds a number
//! or boolean at the target and the text parses as one, the parsed value is
//! written so the consumer keeps seeing the type it expects. XML elements
//! simply receive the text.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesStart, BytesText, Event};
use serde_json::Value;
use sweep_core::ParameterMap;
use sweep_core::config::TemplateFormat;
use sweep_core::overlay::scalar_text;

/// Splits a key-path into its segments.
#[must_use]
pub fn key_segments(key: &str) -> Vec<&str> {
    let key = key.trim();
    if let Some(rest) = key.strip_prefix("./") {
        rest.split('/').filter(|s| !s.is_empty()).collect()
    } else if key.contains('/') {
        key.split('/').filter(|s| !s.is_empty()).collect()
    } else {
        key.split('.').filter(|s| !s.is_empty()).collect()
    }
}

/// Writes `parameters` into `document` in place.
///
/// Returns the number of values written.
pub fn apply_parameters(document: &mut Value, parameters: &ParameterMap, exclude: &[String]) -> usize {
    let excluded: HashSet<Vec<&str>> = exclude.iter().map(|key| key_segments(key)).collect();
    let mut written = 0;

    for (key, value) in parameters {
        let segments = key_segments(key);
        if segments.is_empty() || excluded.contains(&segments) {
            continue;
        }
        let Some(slot) = lookup_mut(document, &segments) else {
            tracing::trace!(key = %key, "key-path not in template, skipped");
            continue;
        };
        *slot = conform(slot, value);
        written += 1;
    }
    written
}

fn lookup_mut<'a>(document: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    segments.iter().try_fold(document, |node, segment| match node {
        Value::Object(map) => map.get_mut(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

fn conform(existing: &Value, value: &Value) -> Value {
    let Value::String(text) = value else {
        return value.clone();
    };
    let text = text.trim();
    match existing {
        Value::Number(_) => text
            .parse::<i64>()
            .map(Value::from)
            .ok()
            .or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
            })
            .unwrap_or_else(|| value.clone()),
        Value::Bool(_) => match text.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Writes `parameters` into the elements of an XML document.
///
/// Key-paths are resolved below the root element and only the first
/// matching element is written; its previous content is replaced by the
/// value's text. Returns the rewritten document and the number of values
/// written.
///
/// # Errors
///
/// Returns an error if the document is not well-formed XML.
pub fn apply_xml_parameters(
    document: &str,
    parameters: &ParameterMap,
    exclude: &[String],
) -> Result<(String, usize)> {
    let excluded: HashSet<Vec<&str>> = exclude.iter().map(|key| key_segments(key)).collect();
    let mut pending: HashMap<Vec<String>, String> = parameters
        .iter()
        .filter_map(|(key, value)| {
            let segments = key_segments(key);
            (!segments.is_empty() && !excluded.contains(&segments)).then(|| {
                let path = segments.into_iter().map(str::to_string).collect();
                (path, scalar_text(value))
            })
        })
        .collect();

    let mut reader = Reader::from_str(document);
    let mut writer = Writer::new(Vec::new());
    let mut path: Vec<String> = Vec::new();
    let mut written = 0;
    // Nesting depth inside an element whose content is being replaced.
    let mut replacing: Option<usize> = None;

    loop {
        let event = reader
            .read_event()
            .with_context(|| format!("Malformed XML at byte {}", reader.buffer_position()))?;

        if let Some(depth) = replacing {
            match event {
                Event::Start(_) => replacing = Some(depth + 1),
                Event::End(end) if depth == 0 => {
                    path.pop();
                    writer.write_event(Event::End(end))?;
                    replacing = None;
                }
                Event::End(_) => replacing = Some(depth - 1),
                Event::Eof => bail!("XML ended inside <{}>", path.join("/")),
                _ => {}
            }
            continue;
        }

        match event {
            Event::Start(start) => {
                path.push(element_name(&start));
                let value = take_value(&mut pending, &path);
                writer.write_event(Event::Start(start))?;
                if let Some(text) = value {
                    writer.write_event(Event::Text(BytesText::new(&text)))?;
                    written += 1;
                    replacing = Some(0);
                }
            }
            Event::Empty(start) => {
                path.push(element_name(&start));
                let value = take_value(&mut pending, &path);
                path.pop();
                if let Some(text) = value {
                    let end = start.to_end().into_owned();
                    writer.write_event(Event::Start(start))?;
                    writer.write_event(Event::Text(BytesText::new(&text)))?;
                    writer.write_event(Event::End(end))?;
                    written += 1;
                } else {
                    writer.write_event(Event::Empty(start))?;
                }
            }
            Event::End(end) => {
                path.pop();
                writer.write_event(Event::End(end))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    for key in pending.keys() {
        tracing::trace!(key = %key.join("/"), "key-path not in template, skipped");
    }
    let rendered = String::from_utf8(writer.into_inner()).context("Rendered XML is not UTF-8")?;
    Ok((rendered, written))
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

/// Removes the value addressed by `path`; the root element itself is never
/// addressed.
fn take_value(pending: &mut HashMap<Vec<String>, String>, path: &[String]) -> Option<String> {
    path.split_first()
        .filter(|(_, below_root)| !below_root.is_empty())
        .and_then(|(_, below_root)| pending.remove(below_root))
}

/// Reads `template`, applies `parameters`, and writes the result to `output`.
///
/// # Errors
///
/// Returns an error if the template cannot be read or parsed, or the output
/// cannot be written.
pub fn render_template(
    template: &Path,
    output: &Path,
    format: TemplateFormat,
    parameters: &ParameterMap,
    exclude: &[String],
) -> Result<usize> {
    let raw = std::fs::read_to_string(template)
        .with_context(|| format!("Failed to read template {}", template.display()))?;

    let (rendered, written) = match format {
        TemplateFormat::Json => {
            let mut document: Value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse template {}", template.display()))?;
            let written = apply_parameters(&mut document, parameters, exclude);
            let rendered =
                serde_json::to_string_pretty(&document).context("Failed to serialize config")?;
            (rendered, written)
        }
        TemplateFormat::Xml => apply_xml_parameters(&raw, parameters, exclude)
            .with_context(|| format!("Failed to render template {}", template.display()))?,
    };

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(output, rendered)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> ParameterMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn key_path_forms() {
        assert_eq!(key_segments("overall.max_time"), ["overall", "max_time"]);
        assert_eq!(key_segments("./overall/max_time"), ["overall", "max_time"]);
        assert_eq!(key_segments("save/folder"), ["save", "folder"]);
        assert_eq!(key_segments("threads"), ["threads"]);
    }

    #[test]
    fn writes_existing_paths_only() {
        let mut doc = json!({
            "overall": { "max_time": 100, "dt": 0.01 },
            "save": { "folder": "out", "enabled": false },
            "cells": [ { "count": 1 } ]
        });
        let parameters = params(&[
            ("./overall/max_time", json!("2880")),
            ("overall.dt", json!("0.5")),
            ("save.enabled", json!("TRUE")),
            ("save.folder", json!("output/test1")),
            ("cells.0.count", json!("12")),
            ("missing.key", json!("x")),
            ("id", json!("test1")),
        ]);

        let written = apply_parameters(&mut doc, &parameters, &[]);

        assert_eq!(written, 5);
        assert_eq!(
            doc,
            json!({
                "overall": { "max_time": 2880, "dt": 0.5 },
                "save": { "folder": "output/test1", "enabled": true },
                "cells": [ { "count": 12 } ]
            })
        );
    }

    #[test]
    fn excluded_paths_are_never_written() {
        let mut doc = json!({ "overall": { "max_time": 100 }, "seed": 1 });
        let parameters = params(&[("overall.max_time", json!("5")), ("seed", json!(9))]);

        apply_parameters(&mut doc, &parameters, &["./overall/max_time".to_string()]);

        assert_eq!(doc, json!({ "overall": { "max_time": 100 }, "seed": 9 }));
    }

    #[test]
    fn unparseable_text_is_written_verbatim() {
        let mut doc = json!({ "n": 1 });
        apply_parameters(&mut doc, &params(&[("n", json!("many"))]), &[]);
        assert_eq!(doc, json!({ "n": "many" }));
    }

    #[test]
    fn render_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("default.json");
        let output = dir.path().join("runs/test1/settings.json");
        std::fs::write(&template, r#"{"overall":{"max_time":1}}"#).unwrap();

        let written = render_template(
            &template,
            &output,
            TemplateFormat::Json,
            &params(&[("overall.max_time", json!("2880"))]),
            &[],
        )
        .unwrap();

        assert_eq!(written, 1);
        let rendered: Value = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(rendered, json!({ "overall": { "max_time": 2880 } }));
    }

    const SETTINGS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PhysiCell_settings version="devel-version">
    <overall>
        <max_time units="min">14400</max_time>
        <dt_diffusion units="min">0.01</dt_diffusion>
    </overall>
    <save>
        <folder>output</folder>
        <full_data enabled="true"/>
    </save>
    <user_parameters>
        <random_seed type="int">0</random_seed>
        <number_of_workers type="int">50</number_of_workers>
    </user_parameters>
</PhysiCell_settings>
"#;

    #[test]
    fn xml_leaf_text_is_replaced_in_place() {
        let parameters = params(&[
            ("./overall/max_time", json!("2880")),
            ("./user_parameters/number_of_workers", json!("10")),
            ("./save/folder", json!("out & <back>")),
            ("./missing/tag", json!("1")),
            ("id", json!("test1")),
        ]);

        let (rendered, written) = apply_xml_parameters(SETTINGS, &parameters, &[]).unwrap();

        assert_eq!(written, 3);
        assert!(rendered.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(rendered.contains(r#"<max_time units="min">2880</max_time>"#));
        assert!(rendered.contains(r#"<number_of_workers type="int">10</number_of_workers>"#));
        assert!(rendered.contains("<folder>out &amp; &lt;back&gt;</folder>"));
        assert!(rendered.contains(r#"<dt_diffusion units="min">0.01</dt_diffusion>"#));
        assert!(rendered.contains(r#"<random_seed type="int">0</random_seed>"#));
    }

    #[test]
    fn xml_exclusions_and_empty_elements() {
        let parameters = params(&[
            ("./overall/max_time", json!("2880")),
            ("./save/full_data", json!("false")),
        ]);

        let (rendered, written) =
            apply_xml_parameters(SETTINGS, &parameters, &["overall.max_time".to_string()]).unwrap();

        assert_eq!(written, 1);
        assert!(rendered.contains(r#"<max_time units="min">14400</max_time>"#));
        assert!(rendered.contains(r#"<full_data enabled="true">false</full_data>"#));
    }

    #[test]
    fn xml_root_is_not_addressable_and_bad_xml_fails() {
        let (rendered, written) =
            apply_xml_parameters("<a><b>1</b></a>", &params(&[("a", json!("x"))]), &[]).unwrap();
        assert_eq!(written, 0);
        assert_eq!(rendered, "<a><b>1</b></a>");

        assert!(apply_xml_parameters("<a><b>1</a>", &ParameterMap::new(), &[]).is_err());
    }

    #[test]
    fn render_xml_template_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("PhysiCell_settings_default.xml");
        let output = dir.path().join("config/PhysiCell_settings.xml");
        std::fs::write(&template, SETTINGS).unwrap();

        let written = render_template(
            &template,
            &output,
            TemplateFormat::from_path(&template),
            &params(&[("./overall/max_time", json!(2880))]),
            &[],
        )
        .unwrap();

        assert_eq!(written, 1);
        let rendered = std::fs::read_to_string(&output).unwrap();
        assert!(rendered.contains(r#"<max_time units="min">2880</max_time>"#));
    }
}
