//! XML encoding of metrics documents
//!
//! Documents are rendered with a two-space indent:
//!
//! ```text
//! <metrics>
//!   <metric type="real64" context="host" unit="s">
//!     <name>TotalCPUTime</name>
//!     <value>1234.560000</value>
//!   </metric>
//! </metrics>
//! ```
//!
//! Callers append their own trailing newlines.

use crate::models::{Metric, MetricContext, MetricType, MetricsDocument};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

const ROOT: &str = "metrics";
const METRIC: &str = "metric";

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("xml syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),

    #[error("xml write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("document root is not <metrics>")]
    MissingRoot,

    #[error("metric is missing <{0}>")]
    MissingField(&'static str),

    #[error("invalid {attribute} attribute: {value:?}")]
    InvalidAttribute {
        attribute: &'static str,
        value: String,
    },
}

/// Encode a document as indented XML without a trailing newline
pub fn encode_document(doc: &MetricsDocument) -> Result<Vec<u8>, XmlError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Start(BytesStart::new(ROOT)))?;
    for metric in doc.iter() {
        let mut start = BytesStart::new(METRIC);
        start.push_attribute(("type", metric.metric_type.as_str()));
        start.push_attribute(("context", metric.context.as_str()));
        if let Some(unit) = metric.unit.as_deref() {
            start.push_attribute(("unit", unit));
        }
        writer.write_event(Event::Start(start))?;
        write_text_element(&mut writer, "name", &metric.name)?;
        write_text_element(&mut writer, "value", &metric.value)?;
        writer.write_event(Event::End(BytesEnd::new(METRIC)))?;
    }
    writer.write_event(Event::End(BytesEnd::new(ROOT)))?;

    Ok(writer.into_inner())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    tag: &str,
    text: &str,
) -> Result<(), XmlError> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

#[derive(Clone, Copy)]
enum Field {
    Name,
    Value,
}

#[derive(Default)]
struct PartialMetric {
    metric_type: Option<MetricType>,
    context: Option<MetricContext>,
    unit: Option<String>,
    name: Option<String>,
    value: Option<String>,
}

impl PartialMetric {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let mut partial = PartialMetric::default();

        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let value = attr.unescape_value()?;
            match attr.key.as_ref() {
                b"type" => {
                    partial.metric_type = Some(MetricType::parse(&value).ok_or_else(|| {
                        XmlError::InvalidAttribute {
                            attribute: "type",
                            value: value.to_string(),
                        }
                    })?);
                }
                b"context" => {
                    partial.context = Some(MetricContext::parse(&value).ok_or_else(|| {
                        XmlError::InvalidAttribute {
                            attribute: "context",
                            value: value.to_string(),
                        }
                    })?);
                }
                b"unit" if !value.is_empty() => partial.unit = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(partial)
    }

    fn set(&mut self, field: Field, text: String) {
        let slot = match field {
            Field::Name => &mut self.name,
            Field::Value => &mut self.value,
        };
        match slot {
            Some(existing) => existing.push_str(&text),
            None => *slot = Some(text),
        }
    }

    fn finish(self) -> Result<Metric, XmlError> {
        Ok(Metric::from_parts(
            self.name.ok_or(XmlError::MissingField("name"))?,
            self.context.ok_or(XmlError::MissingField("context"))?,
            self.metric_type.ok_or(XmlError::MissingField("type"))?,
            // <value></value> is a legitimate empty string metric
            self.value.unwrap_or_default(),
            self.unit,
        ))
    }
}

/// Decode a document produced by [`encode_document`]
///
/// Whitespace between elements is ignored; text inside `<name>` and
/// `<value>` is kept verbatim.
pub fn decode_document(payload: &[u8]) -> Result<MetricsDocument, XmlError> {
    let text = std::str::from_utf8(payload)?;
    let mut reader = Reader::from_str(text);

    let mut doc = MetricsDocument::new();
    let mut seen_root = false;
    let mut current: Option<PartialMetric> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => match start.name().as_ref() {
                b"metrics" => seen_root = true,
                b"metric" if seen_root => current = Some(PartialMetric::from_start(&start)?),
                b"name" => field = Some(Field::Name),
                b"value" => field = Some(Field::Value),
                _ => {}
            },
            Event::Empty(start) => match start.name().as_ref() {
                b"metrics" => seen_root = true,
                b"metric" if seen_root => {
                    // a metric without children cannot carry a name
                    return Err(XmlError::MissingField("name"));
                }
                _ => {}
            },
            Event::Text(text) => {
                if let (Some(metric), Some(field)) = (current.as_mut(), field) {
                    metric.set(field, text.unescape()?.into_owned());
                }
            }
            Event::End(end) => match end.name().as_ref() {
                b"metric" => {
                    if let Some(metric) = current.take() {
                        doc.push(metric.finish()?);
                    }
                }
                b"name" | b"value" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(XmlError::MissingRoot);
    }

    Ok(doc)
}
