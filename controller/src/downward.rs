//! Templates over Kubernetes downward-API data.
//!
//! The node id and cluster templates on an [`Envoy`](crate::Envoy) may reference pod and node
//! metadata, e.g. `{{ .PodName }}.{{ .PodNamespace }}` or `{{ .PodLabels.app }}`. The controller
//! only needs to know *which* data is referenced so that it can expose it to the pod; the init
//! container renders the templates with the actual values.

use serde_json::Value;
use std::{collections::BTreeMap, fmt, path::Path};

pub const LABELS_FILE: &str = "labels";
pub const ANNOTATIONS_FILE: &str = "annotations";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unterminated template reference at offset {0}")]
    Unterminated(usize),

    #[error("template reference `{0}` must start with `.`")]
    NotAField(String),

    #[error("unknown template field `{0}`")]
    UnknownField(String),

    #[error("template field `{0}` requires a key")]
    MissingKey(&'static str),
}

/// A single downward-API datum referenced from a template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    PodName,
    PodNamespace,
    PodIp,
    PodSvcAccount,
    PodUid,
    NodeName,
    NodeIp,
    PodLabel(String),
    PodAnnotation(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

/// Records which downward-API data a set of templates needs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Needed {
    pub pod_name: bool,
    pub pod_namespace: bool,
    pub pod_ip: bool,
    pub pod_svc_account: bool,
    pub pod_uid: bool,
    pub node_name: bool,
    pub node_ip: bool,
    pub pod_labels: bool,
    pub pod_annotations: bool,
}

/// Downward-API values available inside a running pod.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values {
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub pod_ip: Option<String>,
    pub pod_svc_account: Option<String>,
    pub pod_uid: Option<String>,
    pub node_name: Option<String>,
    pub node_ip: Option<String>,
    pub pod_labels: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
}

// === impl Field ===

impl Field {
    fn parse(reference: &str) -> Result<Self, Error> {
        let path = reference
            .strip_prefix('.')
            .ok_or_else(|| Error::NotAField(reference.to_string()))?;
        let (head, key) = match path.split_once('.') {
            Some((head, key)) => (head, Some(key)),
            None => (path, None),
        };

        let field = match (head, key) {
            ("PodName", None) => Self::PodName,
            ("PodNamespace", None) => Self::PodNamespace,
            ("PodIp", None) => Self::PodIp,
            ("PodSvcAccount", None) => Self::PodSvcAccount,
            ("PodUid", None) => Self::PodUid,
            ("NodeName", None) => Self::NodeName,
            ("NodeIp", None) => Self::NodeIp,
            ("PodLabels", Some(key)) if !key.is_empty() => Self::PodLabel(key.to_string()),
            ("PodLabels", _) => return Err(Error::MissingKey("PodLabels")),
            ("PodAnnotations", Some(key)) if !key.is_empty() => {
                Self::PodAnnotation(key.to_string())
            }
            ("PodAnnotations", _) => return Err(Error::MissingKey("PodAnnotations")),
            _ => return Err(Error::UnknownField(reference.to_string())),
        };
        Ok(field)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PodName => f.write_str(".PodName"),
            Self::PodNamespace => f.write_str(".PodNamespace"),
            Self::PodIp => f.write_str(".PodIp"),
            Self::PodSvcAccount => f.write_str(".PodSvcAccount"),
            Self::PodUid => f.write_str(".PodUid"),
            Self::NodeName => f.write_str(".NodeName"),
            Self::NodeIp => f.write_str(".NodeIp"),
            Self::PodLabel(key) => write!(f, ".PodLabels.{}", key),
            Self::PodAnnotation(key) => write!(f, ".PodAnnotations.{}", key),
        }
    }
}

// === impl Template ===

impl Template {
    pub fn parse(src: &str) -> Result<Self, Error> {
        let mut segments = Vec::new();
        let mut rest = src;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let body = &rest[start + 2..];
            let end = body
                .find("}}")
                .ok_or(Error::Unterminated(offset + start))?;
            let field = Field::parse(body[..end].trim())?;
            segments.push(Segment::Field(field));

            let consumed = start + 2 + end + 2;
            rest = &rest[consumed..];
            offset += consumed;
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(f) => Some(f),
            Segment::Literal(_) => None,
        })
    }

    /// Substitutes `values` into the template. Data that is not available renders as an empty
    /// string.
    pub fn render(&self, values: &Values) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(field) => {
                    if let Some(v) = values.get(field) {
                        out.push_str(v);
                    } else {
                        tracing::debug!(%field, "no value for template field");
                    }
                }
            }
        }
        out
    }
}

// === impl Needed ===

impl Needed {
    pub fn from_templates<'t>(
        templates: impl IntoIterator<Item = &'t str>,
    ) -> Result<Self, Error> {
        let mut needed = Self::default();
        for t in templates {
            needed.record(&Template::parse(t)?);
        }
        Ok(needed)
    }

    pub fn record(&mut self, template: &Template) {
        for field in template.fields() {
            match field {
                Field::PodName => self.pod_name = true,
                Field::PodNamespace => self.pod_namespace = true,
                Field::PodIp => self.pod_ip = true,
                Field::PodSvcAccount => self.pod_svc_account = true,
                Field::PodUid => self.pod_uid = true,
                Field::NodeName => self.node_name = true,
                Field::NodeIp => self.node_ip = true,
                Field::PodLabel(_) => self.pod_labels = true,
                Field::PodAnnotation(_) => self.pod_annotations = true,
            }
        }
    }

    /// Whether a downward-API volume must be mounted.
    pub fn volume(&self) -> bool {
        self.pod_labels || self.pod_annotations
    }
}

// === JSON documents ===

/// Checks that every string in `doc` is a valid template, returning the data they need.
///
/// Object keys are not templated.
pub fn parse_json(doc: &Value) -> Result<Needed, Error> {
    let mut needed = Needed::default();
    visit_strings(doc, &mut |s| {
        needed.record(&Template::parse(s)?);
        Ok(())
    })?;
    Ok(needed)
}

/// Renders every string in `doc` as a template. Values are substituted into the decoded strings,
/// so they never need escaping.
pub fn render_json(doc: &mut Value, values: &Values) -> Result<(), Error> {
    match doc {
        Value::String(s) => {
            *s = Template::parse(s)?.render(values);
            Ok(())
        }
        Value::Array(items) => items.iter_mut().try_for_each(|v| render_json(v, values)),
        Value::Object(map) => map.values_mut().try_for_each(|v| render_json(v, values)),
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}

fn visit_strings(
    doc: &Value,
    f: &mut impl FnMut(&str) -> Result<(), Error>,
) -> Result<(), Error> {
    match doc {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().try_for_each(|v| visit_strings(v, f)),
        Value::Object(map) => map.values().try_for_each(|v| visit_strings(v, f)),
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}

// === impl Values ===

impl Values {
    /// Reads scalar values from the environment and labels/annotations from the downward-API
    /// volume mounted at `podinfo`. Files that do not exist are treated as empty.
    pub fn from_env_and_dir(podinfo: &Path) -> std::io::Result<Self> {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Ok(Self {
            pod_name: env("POD_NAME"),
            pod_namespace: env("POD_NAMESPACE"),
            pod_ip: env("POD_IP"),
            pod_svc_account: env("POD_SVCACCNT"),
            pod_uid: env("POD_UID"),
            node_name: env("NODE_NAME"),
            node_ip: env("NODE_IP"),
            pod_labels: read_podinfo(&podinfo.join(LABELS_FILE))?,
            pod_annotations: read_podinfo(&podinfo.join(ANNOTATIONS_FILE))?,
        })
    }

    pub fn get(&self, field: &Field) -> Option<&str> {
        match field {
            Field::PodName => self.pod_name.as_deref(),
            Field::PodNamespace => self.pod_namespace.as_deref(),
            Field::PodIp => self.pod_ip.as_deref(),
            Field::PodSvcAccount => self.pod_svc_account.as_deref(),
            Field::PodUid => self.pod_uid.as_deref(),
            Field::NodeName => self.node_name.as_deref(),
            Field::NodeIp => self.node_ip.as_deref(),
            Field::PodLabel(k) => self.pod_labels.get(k).map(String::as_str),
            Field::PodAnnotation(k) => self.pod_annotations.get(k).map(String::as_str),
        }
    }
}

fn read_podinfo(path: &Path) -> std::io::Result<BTreeMap<String, String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse_podinfo(&contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e),
    }
}

/// Parses the downward-API file format: one `key="value"` pair per line, with the value quoted
/// the way Go's `%q` verb quotes strings.
pub fn parse_podinfo(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .filter_map(|line| {
            let (key, quoted) = line.split_once('=')?;
            let value = match unquote(quoted) {
                Some(v) => v,
                None => {
                    tracing::warn!(%key, "skipping malformed podinfo value");
                    return None;
                }
            };
            Some((key.to_string(), value))
        })
        .collect()
}

/// Decodes a Go double-quoted string literal, including `\a`, `\v`, `\xNN`, octal and
/// `\u`/`\U` escapes. Invalid UTF-8 produced by byte escapes is replaced.
fn unquote(quoted: &str) -> Option<String> {
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = Vec::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }

        let byte = match chars.next()? {
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0c,
            'n' => b'\n',
            'r' => b'\r',
            't' => b'\t',
            'v' => 0x0b,
            '\\' => b'\\',
            '"' => b'"',
            '\'' => b'\'',
            'x' => u8::from_str_radix(&take(&mut chars, 2)?, 16).ok()?,
            d @ '0'..='7' => {
                let digits = format!("{}{}", d, take(&mut chars, 2)?);
                u8::from_str_radix(&digits, 8).ok()?
            }
            u @ ('u' | 'U') => {
                let n = if u == 'u' { 4 } else { 8 };
                let code = u32::from_str_radix(&take(&mut chars, n)?, 16).ok()?;
                let mut buf = [0; 4];
                out.extend_from_slice(char::from_u32(code)?.encode_utf8(&mut buf).as_bytes());
                continue;
            }
            _ => return None,
        };
        out.push(byte);
    }

    Some(String::from_utf8_lossy(&out).into_owned())
}

fn take(chars: &mut std::str::Chars<'_>, n: usize) -> Option<String> {
    let s = chars.by_ref().take(n).collect::<String>();
    if s.len() == n {
        Some(s)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_literals_and_fields() {
        let t = Template::parse("{{ .PodName }}.{{.PodNamespace}}-sidecar").unwrap();
        assert_eq!(
            t.fields().cloned().collect::<Vec<_>>(),
            vec![Field::PodName, Field::PodNamespace]
        );
        assert_eq!(Template::parse("").unwrap(), Template::default());
    }

    #[test]
    fn label_keys_may_contain_dots() {
        let t = Template::parse("{{ .PodLabels.app.kubernetes.io/name }}").unwrap();
        assert_eq!(
            t.fields().collect::<Vec<_>>(),
            vec![&Field::PodLabel("app.kubernetes.io/name".to_string())]
        );
    }

    #[test]
    fn rejects_bad_references() {
        assert_eq!(
            Template::parse("abc{{ .PodName"),
            Err(Error::Unterminated(3))
        );
        assert_eq!(
            Template::parse("{{ PodName }}"),
            Err(Error::NotAField("PodName".to_string()))
        );
        assert_eq!(
            Template::parse("{{ .PodColor }}"),
            Err(Error::UnknownField(".PodColor".to_string()))
        );
        assert_eq!(
            Template::parse("{{ .PodLabels }}"),
            Err(Error::MissingKey("PodLabels"))
        );
        assert_eq!(
            Template::parse("{{ .PodAnnotations. }}"),
            Err(Error::MissingKey("PodAnnotations"))
        );
        assert_eq!(
            Template::parse("{{ .PodName.extra }}"),
            Err(Error::UnknownField(".PodName.extra".to_string()))
        );
    }

    #[test]
    fn records_needed_data() {
        let needed = Needed::from_templates(vec![
            "{{ .PodName }}-{{ .NodeIp }}",
            "{{ .PodAnnotations.cluster }}",
        ])
        .unwrap();
        assert_eq!(
            needed,
            Needed {
                pod_name: true,
                node_ip: true,
                pod_annotations: true,
                ..Needed::default()
            }
        );
        assert!(needed.volume());

        let needed = Needed::from_templates(vec!["static", "{{ .PodUid }}"]).unwrap();
        assert!(needed.pod_uid);
        assert!(!needed.pod_namespace);
        assert!(!needed.volume());
    }

    #[test]
    fn renders_values() {
        let mut values = Values {
            pod_name: Some("envoy-abc".to_string()),
            ..Values::default()
        };
        values
            .pod_labels
            .insert("zone".to_string(), "us-east".to_string());

        let t = Template::parse("{{ .PodName }}@{{ .PodLabels.zone }}/{{ .NodeName }}").unwrap();
        assert_eq!(t.render(&values), "envoy-abc@us-east/");
    }

    #[test]
    fn parses_podinfo_files() {
        let parsed = parse_podinfo(
            "app=\"envoy\"\nenvoy_cluster=\"front\"\nnote=\"a \\\"quoted\\\" value\"\nbogus\n",
        );
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["app"], "envoy");
        assert_eq!(parsed["note"], "a \"quoted\" value");
    }

    #[test]
    fn unquotes_go_escapes() {
        assert_eq!(unquote(r#""bell\a tab\t vt\v""#).as_deref(), Some("bell\x07 tab\t vt\x0b"));
        assert_eq!(unquote(r#""\x41\102\u00e9\U0001F600""#).as_deref(), Some("AB\u{e9}\u{1F600}"));
        assert_eq!(unquote(r#""caf\xc3\xa9""#).as_deref(), Some("caf\u{e9}"));
        assert_eq!(unquote(r#""\xff""#).as_deref(), Some("\u{fffd}"));
        assert_eq!(unquote(r#""it\'s""#).as_deref(), Some("it's"));

        assert_eq!(unquote("unquoted"), None);
        assert_eq!(unquote(r#""dangling\""#), None);
        assert_eq!(unquote(r#""\x4""#), None);
        assert_eq!(unquote(r#""\q""#), None);

        let parsed = parse_podinfo("note=\"line\\vbreak\\x21\"\n");
        assert_eq!(parsed["note"], "line\x0bbreak!");
    }

    #[test]
    fn checks_every_string_in_a_document() {
        let doc = serde_json::json!({
            "node": { "id": "{{ .PodName }}", "cluster": "edge" },
            "hosts": [{ "address": "{{ .NodeIp }}", "port": 80 }],
            "{{ keys are not templates": true,
        });
        let needed = parse_json(&doc).unwrap();
        assert!(needed.pod_name);
        assert!(needed.node_ip);
        assert!(!needed.volume());

        let doc = serde_json::json!({ "hosts": ["ok", "xds-{{.host"] });
        assert_eq!(parse_json(&doc), Err(Error::Unterminated(4)));
    }

    #[test]
    fn renders_string_leaves() {
        let mut doc = serde_json::json!({
            "node": { "id": "{{ .PodName }}" },
            "list": ["{{ .PodLabels.zone }}", 1, null],
        });
        let mut values = Values {
            pod_name: Some("a\"b".to_string()),
            ..Values::default()
        };
        values.pod_labels.insert("zone".to_string(), "z".to_string());

        render_json(&mut doc, &values).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({ "node": { "id": "a\"b" }, "list": ["z", 1, null] })
        );
    }

    #[test]
    fn reads_values_from_env_and_podinfo() {
        // The only test that touches these variables.
        std::env::set_var("POD_NAME", "front-0");
        std::env::set_var("POD_SVCACCNT", "envoy");
        std::env::set_var("POD_NAMESPACE", "");
        for name in &["POD_IP", "POD_UID", "NODE_NAME", "NODE_IP"] {
            std::env::remove_var(name);
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(LABELS_FILE),
            "app=\"envoy\"\nzone=\"us-east\"\n",
        )
        .unwrap();

        let values = Values::from_env_and_dir(dir.path()).unwrap();
        assert_eq!(values.pod_name.as_deref(), Some("front-0"));
        assert_eq!(values.pod_svc_account.as_deref(), Some("envoy"));
        assert_eq!(values.pod_namespace, None);
        assert_eq!(values.node_ip, None);
        assert_eq!(values.pod_labels["zone"], "us-east");
        assert!(values.pod_annotations.is_empty());

        let empty = tempfile::tempdir().unwrap();
        let values = Values::from_env_and_dir(empty.path()).unwrap();
        assert!(values.pod_labels.is_empty());
        assert!(values.pod_annotations.is_empty());
    }
}
