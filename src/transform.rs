//! Transform specifications: ordered lists of image operations.
//!
//! A [`TransformSpec`] is what a caller asks for: "resize to 200 wide, then
//! crop to 200×200, then encode as WebP". Operations apply strictly in order
//! and names may repeat.
//!
//! Specs usually arrive as JSON, in one of two shapes:
//!
//! ```json
//! [{"resize": {"width": 200}}, {"crop": {"width": 200, "height": 200}}, {"type": "webp"}]
//! ```
//!
//! ```json
//! {"resize": {"width": 200}, "crop": {"width": 200, "height": 200}, "type": "webp"}
//! ```
//!
//! The array shape can repeat an operation; the object shape is shorter and
//! keeps its key order. Parsing validates every parameter up front, so an
//! unknown operation or a missing required parameter is reported before any
//! image is decoded.
//!
//! Several operations accept a bare scalar instead of an object:
//! `{"rotate": 90}` is `{"rotate": {"degrees": 90}}`, `{"flip": "horizontal"}`
//! is `{"flip": {"direction": "horizontal"}}`, and so on. Both forms parse to
//! the same [`Operation`], so they also share a fingerprint.

use crate::imaging::{Color, FlipDirection, Offset, OutputFormat, Quality, ResizeMaster};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown operation \"{0}\"")]
    UnknownOperation(String),
    #[error("operation \"{op}\" requires parameter \"{param}\"")]
    MissingParam {
        op: &'static str,
        param: &'static str,
    },
    #[error("operation \"{op}\": invalid \"{param}\": {reason}")]
    InvalidParam {
        op: &'static str,
        param: &'static str,
        reason: String,
    },
    #[error("operation \"quality\" requires a value")]
    EmptyQuality,
    #[error("invalid transform spec: {0}")]
    InvalidShape(String),
}

/// One step of a transform pipeline, with typed parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Resize {
        width: Option<u32>,
        height: Option<u32>,
        master: Option<ResizeMaster>,
    },
    Crop {
        width: u32,
        height: u32,
        offset_x: Offset,
        offset_y: Offset,
    },
    /// Cover-fit resize followed by a centered crop to exactly `width`×`height`.
    ScaleAndCrop { width: u32, height: u32 },
    Rotate { degrees: i32 },
    Flip { direction: FlipDirection },
    Sharpen { amount: u32 },
    Reflection {
        height: Option<u32>,
        opacity: u8,
        fade_in: bool,
    },
    Watermark {
        /// Path of the overlay image, resolved like a source path.
        source: Option<String>,
        offset_x: Offset,
        offset_y: Offset,
        opacity: u8,
    },
    Background { color: Color, opacity: u8 },
    /// Output quality for the final encode.
    Quality(Quality),
    /// Output type; only picks the extension, never executed.
    Type { extension: String },
}

impl Operation {
    /// Name of the operation as written in a spec.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Resize { .. } => "resize",
            Operation::Crop { .. } => "crop",
            Operation::ScaleAndCrop { .. } => "scaleAndCrop",
            Operation::Rotate { .. } => "rotate",
            Operation::Flip { .. } => "flip",
            Operation::Sharpen { .. } => "sharpen",
            Operation::Reflection { .. } => "reflection",
            Operation::Watermark { .. } => "watermark",
            Operation::Background { .. } => "background",
            Operation::Quality(_) => "quality",
            Operation::Type { .. } => "type",
        }
    }

    /// Parse one `(name, params)` entry of a spec.
    pub fn parse(name: &str, value: &Value) -> Result<Self, ValidationError> {
        match name {
            "resize" => {
                let params = Params::object_or_empty("resize", value)?;
                Ok(Operation::Resize {
                    width: params.u32("width")?,
                    height: params.u32("height")?,
                    master: params.master("master")?,
                })
            }
            "crop" => {
                let params = Params::object_or_empty("crop", value)?;
                Ok(Operation::Crop {
                    width: params.required_u32("width")?,
                    height: params.required_u32("height")?,
                    offset_x: params.offset("offset_x")?,
                    offset_y: params.offset("offset_y")?,
                })
            }
            "scaleAndCrop" | "scale_and_crop" => {
                let params = Params::object_or_empty("scaleAndCrop", value)?;
                Ok(Operation::ScaleAndCrop {
                    width: params.required_u32("width")?,
                    height: params.required_u32("height")?,
                })
            }
            "rotate" => {
                let degrees = match value {
                    Value::Object(_) => {
                        Params::object_or_empty("rotate", value)?.required_i32("degrees")?
                    }
                    scalar => parse_i32("rotate", "degrees", scalar)?
                        .ok_or(ValidationError::MissingParam {
                            op: "rotate",
                            param: "degrees",
                        })?,
                };
                Ok(Operation::Rotate { degrees })
            }
            "flip" => {
                let raw = scalar_or_field("flip", "direction", value)?;
                Ok(Operation::Flip {
                    direction: parse_flip(raw)?,
                })
            }
            "sharpen" => {
                let amount = match value {
                    Value::Object(_) => {
                        Params::object_or_empty("sharpen", value)?.required_u32("amount")?
                    }
                    scalar => parse_u32("sharpen", "amount", scalar)?.ok_or(
                        ValidationError::MissingParam {
                            op: "sharpen",
                            param: "amount",
                        },
                    )?,
                };
                Ok(Operation::Sharpen { amount })
            }
            "reflection" => {
                let params = Params::object_or_empty("reflection", value)?;
                Ok(Operation::Reflection {
                    height: params.u32("height")?,
                    opacity: params.opacity("opacity")?,
                    fade_in: params.bool("fade_in")?,
                })
            }
            "watermark" => match value {
                Value::Object(_) => {
                    let params = Params::object_or_empty("watermark", value)?;
                    Ok(Operation::Watermark {
                        source: params.string("watermark")?,
                        offset_x: params.offset("offset_x")?,
                        offset_y: params.offset("offset_y")?,
                        opacity: params.opacity("opacity")?,
                    })
                }
                scalar => Ok(Operation::Watermark {
                    source: parse_string("watermark", "watermark", scalar)?,
                    offset_x: Offset::Center,
                    offset_y: Offset::Center,
                    opacity: 100,
                }),
            },
            "background" => {
                let (raw, opacity) = match value {
                    Value::Object(_) => {
                        let params = Params::object_or_empty("background", value)?;
                        (params.required("color")?, params.opacity("opacity")?)
                    }
                    scalar => (scalar, 100),
                };
                let text = parse_string("background", "color", raw)?.ok_or(
                    ValidationError::MissingParam {
                        op: "background",
                        param: "color",
                    },
                )?;
                let color = Color::from_hex(&text).ok_or_else(|| ValidationError::InvalidParam {
                    op: "background",
                    param: "color",
                    reason: format!("\"{text}\" is not a hex color"),
                })?;
                Ok(Operation::Background { color, opacity })
            }
            "quality" => {
                let empty = match value {
                    Value::Null => true,
                    Value::String(s) => s.trim().is_empty(),
                    _ => false,
                };
                if empty {
                    return Err(ValidationError::EmptyQuality);
                }
                let quality = parse_u32("quality", "quality", value)?
                    .ok_or(ValidationError::EmptyQuality)?;
                Ok(Operation::Quality(Quality::new(quality)))
            }
            "type" => {
                let ext = parse_string("type", "type", value)?.ok_or(
                    ValidationError::MissingParam {
                        op: "type",
                        param: "type",
                    },
                )?;
                let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
                if OutputFormat::from_extension(&ext).is_none() {
                    return Err(ValidationError::InvalidParam {
                        op: "type",
                        param: "type",
                        reason: format!("unsupported output type \"{ext}\""),
                    });
                }
                Ok(Operation::Type { extension: ext })
            }
            other => Err(ValidationError::UnknownOperation(other.to_string())),
        }
    }

    /// Parameters in their canonical spelling: the object form, or the bare
    /// value for `quality` and `type`. Absent optional parameters are left out.
    pub fn params_json(&self) -> Value {
        match self {
            Operation::Resize {
                width,
                height,
                master,
            } => object([
                ("width", width.map(Value::from)),
                ("height", height.map(Value::from)),
                ("master", master.map(|m| Value::from(m.name()))),
            ]),
            Operation::Crop {
                width,
                height,
                offset_x,
                offset_y,
            } => json!({
                "width": width,
                "height": height,
                "offset_x": offset_json(*offset_x),
                "offset_y": offset_json(*offset_y),
            }),
            Operation::ScaleAndCrop { width, height } => json!({"width": width, "height": height}),
            Operation::Rotate { degrees } => json!({"degrees": degrees}),
            Operation::Flip { direction } => json!({"direction": direction.name()}),
            Operation::Sharpen { amount } => json!({"amount": amount}),
            Operation::Reflection {
                height,
                opacity,
                fade_in,
            } => object([
                ("height", height.map(Value::from)),
                ("opacity", Some(Value::from(*opacity))),
                ("fade_in", Some(Value::from(*fade_in))),
            ]),
            Operation::Watermark {
                source,
                offset_x,
                offset_y,
                opacity,
            } => object([
                ("watermark", source.as_deref().map(Value::from)),
                ("offset_x", Some(offset_json(*offset_x))),
                ("offset_y", Some(offset_json(*offset_y))),
                ("opacity", Some(Value::from(*opacity))),
            ]),
            Operation::Background { color, opacity } => {
                json!({"color": color.to_string(), "opacity": opacity})
            }
            Operation::Quality(q) => Value::from(q.value()),
            Operation::Type { extension } => Value::from(extension.as_str()),
        }
    }

    /// This operation as a one-entry spec object, `{name: params}`.
    /// [`Operation::parse`] reads it back to an equal operation.
    pub fn to_json(&self) -> Value {
        let mut entry = Map::new();
        entry.insert(self.name().to_string(), self.params_json());
        Value::Object(entry)
    }

    /// Feed a canonical, unambiguous encoding of this operation into a hasher.
    pub(crate) fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update(self.name().as_bytes());
        hasher.update(b"\0");
        match self {
            Operation::Resize {
                width,
                height,
                master,
            } => {
                hash_opt_u32(hasher, *width);
                hash_opt_u32(hasher, *height);
                match master {
                    Some(m) => {
                        hasher.update([1u8, *m as u8]);
                    }
                    None => hasher.update([0u8]),
                }
            }
            Operation::Crop {
                width,
                height,
                offset_x,
                offset_y,
            } => {
                hasher.update(width.to_le_bytes());
                hasher.update(height.to_le_bytes());
                hash_offset(hasher, *offset_x);
                hash_offset(hasher, *offset_y);
            }
            Operation::ScaleAndCrop { width, height } => {
                hasher.update(width.to_le_bytes());
                hasher.update(height.to_le_bytes());
            }
            Operation::Rotate { degrees } => hasher.update(degrees.to_le_bytes()),
            Operation::Flip { direction } => hasher.update([*direction as u8]),
            Operation::Sharpen { amount } => hasher.update(amount.to_le_bytes()),
            Operation::Reflection {
                height,
                opacity,
                fade_in,
            } => {
                hash_opt_u32(hasher, *height);
                hasher.update([*opacity, *fade_in as u8]);
            }
            Operation::Watermark {
                source,
                offset_x,
                offset_y,
                opacity,
            } => {
                match source {
                    Some(s) => {
                        hasher.update([1u8]);
                        hash_str(hasher, s);
                    }
                    None => hasher.update([0u8]),
                }
                hash_offset(hasher, *offset_x);
                hash_offset(hasher, *offset_y);
                hasher.update([*opacity]);
            }
            Operation::Background { color, opacity } => {
                hasher.update([color.r, color.g, color.b, *opacity]);
            }
            Operation::Quality(q) => hasher.update(q.value().to_le_bytes()),
            Operation::Type { extension } => hash_str(hasher, extension),
        }
    }
}

fn object<const N: usize>(fields: [(&str, Option<Value>); N]) -> Value {
    Value::Object(
        fields
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), v)))
            .collect(),
    )
}

fn offset_json(offset: Offset) -> Value {
    match offset {
        Offset::Center => Value::from("center"),
        Offset::End => Value::from("end"),
        Offset::Px(px) => Value::from(px),
    }
}

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_opt_u32(hasher: &mut Sha256, v: Option<u32>) {
    match v {
        Some(v) => {
            hasher.update([1u8]);
            hasher.update(v.to_le_bytes());
        }
        None => hasher.update([0u8]),
    }
}

fn hash_offset(hasher: &mut Sha256, offset: Offset) {
    match offset {
        Offset::Center => hasher.update([0u8]),
        Offset::End => hasher.update([1u8]),
        Offset::Px(px) => {
            hasher.update([2u8]);
            hasher.update(px.to_le_bytes());
        }
    }
}

/// An ordered list of operations.
///
/// Serializes to the array shape in canonical spelling (see
/// [`TransformSpec::to_json`]).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransformSpec {
    operations: Vec<Operation>,
}

impl TransformSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation (builder style).
    pub fn with(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn push(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Output extension requested by a `type` operation (the last one wins).
    pub fn output_extension(&self) -> Option<&str> {
        self.operations.iter().rev().find_map(|op| match op {
            Operation::Type { extension } => Some(extension.as_str()),
            _ => None,
        })
    }

    /// Parse a spec from JSON (array or object shape, see the module docs).
    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        let mut spec = Self::new();
        match value {
            Value::Null => {}
            Value::Object(map) => {
                for (name, params) in map {
                    spec.push(Operation::parse(name, params)?);
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let entry = single_entry(item).ok_or_else(|| {
                        ValidationError::InvalidShape(format!(
                            "entry {i} must be an object with exactly one operation"
                        ))
                    })?;
                    spec.push(Operation::parse(entry.0, entry.1)?);
                }
            }
            _ => {
                return Err(ValidationError::InvalidShape(
                    "expected an array or an object".into(),
                ));
            }
        }
        Ok(spec)
    }

    /// The array shape, one [`Operation::to_json`] entry per operation.
    pub fn to_json(&self) -> Value {
        Value::Array(self.operations.iter().map(Operation::to_json).collect())
    }

    /// Parse a spec from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ValidationError::InvalidShape(format!("not valid JSON: {e}")))?;
        Self::from_json(&value)
    }
}

impl Serialize for TransformSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl FromIterator<Operation> for TransformSpec {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        Self {
            operations: iter.into_iter().collect(),
        }
    }
}

fn single_entry(item: &Value) -> Option<(&str, &Value)> {
    let map = item.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.iter().next().map(|(k, v)| (k.as_str(), v))
}

// =============================================================================
// Parameter parsing
// =============================================================================

/// Named parameters of one operation.
struct Params<'a> {
    op: &'static str,
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Params<'a> {
    /// Accept an object, or `null`/`true` as "no parameters".
    fn object_or_empty(op: &'static str, value: &'a Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Ok(Self { op, map: Some(map) }),
            Value::Null | Value::Bool(true) => Ok(Self { op, map: None }),
            other => Err(ValidationError::InvalidParam {
                op,
                param: "params",
                reason: format!("expected an object, got {other}"),
            }),
        }
    }

    fn get(&self, param: &str) -> &'a Value {
        self.map
            .and_then(|m| m.get(param))
            .unwrap_or(&Value::Null)
    }

    fn required(&self, param: &'static str) -> Result<&'a Value, ValidationError> {
        match self.get(param) {
            Value::Null => Err(ValidationError::MissingParam { op: self.op, param }),
            v => Ok(v),
        }
    }

    fn u32(&self, param: &'static str) -> Result<Option<u32>, ValidationError> {
        parse_u32(self.op, param, self.get(param))
    }

    fn required_u32(&self, param: &'static str) -> Result<u32, ValidationError> {
        parse_u32(self.op, param, self.required(param)?)?
            .ok_or(ValidationError::MissingParam { op: self.op, param })
    }

    fn required_i32(&self, param: &'static str) -> Result<i32, ValidationError> {
        parse_i32(self.op, param, self.required(param)?)?
            .ok_or(ValidationError::MissingParam { op: self.op, param })
    }

    fn string(&self, param: &'static str) -> Result<Option<String>, ValidationError> {
        parse_string(self.op, param, self.get(param))
    }

    fn opacity(&self, param: &'static str) -> Result<u8, ValidationError> {
        Ok(self.u32(param)?.map_or(100, |v| v.min(100) as u8))
    }

    fn bool(&self, param: &'static str) -> Result<bool, ValidationError> {
        match self.get(param) {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
            other => Err(invalid(self.op, param, other, "a boolean")),
        }
    }

    fn offset(&self, param: &'static str) -> Result<Offset, ValidationError> {
        match self.get(param) {
            Value::Null => Ok(Offset::Center),
            Value::Bool(true) => Ok(Offset::End),
            Value::Bool(false) => Ok(Offset::Px(0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "center" | "centre" | "" => Ok(Offset::Center),
                "end" | "right" | "bottom" => Ok(Offset::End),
                other => other
                    .parse::<i32>()
                    .map(Offset::Px)
                    .map_err(|_| invalid(self.op, param, &Value::from(other), "an offset")),
            },
            other => {
                let px = parse_i32(self.op, param, other)?;
                Ok(px.map_or(Offset::Center, Offset::Px))
            }
        }
    }

    fn master(&self, param: &'static str) -> Result<Option<ResizeMaster>, ValidationError> {
        let value = self.get(param);
        let master = match value {
            Value::Null => return Ok(None),
            Value::Number(n) => n.as_i64().and_then(ResizeMaster::from_code),
            Value::String(s) => ResizeMaster::from_name(s.trim()),
            _ => None,
        };
        master
            .map(Some)
            .ok_or_else(|| invalid(self.op, param, value, "a resize master"))
    }
}

fn invalid(op: &'static str, param: &'static str, got: &Value, expected: &str) -> ValidationError {
    ValidationError::InvalidParam {
        op,
        param,
        reason: format!("expected {expected}, got {got}"),
    }
}

/// For operations that accept `value` or `{param: value}`.
fn scalar_or_field<'a>(
    op: &'static str,
    param: &'static str,
    value: &'a Value,
) -> Result<&'a Value, ValidationError> {
    match value {
        Value::Object(_) => Params::object_or_empty(op, value)?.required(param),
        Value::Null => Err(ValidationError::MissingParam { op, param }),
        scalar => Ok(scalar),
    }
}

fn parse_u32(
    op: &'static str,
    param: &'static str,
    value: &Value,
) -> Result<Option<u32>, ValidationError> {
    match parse_i64(op, param, value, "a non-negative integer")? {
        None => Ok(None),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| invalid(op, param, value, "a non-negative integer")),
    }
}

fn parse_i32(
    op: &'static str,
    param: &'static str,
    value: &Value,
) -> Result<Option<i32>, ValidationError> {
    match parse_i64(op, param, value, "an integer")? {
        None => Ok(None),
        Some(v) => i32::try_from(v)
            .map(Some)
            .map_err(|_| invalid(op, param, value, "an integer")),
    }
}

/// Integers from JSON numbers (floats are rounded) or numeric strings.
fn parse_i64(
    op: &'static str,
    param: &'static str,
    value: &Value,
    expected: &str,
) -> Result<Option<i64>, ValidationError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
            .map(Some)
            .ok_or_else(|| invalid(op, param, value, expected)),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| Some(f.round() as i64))
            .ok_or_else(|| invalid(op, param, value, expected)),
        other => Err(invalid(op, param, other, expected)),
    }
}

fn parse_string(
    op: &'static str,
    param: &'static str,
    value: &Value,
) -> Result<Option<String>, ValidationError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(invalid(op, param, other, "a string")),
    }
}

fn parse_flip(value: &Value) -> Result<FlipDirection, ValidationError> {
    let direction = match value {
        Value::Number(n) => n.as_i64().and_then(FlipDirection::from_code),
        Value::String(s) => FlipDirection::from_name(s.trim()),
        _ => None,
    };
    direction.ok_or_else(|| invalid("flip", "direction", value, "horizontal or vertical"))
}
