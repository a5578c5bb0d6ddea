//! `tf.train.Example` decoding against a fixed float schema
//!
//! ```text
//! Example  { Features features = 1; }
//! Features { map<string, Feature> feature = 1; }
//! Feature  { oneof kind { BytesList = 1; FloatList = 2; Int64List = 3; } }
//! FloatList{ repeated float value = 1; }   // packed or unpacked
//! ```

use std::collections::HashMap;

use thiserror::Error;

use super::wire::{self, FieldValue, WireError, WireReader};

/// Why an example did not match its schema
#[derive(Debug, Error, PartialEq)]
pub enum ExampleError {
    #[error("malformed protobuf: {0}")]
    Wire(#[from] WireError),

    #[error("feature '{0}' is missing")]
    MissingFeature(String),

    #[error("feature '{name}' is a {kind}, expected a float list")]
    NotFloatList { name: String, kind: &'static str },

    #[error("feature '{name}' has {actual} values, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("feature key is not valid UTF-8")]
    BadKey,
}

/// Declared features: every one is a dense float array of `values_per_feature`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    names: Vec<String>,
    values_per_feature: usize,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>, values_per_feature: usize) -> Self {
        Self {
            names,
            values_per_feature,
        }
    }

    /// Square `kernel_size × kernel_size` patches
    pub fn square(names: Vec<String>, kernel_size: usize) -> Self {
        Self::new(names, kernel_size * kernel_size)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values_per_feature(&self) -> usize {
        self.values_per_feature
    }

    fn declares(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Decoded features keyed by name
pub type FeatureMap = HashMap<String, Vec<f32>>;

enum FeatureKind<'a> {
    Floats(&'a [u8]),
    Other(&'static str),
    Empty,
}

/// Decode one serialized example, keeping only the declared features
pub fn parse_example(bytes: &[u8], schema: &FeatureSchema) -> Result<FeatureMap, ExampleError> {
    let mut raw: HashMap<String, &[u8]> = HashMap::new();

    let mut example = WireReader::new(bytes);
    while let Some((field, value)) = example.next_field()? {
        if let (1, FieldValue::Bytes(features)) = (field, value) {
            collect_entries(features, schema, &mut raw)?;
        }
    }

    let mut out = FeatureMap::with_capacity(schema.names.len());
    for name in &schema.names {
        let feature = raw
            .get(name.as_str())
            .ok_or_else(|| ExampleError::MissingFeature(name.clone()))?;
        let values = match feature_kind(feature)? {
            FeatureKind::Floats(list) => decode_float_list(list)?,
            FeatureKind::Other(kind) => {
                return Err(ExampleError::NotFloatList {
                    name: name.clone(),
                    kind,
                })
            }
            FeatureKind::Empty => {
                return Err(ExampleError::NotFloatList {
                    name: name.clone(),
                    kind: "empty feature",
                })
            }
        };
        if values.len() != schema.values_per_feature {
            return Err(ExampleError::LengthMismatch {
                name: name.clone(),
                expected: schema.values_per_feature,
                actual: values.len(),
            });
        }
        out.insert(name.clone(), values);
    }

    Ok(out)
}

fn collect_entries<'a>(
    features: &'a [u8],
    schema: &FeatureSchema,
    raw: &mut HashMap<String, &'a [u8]>,
) -> Result<(), ExampleError> {
    let mut reader = WireReader::new(features);
    while let Some((field, value)) = reader.next_field()? {
        let FieldValue::Bytes(entry) = value else {
            continue;
        };
        if field != 1 {
            continue;
        }

        let mut key: Option<&[u8]> = None;
        let mut feature: &[u8] = &[];
        let mut entry_reader = WireReader::new(entry);
        while let Some((f, v)) = entry_reader.next_field()? {
            match (f, v) {
                (1, FieldValue::Bytes(k)) => key = Some(k),
                (2, FieldValue::Bytes(b)) => feature = b,
                _ => {}
            }
        }

        let key = std::str::from_utf8(key.unwrap_or_default()).map_err(|_| ExampleError::BadKey)?;
        if schema.declares(key) {
            // Later entries win, as with protobuf map merging.
            raw.insert(key.to_string(), feature);
        }
    }
    Ok(())
}

fn feature_kind(feature: &[u8]) -> Result<FeatureKind<'_>, ExampleError> {
    let mut kind = FeatureKind::Empty;
    let mut reader = WireReader::new(feature);
    while let Some((field, value)) = reader.next_field()? {
        kind = match (field, value) {
            (2, FieldValue::Bytes(list)) => FeatureKind::Floats(list),
            (1, _) => FeatureKind::Other("bytes list"),
            (3, _) => FeatureKind::Other("int64 list"),
            _ => kind,
        };
    }
    Ok(kind)
}

fn decode_float_list(list: &[u8]) -> Result<Vec<f32>, ExampleError> {
    let mut values = Vec::new();
    let mut reader = WireReader::new(list);
    while let Some((field, value)) = reader.next_field()? {
        if field != 1 {
            continue;
        }
        match value {
            FieldValue::Bytes(packed) => {
                if packed.len() % 4 != 0 {
                    return Err(ExampleError::Wire(WireError::Truncated));
                }
                values.reserve(packed.len() / 4);
                values.extend(
                    packed
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                );
            }
            FieldValue::Fixed32(bits) => values.push(f32::from_bits(bits)),
            _ => {}
        }
    }
    Ok(values)
}

/// Serialize named float features as an `Example` with packed float lists
pub fn encode_example(features: &[(&str, &[f32])]) -> Vec<u8> {
    let mut map = Vec::new();
    for (name, values) in features {
        let mut float_list = Vec::with_capacity(values.len() * 4 + 8);
        wire::put_packed_f32_field(&mut float_list, 1, values);

        let mut feature = Vec::with_capacity(float_list.len() + 8);
        wire::put_bytes_field(&mut feature, 2, &float_list);

        let mut entry = Vec::with_capacity(feature.len() + name.len() + 8);
        wire::put_bytes_field(&mut entry, 1, name.as_bytes());
        wire::put_bytes_field(&mut entry, 2, &feature);

        wire::put_bytes_field(&mut map, 1, &entry);
    }

    let mut example = Vec::with_capacity(map.len() + 8);
    wire::put_bytes_field(&mut example, 1, &map);
    example
}
