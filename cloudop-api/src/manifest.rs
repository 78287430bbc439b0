//! Manifest decoding.
//!
//! A manifest file holds one or more YAML documents separated by `---`, each
//! describing a single object.

use serde::Deserialize;
use thiserror::Error;

use crate::object::Object;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("document {index}: {source}")]
    Yaml {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("document {index}: missing {field}")]
    MissingField { index: usize, field: &'static str },
}

/// Decode every non-empty document of `input` into an object.
pub fn decode(input: &str) -> Result<Vec<Object>, ManifestError> {
    let mut objects = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(input).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|source| ManifestError::Yaml { index, source })?;
        if value.is_null() {
            continue;
        }

        let object: Object =
            serde_yaml::from_value(value).map_err(|source| ManifestError::Yaml { index, source })?;
        if object.kind.trim().is_empty() {
            return Err(ManifestError::MissingField {
                index,
                field: "kind",
            });
        }
        if object.metadata.name.trim().is_empty() {
            return Err(ManifestError::MissingField {
                index,
                field: "metadata.name",
            });
        }
        objects.push(object);
    }

    Ok(objects)
}

/// Render objects back to a multi-document manifest.
pub fn encode(objects: &[Object]) -> Result<String, serde_yaml::Error> {
    let mut out = String::new();
    for object in objects {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(object)?);
    }
    Ok(out)
}
