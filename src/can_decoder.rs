use std::sync::Arc;

use crate::catalog::{Catalog, FieldConstraint, MessageDefinition};
use crate::error::DecodeError;
use crate::frame::Frame;

/// A frame decoded against a definition: one value per layout field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    definition: Arc<MessageDefinition>,
    values: Vec<i64>,
}

impl InboundMessage {
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &Arc<MessageDefinition> {
        &self.definition
    }

    /// Decoded values in layout order.
    pub fn values(&self) -> &[i64] {
        &self.values
    }

    fn unknown(&self, field: &str) -> DecodeError {
        DecodeError::UnknownField {
            message: self.definition.name().to_owned(),
            field: field.to_owned(),
        }
    }

    /// Value of a layout field by name.
    pub fn field(&self, name: &str) -> Result<i64, DecodeError> {
        self.definition
            .field_index(name)
            .map(|index| self.values[index])
            .ok_or_else(|| self.unknown(name))
    }

    /// Value of a named bit-field.
    pub fn flag(&self, name: &str) -> Result<bool, DecodeError> {
        let bit = self.definition.bit(name).ok_or_else(|| self.unknown(name))?;
        Ok((self.values[bit.field] >> bit.bit) & 1 == 1)
    }

    /// Every named bit-field with its value, in name order.
    pub fn flags(&self) -> Vec<(&str, bool)> {
        self.definition
            .bits()
            .map(|(name, bit)| (name, (self.values[bit.field] >> bit.bit) & 1 == 1))
            .collect()
    }
}

/// Validate a frame against a definition and unpack its fields.
///
/// Checks run in order: identity (ID and ID format), payload length,
/// then the fixed-field constraints on the unpacked values.
pub fn decode(
    definition: &Arc<MessageDefinition>,
    frame: &Frame,
) -> Result<InboundMessage, DecodeError> {
    if frame.id() != definition.id() || frame.is_extended() != definition.is_extended() {
        return Err(DecodeError::IdentityMismatch {
            expected_id: definition.id(),
            expected_extended: definition.is_extended(),
            actual_id: frame.id(),
            actual_extended: frame.is_extended(),
        });
    }
    let expected = definition.payload_len();
    if frame.len() != expected {
        return Err(DecodeError::LengthMismatch {
            expected,
            actual: frame.len(),
        });
    }

    let data = frame.payload();
    let values: Vec<i64> = definition
        .fields()
        .iter()
        .map(|field| {
            let raw = field.layout().extract(data);
            if field.signed {
                field.layout().sign_extend(raw)
            } else {
                raw as i64
            }
        })
        .collect();

    for (index, field) in definition.fields().iter().enumerate() {
        if let FieldConstraint::Fixed(expected) = field.constraint {
            if values[index] != expected {
                return Err(DecodeError::FieldConstraintViolation {
                    index,
                    expected,
                    actual: values[index],
                });
            }
        }
    }

    Ok(InboundMessage {
        definition: Arc::clone(definition),
        values,
    })
}

/// Decode a frame with whichever definition of the catalog carries its ID.
pub fn decode_any(
    catalog: &Catalog,
    frame: &Frame,
) -> Option<Result<InboundMessage, DecodeError>> {
    catalog
        .by_id(frame.id(), frame.is_extended())
        .map(|definition| decode(&definition, frame))
}
