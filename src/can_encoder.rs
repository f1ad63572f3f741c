use crate::catalog::{FieldConstraint, MessageDefinition};
use crate::error::EncodeError;
use crate::frame::Frame;

/// Check that `value` fits the representable range of a field, never truncating.
fn check_range(definition: &MessageDefinition, index: usize, value: i64) -> Result<u64, EncodeError> {
    let field = &definition.fields()[index];
    if value < field.min() || value > field.max() {
        return Err(EncodeError::OutOfRange {
            field: field.name.clone(),
            value,
            min: field.min(),
            max: field.max(),
        });
    }
    // Two's complement for negative values; pack masks to the field width
    Ok(value as u64)
}

/// Encode a message from field and bit-field values into a `Frame`.
///
/// Fixed fields take their literal value and free fields not named in
/// `fields` are zero. Each flag sets or clears its bit inside the owning
/// field, after the field values are applied.
pub fn encode(
    definition: &MessageDefinition,
    fields: &[(&str, i64)],
    flags: &[(&str, bool)],
) -> Result<Frame, EncodeError> {
    let mut builder = FrameBuilder::new(definition);
    for (name, value) in fields {
        builder = builder.set(name, *value)?;
    }
    for (name, on) in flags {
        builder = builder.flag(name, *on)?;
    }
    builder.build()
}

/// Builder for encoding a frame value-by-value.
///
/// Uses the consuming-self pattern so that each `.set()` call moves
/// the builder, preventing accidental reuse of a half-built frame.
pub struct FrameBuilder<'a> {
    definition: &'a MessageDefinition,
    values: Vec<i64>,
}

impl<'a> FrameBuilder<'a> {
    pub fn new(definition: &'a MessageDefinition) -> Self {
        let values = definition
            .fields()
            .iter()
            .map(|field| match field.constraint {
                FieldConstraint::Fixed(value) => value,
                FieldConstraint::Free => 0,
            })
            .collect();
        Self { definition, values }
    }

    fn unknown(&self, field: &str) -> EncodeError {
        EncodeError::UnknownField {
            message: self.definition.name().to_owned(),
            field: field.to_owned(),
        }
    }

    /// Set a layout field by name.
    pub fn set(mut self, field: &str, value: i64) -> Result<Self, EncodeError> {
        let index = self
            .definition
            .field_index(field)
            .ok_or_else(|| self.unknown(field))?;
        if let FieldConstraint::Fixed(expected) = self.definition.fields()[index].constraint {
            if value != expected {
                return Err(EncodeError::FixedField {
                    field: field.to_owned(),
                    expected,
                    value,
                });
            }
        }
        check_range(self.definition, index, value)?;
        self.values[index] = value;
        Ok(self)
    }

    /// Set or clear a named bit-field.
    ///
    /// The bit is applied to the field's raw two's-complement bits, so the
    /// sign bit of a signed field yields a negative value. Changing a bit of
    /// a fixed field is an error.
    pub fn flag(mut self, name: &str, on: bool) -> Result<Self, EncodeError> {
        let bit = self.definition.bit(name).ok_or_else(|| self.unknown(name))?;
        let field = &self.definition.fields()[bit.field];
        let width_mask = (1u64 << field.bits()) - 1;
        let mut raw = self.values[bit.field] as u64 & width_mask;
        if on {
            raw |= 1u64 << bit.bit;
        } else {
            raw &= !(1u64 << bit.bit);
        }
        let value = if field.signed {
            field.layout().sign_extend(raw)
        } else {
            raw as i64
        };
        if let FieldConstraint::Fixed(expected) = field.constraint {
            if value != expected {
                return Err(EncodeError::FixedField {
                    field: field.name.clone(),
                    expected,
                    value,
                });
            }
        }
        self.values[bit.field] = value;
        Ok(self)
    }

    /// Consume the builder and produce the finished frame.
    pub fn build(self) -> Result<Frame, EncodeError> {
        let mut data = [0u8; 8];
        for (index, field) in self.definition.fields().iter().enumerate() {
            let raw = check_range(self.definition, index, self.values[index])?;
            field.layout().pack(&mut data, raw);
        }
        let len = self.definition.payload_len();
        let frame = Frame::new(self.definition.id(), self.definition.is_extended(), &data[..len])?;
        Ok(frame)
    }
}
