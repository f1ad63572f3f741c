/*!
 * Message catalog: the definitions of every frame the harness sends or expects,
 * loaded from the DBC files under `catalog/`.
 *
 * DBC conventions used by the catalog:
 * - a byte-aligned, big-endian signal of 8, 16 or 32 bits is a layout field;
 * - a 1-bit signal is a named bit-field of the layout field covering its byte;
 * - a field whose `[min|max]` range is a single value is fixed to that value.
 */

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::CatalogError;
use crate::signal_layout::SignalLayout;

/// Broadcast by a module on power-up, reboot or crash (extended ID).
pub const SIGN_ON_ID: u32 = 0x1FFF_FFF0;
/// Console text from the module firmware (extended ID).
pub const CONSOLE_ID: u32 = 0x1FFF_FFFE;
/// ISO-TP requests sent by the PDM's engine scanner.
pub const ISO_TP_SCANNER_ID: u32 = 0x6F1;
/// ISO-TP replies from the engine controller.
pub const ISO_TP_DDE_ID: u32 = 0x612;

const SIGN_ON_KIND: &str = "SignOn";

const COMMON_DBC: (&str, &str) = ("common.dbc", include_str!("../catalog/common.dbc"));
const TAIL_DBC: (&str, &str) = ("tail.dbc", include_str!("../catalog/tail.dbc"));
const TAIL_STATUS_DBC: (&str, &str) = (
    "tail_status.dbc",
    include_str!("../catalog/tail_status.dbc"),
);
const TAIL_STATUS_FUEL_DBC: (&str, &str) = (
    "tail_status_fuel.dbc",
    include_str!("../catalog/tail_status_fuel.dbc"),
);
const PDM_DBC: (&str, &str) = ("pdm.dbc", include_str!("../catalog/pdm.dbc"));

/// Module firmware under test. Each variant selects its own set of definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleVariant {
    /// Tail light module, 2-byte status report.
    Tail,
    /// Tail light module revision whose status carries the fuel-sender voltage.
    TailFuel,
    /// Power distribution module.
    Pdm,
}

impl ModuleVariant {
    pub const ALL: [ModuleVariant; 3] = [Self::Tail, Self::TailFuel, Self::Pdm];

    fn sources(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Tail => &[COMMON_DBC, TAIL_DBC, TAIL_STATUS_DBC],
            Self::TailFuel => &[COMMON_DBC, TAIL_DBC, TAIL_STATUS_FUEL_DBC],
            Self::Pdm => &[COMMON_DBC, PDM_DBC],
        }
    }

    /// Kind name of the periodic status report.
    pub fn status_kind(self) -> &'static str {
        match self {
            Self::Tail | Self::TailFuel => "TailStatus",
            Self::Pdm => "PdmStatus",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Tail => "tail",
            Self::TailFuel => "tail-fuel",
            Self::Pdm => "pdm",
        }
    }
}

impl fmt::Display for ModuleVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModuleVariant {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.name() == s)
            .ok_or_else(|| CatalogError::UnknownVariant(s.to_owned()))
    }
}

/// Value restriction on one layout field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldConstraint {
    Free,
    /// Field must carry exactly this value (protocol magic, fixed status bytes).
    Fixed(i64),
}

/// One big-endian integer field of a message layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    /// Byte offset within the payload.
    pub offset: usize,
    /// Width in bytes: 1, 2 or 4.
    pub width: usize,
    pub signed: bool,
    pub constraint: FieldConstraint,
    layout: SignalLayout,
}

impl FieldSpec {
    pub fn new(
        name: &str,
        offset: usize,
        width: usize,
        signed: bool,
        constraint: FieldConstraint,
    ) -> Self {
        let start_bit = (offset * 8 + 7) as u64;
        Self {
            name: name.to_owned(),
            offset,
            width,
            signed,
            constraint,
            layout: SignalLayout::big_endian(start_bit, (width * 8) as u64),
        }
    }

    pub fn unsigned(name: &str, offset: usize, width: usize) -> Self {
        Self::new(name, offset, width, false, FieldConstraint::Free)
    }

    pub fn fixed(name: &str, offset: usize, width: usize, value: i64) -> Self {
        Self::new(name, offset, width, false, FieldConstraint::Fixed(value))
    }

    pub fn layout(&self) -> &SignalLayout {
        &self.layout
    }

    pub fn bits(&self) -> u32 {
        (self.width * 8) as u32
    }

    /// Smallest value the field can carry.
    pub fn min(&self) -> i64 {
        if self.signed {
            -(1i64 << (self.bits() - 1))
        } else {
            0
        }
    }

    /// Largest value the field can carry.
    pub fn max(&self) -> i64 {
        if self.signed {
            (1i64 << (self.bits() - 1)) - 1
        } else {
            (1i64 << self.bits()) - 1
        }
    }
}

/// Location of a named boolean inside the decoded value tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRef {
    /// Index into the layout fields.
    pub field: usize,
    /// Bit position within that field's value, LSB = 0.
    pub bit: u8,
}

/// Static descriptor for one message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDefinition {
    name: String,
    id: u32,
    is_extended: bool,
    fields: Vec<FieldSpec>,
    bits: BTreeMap<String, BitRef>,
}

impl MessageDefinition {
    /// Build a definition. Fields must be ordered and tile the payload from
    /// byte 0 without holes; bit-fields must point inside their field.
    pub fn new(
        name: &str,
        id: u32,
        is_extended: bool,
        fields: Vec<FieldSpec>,
        bits: BTreeMap<String, BitRef>,
    ) -> Result<Self, CatalogError> {
        let mut expected_offset = 0;
        for field in &fields {
            if field.offset != expected_offset || !matches!(field.width, 1 | 2 | 4) {
                return Err(CatalogError::LayoutGap {
                    message: name.to_owned(),
                    offset: expected_offset,
                });
            }
            expected_offset += field.width;
        }
        for (bit_name, bit) in &bits {
            let in_range = fields
                .get(bit.field)
                .is_some_and(|field| (bit.bit as u32) < field.bits());
            if !in_range {
                return Err(CatalogError::OrphanBit {
                    message: name.to_owned(),
                    signal: bit_name.clone(),
                });
            }
        }
        Ok(Self {
            name: name.to_owned(),
            id,
            is_extended,
            fields,
            bits,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Payload length implied by the layout.
    pub fn payload_len(&self) -> usize {
        self.fields.iter().map(|field| field.width).sum()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn bit(&self, name: &str) -> Option<BitRef> {
        self.bits.get(name).copied()
    }

    /// Named bit-fields in name order.
    pub fn bits(&self) -> impl Iterator<Item = (&str, BitRef)> {
        self.bits.iter().map(|(name, bit)| (name.as_str(), *bit))
    }

    /// Convert one DBC message into a definition, applying the catalog conventions.
    pub fn from_dbc(message: &can_dbc::Message) -> Result<Self, CatalogError> {
        let name = message.message_name().as_str();
        let raw_id = message.message_id().raw();
        let is_extended = raw_id & 0x8000_0000 != 0;
        let id = raw_id & 0x1FFF_FFFF;

        let unsupported = |signal: &can_dbc::Signal, reason| CatalogError::UnsupportedSignal {
            message: name.to_owned(),
            signal: signal.name().clone(),
            reason,
        };

        let mut fields = Vec::new();
        let mut flags = Vec::new();
        for signal in message.signals() {
            let layout =
                SignalLayout::from_spec(signal).ok_or_else(|| unsupported(signal, "little-endian"))?;
            if signal.signal_size == 1 {
                flags.push((signal.name().clone(), signal.start_bit));
                continue;
            }
            if !matches!(signal.signal_size, 8 | 16 | 32) || !layout.is_byte_aligned() {
                return Err(unsupported(signal, "fields must be 8, 16 or 32 bits and byte aligned"));
            }
            let signed = matches!(signal.value_type(), can_dbc::ValueType::Signed);
            let constraint = if signal.min() == signal.max() {
                FieldConstraint::Fixed(*signal.min() as i64)
            } else {
                FieldConstraint::Free
            };
            fields.push(FieldSpec::new(
                signal.name(),
                layout.first_byte(),
                (signal.signal_size / 8) as usize,
                signed,
                constraint,
            ));
        }
        fields.sort_by_key(|field| field.offset);

        let declared = *message.message_size() as usize;
        let covered: usize = fields.iter().map(|field| field.width).sum();
        if covered != declared {
            return Err(CatalogError::LayoutLength {
                message: name.to_owned(),
                declared,
                covered,
            });
        }

        let mut bits = BTreeMap::new();
        for (flag, start_bit) in flags {
            let byte = (start_bit / 8) as usize;
            let position = fields
                .iter()
                .position(|field| (field.offset..field.offset + field.width).contains(&byte));
            let Some(field) = position else {
                return Err(CatalogError::OrphanBit {
                    message: name.to_owned(),
                    signal: flag,
                });
            };
            // Big-endian: the last byte of the field holds the value's low bits.
            let last_byte = fields[field].offset + fields[field].width - 1;
            let bit = ((last_byte - byte) * 8) as u8 + (start_bit % 8) as u8;
            bits.insert(flag, BitRef { field, bit });
        }

        Self::new(name, id, is_extended, fields, bits)
    }
}

/// The set of known message definitions for one module variant.
#[derive(Debug, Clone)]
pub struct Catalog {
    variant: ModuleVariant,
    definitions: BTreeMap<String, Arc<MessageDefinition>>,
}

impl Catalog {
    /// Load the built-in definitions for a module variant.
    pub fn for_variant(variant: ModuleVariant) -> Result<Self, CatalogError> {
        let mut catalog = Catalog {
            variant,
            definitions: BTreeMap::new(),
        };
        for (source_name, text) in variant.sources() {
            catalog.extend_from_dbc(source_name, text)?;
        }
        Ok(catalog)
    }

    /// Add every message of a DBC text. Names already in the catalog are rejected.
    pub fn extend_from_dbc(&mut self, source_name: &str, text: &str) -> Result<(), CatalogError> {
        let dbc = can_dbc::DBC::from_slice(text.as_bytes()).map_err(|e| {
            let mut reason = format!("{e:?}");
            reason.truncate(200);
            CatalogError::Parse {
                source_name: source_name.to_owned(),
                reason,
            }
        })?;
        for message in dbc.messages() {
            let definition = MessageDefinition::from_dbc(message)?;
            if self.definitions.contains_key(definition.name()) {
                return Err(CatalogError::DuplicateMessage(definition.name().to_owned()));
            }
            self.definitions
                .insert(definition.name().to_owned(), Arc::new(definition));
        }
        Ok(())
    }

    /// Add the messages of DBC files on disk.
    pub fn extend_from_files<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<(), CatalogError> {
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
                path: path.display().to_string(),
                source,
            })?;
            self.extend_from_dbc(&path.display().to_string(), &text)?;
        }
        Ok(())
    }

    pub fn variant(&self) -> ModuleVariant {
        self.variant
    }

    pub fn status_kind(&self) -> &'static str {
        self.variant.status_kind()
    }

    /// Look up a definition by kind name.
    pub fn get(&self, kind: &str) -> Result<Arc<MessageDefinition>, CatalogError> {
        self.definitions
            .get(kind)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownMessage(kind.to_owned()))
    }

    /// Definition carried by a given arbitration ID, if any.
    pub fn by_id(&self, id: u32, is_extended: bool) -> Option<Arc<MessageDefinition>> {
        self.definitions
            .values()
            .find(|def| def.id() == id && def.is_extended() == is_extended)
            .cloned()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Arc<MessageDefinition>> {
        self.definitions.values()
    }

    pub fn sign_on(&self) -> Result<Arc<MessageDefinition>, CatalogError> {
        self.get(SIGN_ON_KIND)
    }

    pub fn status(&self) -> Result<Arc<MessageDefinition>, CatalogError> {
        self.get(self.status_kind())
    }

    /// Messages the harness cares about when no explicit filter is given.
    pub fn default_filter(&self) -> Result<Vec<u32>, CatalogError> {
        Ok(vec![SIGN_ON_ID, self.status()?.id()])
    }
}
