//! State vector layout: fixed-size byte encoding of all model state.
//!
//! The layout is computed once per model from the object table and each
//! object's declared schema, then reused for every state. Encoding is pure
//! with respect to the model; decoding mutates the live objects in place.

use crate::component::Stateful;
use crate::error::{ModelError, ModelResult};
use crate::object_table::{ObjRef, ObjectTable};
use crate::slot::{OverflowPolicy, SchemaBuilder, SlotDescriptor, SlotKind};
use tracing::debug;

/// Fixed layout of the serialized state vector for one model instance.
pub struct StateLayout {
    slots: Vec<SlotDescriptor>,
    /// Slot index range per object, in table identifier order.
    object_ranges: Vec<(usize, usize)>,
    object_names: Vec<&'static str>,
    table_len: usize,
    state_len: usize,
}

impl StateLayout {
    /// Compute the layout for all objects in the table.
    pub fn build(table: &ObjectTable) -> ModelResult<Self> {
        let mut slots = Vec::new();
        let mut object_ranges = Vec::with_capacity(table.len());
        let mut object_names = Vec::with_capacity(table.len());
        let mut offset = 0usize;

        for obj in table.iter() {
            let obj = obj.borrow();
            let mut builder = SchemaBuilder::new();
            obj.schema(&mut builder);
            let declared = builder.finish()?;

            let start = slots.len();
            for mut slot in declared {
                slot.offset = offset;
                offset += slot.width;
                slots.push(slot);
            }
            object_ranges.push((start, slots.len()));
            object_names.push(obj.type_name());
        }

        debug!(
            objects = table.len(),
            slots = slots.len(),
            bytes = offset,
            "state vector layout computed"
        );

        Ok(Self {
            slots,
            object_ranges,
            object_names,
            table_len: table.len(),
            state_len: offset,
        })
    }

    /// Total size of a serialized state in bytes.
    #[inline]
    pub fn state_len(&self) -> usize {
        self.state_len
    }

    /// Number of slots across all objects.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Serialize the current state of all table objects. Read-only with
    /// respect to the model.
    pub fn encode(&self, table: &ObjectTable) -> ModelResult<Vec<u8>> {
        let mut buf = vec![0u8; self.state_len];
        self.encode_into(table, &mut buf)?;
        Ok(buf)
    }

    /// Serialize into a caller-provided buffer of exactly `state_len` bytes.
    pub fn encode_into(&self, table: &ObjectTable, buf: &mut [u8]) -> ModelResult<()> {
        if buf.len() != self.state_len {
            return Err(ModelError::StateSizeMismatch {
                expected: self.state_len,
                found: buf.len(),
            });
        }
        for (i, obj) in table.iter().enumerate() {
            let (start, end) = self.object_ranges[i];
            let mut writer = SlotWriter {
                slots: &self.slots[start..end],
                buf: &mut *buf,
                cursor: 0,
                table_len: self.table_len,
            };
            obj.borrow().encode(&mut writer)?;
            writer.finish(self.object_names[i])?;
        }
        Ok(())
    }

    /// Restore all table objects to the state captured in `bytes`.
    pub fn decode(&self, table: &ObjectTable, bytes: &[u8]) -> ModelResult<()> {
        if bytes.len() != self.state_len {
            return Err(ModelError::StateSizeMismatch {
                expected: self.state_len,
                found: bytes.len(),
            });
        }
        for (i, obj) in table.iter().enumerate() {
            let (start, end) = self.object_ranges[i];
            let mut reader = SlotReader {
                slots: &self.slots[start..end],
                bytes,
                cursor: 0,
                table_len: self.table_len,
            };
            obj.borrow_mut().decode(&mut reader)?;
            reader.finish(self.object_names[i])?;
        }
        Ok(())
    }
}

fn store_raw(buf: &mut [u8], offset: usize, width: usize, raw: u64) {
    let bytes = raw.to_le_bytes();
    buf[offset..offset + width].copy_from_slice(&bytes[..width]);
}

fn load_raw(bytes: &[u8], offset: usize, width: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw[..width].copy_from_slice(&bytes[offset..offset + width]);
    u64::from_le_bytes(raw)
}

/// Writes one object's slots in schema order, validating kind and count.
pub struct SlotWriter<'a> {
    slots: &'a [SlotDescriptor],
    buf: &'a mut [u8],
    cursor: usize,
    table_len: usize,
}

impl<'a> SlotWriter<'a> {
    fn next(&mut self, found: &'static str) -> ModelResult<&'a SlotDescriptor> {
        let slot = self.slots.get(self.cursor).ok_or(ModelError::SlotCountMismatch {
            object: "<unknown>",
            expected: self.slots.len(),
            found: self.cursor + 1,
        })?;
        self.cursor += 1;
        match (&slot.kind, found) {
            (SlotKind::Bool, "bool")
            | (SlotKind::Ranged { .. }, "ranged integer")
            | (SlotKind::Enumeration { .. }, "enumeration")
            | (SlotKind::ObjectRef, "object reference") => Ok(slot),
            _ => Err(ModelError::SchemaMismatch {
                slot: slot.name,
                expected: slot.describe_kind(),
                found,
            }),
        }
    }

    pub fn write_bool(&mut self, value: bool) -> ModelResult<()> {
        let slot = self.next("bool")?;
        store_raw(self.buf, slot.offset, slot.width, value as u64);
        Ok(())
    }

    /// Write a bounded integer, applying the slot's overflow policy.
    pub fn write_int(&mut self, value: i64) -> ModelResult<()> {
        let slot = self.next("ranged integer")?;
        let SlotKind::Ranged { min, max, overflow } = slot.kind else {
            unreachable!("kind checked by next()");
        };
        let value = if value < min || value > max {
            match overflow {
                OverflowPolicy::Clamp => value.clamp(min, max),
                OverflowPolicy::Error => {
                    return Err(ModelError::RangeViolation {
                        slot: slot.name,
                        value,
                        min,
                        max,
                    })
                }
            }
        } else {
            value
        };
        let raw = (value as i128 - min as i128) as u64;
        store_raw(self.buf, slot.offset, slot.width, raw);
        Ok(())
    }

    pub fn write_enum(&mut self, value: u32) -> ModelResult<()> {
        let slot = self.next("enumeration")?;
        let SlotKind::Enumeration { variants } = slot.kind else {
            unreachable!("kind checked by next()");
        };
        if value >= variants {
            return Err(ModelError::RangeViolation {
                slot: slot.name,
                value: value as i64,
                min: 0,
                max: variants.saturating_sub(1) as i64,
            });
        }
        store_raw(self.buf, slot.offset, slot.width, value as u64);
        Ok(())
    }

    pub fn write_ref(&mut self, value: ObjRef) -> ModelResult<()> {
        let slot = self.next("object reference")?;
        if value.index() as usize > self.table_len {
            return Err(ModelError::InvalidReference {
                index: value.index(),
                len: self.table_len,
            });
        }
        store_raw(self.buf, slot.offset, slot.width, value.index() as u64);
        Ok(())
    }

    fn finish(self, object: &'static str) -> ModelResult<()> {
        if self.cursor == self.slots.len() {
            Ok(())
        } else {
            Err(ModelError::SlotCountMismatch {
                object,
                expected: self.slots.len(),
                found: self.cursor,
            })
        }
    }
}

/// Reads one object's slots in schema order, validating kind and count.
pub struct SlotReader<'a> {
    slots: &'a [SlotDescriptor],
    bytes: &'a [u8],
    cursor: usize,
    table_len: usize,
}

impl<'a> SlotReader<'a> {
    fn next(&mut self, found: &'static str) -> ModelResult<&'a SlotDescriptor> {
        let slot = self.slots.get(self.cursor).ok_or(ModelError::SlotCountMismatch {
            object: "<unknown>",
            expected: self.slots.len(),
            found: self.cursor + 1,
        })?;
        self.cursor += 1;
        match (&slot.kind, found) {
            (SlotKind::Bool, "bool")
            | (SlotKind::Ranged { .. }, "ranged integer")
            | (SlotKind::Enumeration { .. }, "enumeration")
            | (SlotKind::ObjectRef, "object reference") => Ok(slot),
            _ => Err(ModelError::SchemaMismatch {
                slot: slot.name,
                expected: slot.describe_kind(),
                found,
            }),
        }
    }

    pub fn read_bool(&mut self) -> ModelResult<bool> {
        let slot = self.next("bool")?;
        Ok(load_raw(self.bytes, slot.offset, slot.width) != 0)
    }

    pub fn read_int(&mut self) -> ModelResult<i64> {
        let slot = self.next("ranged integer")?;
        let SlotKind::Ranged { min, .. } = slot.kind else {
            unreachable!("kind checked by next()");
        };
        let raw = load_raw(self.bytes, slot.offset, slot.width);
        Ok((min as i128 + raw as i128) as i64)
    }

    pub fn read_enum(&mut self) -> ModelResult<u32> {
        let slot = self.next("enumeration")?;
        Ok(load_raw(self.bytes, slot.offset, slot.width) as u32)
    }

    pub fn read_ref(&mut self) -> ModelResult<ObjRef> {
        let slot = self.next("object reference")?;
        let raw = load_raw(self.bytes, slot.offset, slot.width) as u16;
        if raw as usize > self.table_len {
            return Err(ModelError::InvalidReference {
                index: raw,
                len: self.table_len,
            });
        }
        Ok(ObjRef(raw))
    }

    fn finish(self, object: &'static str) -> ModelResult<()> {
        if self.cursor == self.slots.len() {
            Ok(())
        } else {
            Err(ModelError::SlotCountMismatch {
                object,
                expected: self.slots.len(),
                found: self.cursor,
            })
        }
    }
}
