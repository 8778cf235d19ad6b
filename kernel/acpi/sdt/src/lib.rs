//! ACPI table definitions and basic SDT structures.
#![no_std]

#[cfg(test)]
#[macro_use] extern crate std;

use zerocopy::{FromBytes, FromZeroes};

/// The size in bytes of the ACPI SDT Header (`Sdt` struct).
pub const SDT_SIZE_IN_BYTES: usize = core::mem::size_of::<Sdt>();

/// An ACPI System Descriptor Table.
/// This is the header (the first part) of every ACPI table.
#[derive(Copy, Clone, Debug, FromZeroes, FromBytes)]
#[repr(C, packed)]
pub struct Sdt {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}
const _: () = assert!(core::mem::size_of::<Sdt>() == 36);
const _: () = assert!(core::mem::align_of::<Sdt>() == 1);

impl Sdt {
    /// Decodes the SDT header at the start of `table`, which must hold at
    /// least [`SDT_SIZE_IN_BYTES`] bytes.
    pub fn from_prefix(table: &[u8]) -> Option<Sdt> {
        Sdt::read_from_prefix(table)
    }

    /// Returns `true` if the bytes of the whole table sum to zero (mod 256),
    /// the ACPI validity check.
    pub fn checksum_valid(table: &[u8]) -> bool {
        table.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
    }
}
