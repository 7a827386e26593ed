// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A validated view of a [Flattened Device Tree (FDT)] blob.
//!
//! This module checks the self-describing header of a blob and exposes the
//! memory reservation block and a token-level cursor over the structure
//! block. The cursor is consumed by
//! [`DeviceTree::from_fdt`](crate::model::DeviceTree::from_fdt), which
//! unflattens the whole blob in a single pass; there is no lazy node view.
//!
//! [Flattened Device Tree (FDT)]: https://devicetree-specification.readthedocs.io/en/latest/chapter5-flattened-format.html

use core::ffi::CStr;
use core::fmt;
use core::mem::offset_of;

use zerocopy::byteorder::big_endian;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{FdtError, FdtErrorKind};

/// Version of the FDT specification supported by this library.
const FDT_VERSION: u32 = 17;
/// Oldest version blobs written by this library remain compatible with.
const FDT_COMP_VERSION: u32 = 16;
pub(crate) const FDT_TAGSIZE: usize = size_of::<u32>();
pub(crate) const FDT_MAGIC: u32 = 0xd00d_feed;
pub(crate) const FDT_BEGIN_NODE: u32 = 0x1;
pub(crate) const FDT_END_NODE: u32 = 0x2;
pub(crate) const FDT_PROP: u32 = 0x3;
pub(crate) const FDT_NOP: u32 = 0x4;
pub(crate) const FDT_END: u32 = 0x9;

#[repr(C, packed)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub(crate) struct FdtHeader {
    /// Magic number of the device tree.
    pub(crate) magic: big_endian::U32,
    /// Total size of the device tree.
    pub(crate) totalsize: big_endian::U32,
    /// Offset of the device tree structure.
    pub(crate) off_dt_struct: big_endian::U32,
    /// Offset of the device tree strings.
    pub(crate) off_dt_strings: big_endian::U32,
    /// Offset of the memory reservation map.
    pub(crate) off_mem_rsvmap: big_endian::U32,
    /// Version of the device tree.
    pub(crate) version: big_endian::U32,
    /// Last compatible version of the device tree.
    pub(crate) last_comp_version: big_endian::U32,
    /// Physical ID of the boot CPU.
    pub(crate) boot_cpuid_phys: big_endian::U32,
    /// Size of the device tree strings.
    pub(crate) size_dt_strings: big_endian::U32,
    /// Size of the device tree structure.
    pub(crate) size_dt_struct: big_endian::U32,
}

impl FdtHeader {
    /// Assembles the header for a blob whose blocks follow the header in
    /// the usual order: reservation map, structure block, strings block.
    ///
    /// # Panics
    ///
    /// Panics if the resulting layout does not fit the header's 32-bit
    /// offset and size fields.
    pub(crate) fn for_blocks(rsvmap_len: usize, struct_len: usize, strings_len: usize) -> Self {
        fn field(value: usize) -> big_endian::U32 {
            u32::try_from(value)
                .expect("blob layout exceeds the 32-bit header fields")
                .into()
        }

        let rsvmap_start = size_of::<FdtHeader>();
        let struct_start = rsvmap_start + rsvmap_len;
        let strings_start = struct_start + struct_len;

        FdtHeader {
            magic: FDT_MAGIC.into(),
            totalsize: field(strings_start + strings_len),
            off_dt_struct: field(struct_start),
            off_dt_strings: field(strings_start),
            off_mem_rsvmap: field(rsvmap_start),
            version: FDT_VERSION.into(),
            last_comp_version: FDT_COMP_VERSION.into(),
            boot_cpuid_phys: 0u32.into(),
            size_dt_strings: field(strings_len),
            size_dt_struct: field(struct_len),
        }
    }
}

/// A memory reservation entry of a device tree blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReservation {
    address: u64,
    size: u64,
}

impl MemoryReservation {
    /// Creates a new `MemoryReservation` with the given address and size.
    #[must_use]
    pub fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }

    /// Returns the address of the reserved region.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the reserved region in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A validated flattened device tree blob.
///
/// # Examples
///
/// ```
/// # use dt_overlay::{DeviceTree, Fdt};
/// let dtb = DeviceTree::new().to_dtb();
/// let fdt = Fdt::new(&dtb).unwrap();
/// assert_eq!(fdt.version(), 17);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Fdt<'a> {
    data: &'a [u8],
}

impl<'a> Fdt<'a> {
    /// Creates a new `Fdt` from the given byte slice.
    ///
    /// The slice may be longer than the size the header declares; the view
    /// narrows itself to the declared `totalsize`. A slice shorter than the
    /// declared size is rejected.
    ///
    /// # Errors
    ///
    /// Returns an [`FdtErrorKind::InvalidLength`] if `data` is too short to
    /// contain a valid FDT header or is shorter than the `totalsize` field
    /// in the header.
    ///
    /// Returns an [`FdtErrorKind::InvalidMagic`] if the `magic` field in the
    /// header is not `0xd00dfeed`.
    ///
    /// Returns an [`FdtErrorKind::UnsupportedVersion`] if the `version`
    /// field in the header is not supported by this library.
    ///
    /// Returns an [`FdtErrorKind::InvalidHeader`] if the header fails to
    /// pass the header integrity checks.
    pub fn new(data: &'a [u8]) -> Result<Self, FdtError> {
        if data.len() < size_of::<FdtHeader>() {
            return Err(FdtError::new(FdtErrorKind::InvalidLength, 0));
        }

        let (header, _) = FdtHeader::ref_from_prefix(data)
            .map_err(|_| FdtError::new(FdtErrorKind::InvalidLength, 0))?;

        if header.magic.get() != FDT_MAGIC {
            return Err(FdtError::new(
                FdtErrorKind::InvalidMagic,
                offset_of!(FdtHeader, magic),
            ));
        }
        if !(header.last_comp_version.get()..=header.version.get()).contains(&FDT_VERSION) {
            return Err(FdtError::new(
                FdtErrorKind::UnsupportedVersion(header.version.get()),
                offset_of!(FdtHeader, version),
            ));
        }

        let totalsize = header.totalsize.get() as usize;
        if totalsize < size_of::<FdtHeader>() || totalsize > data.len() {
            return Err(FdtError::new(
                FdtErrorKind::InvalidLength,
                offset_of!(FdtHeader, totalsize),
            ));
        }

        let fdt = Fdt {
            data: &data[..totalsize],
        };
        fdt.validate_header()?;

        Ok(fdt)
    }

    fn validate_header(&self) -> Result<(), FdtError> {
        let header = self.header();
        let len = self.data.len();

        let off_mem_rsvmap = header.off_mem_rsvmap.get() as usize;
        let off_dt_struct = header.off_dt_struct.get() as usize;
        let off_dt_strings = header.off_dt_strings.get() as usize;
        if off_mem_rsvmap > off_dt_struct {
            return Err(FdtError::new(
                FdtErrorKind::InvalidHeader("dt_struct not after memrsvmap"),
                offset_of!(FdtHeader, off_mem_rsvmap),
            ));
        }
        if off_dt_struct > len {
            return Err(FdtError::new(
                FdtErrorKind::InvalidHeader("struct offset out of bounds"),
                offset_of!(FdtHeader, off_dt_struct),
            ));
        }
        if off_dt_strings > len {
            return Err(FdtError::new(
                FdtErrorKind::InvalidHeader("strings offset out of bounds"),
                offset_of!(FdtHeader, off_dt_strings),
            ));
        }

        let size_dt_struct = header.size_dt_struct.get() as usize;
        let size_dt_strings = header.size_dt_strings.get() as usize;
        if off_dt_struct.saturating_add(size_dt_struct) > len {
            return Err(FdtError::new(
                FdtErrorKind::InvalidHeader("struct block overflows"),
                offset_of!(FdtHeader, size_dt_struct),
            ));
        }
        if off_dt_strings.saturating_add(size_dt_strings) > len {
            return Err(FdtError::new(
                FdtErrorKind::InvalidHeader("strings block overflows"),
                offset_of!(FdtHeader, size_dt_strings),
            ));
        }
        if off_dt_struct.saturating_add(size_dt_struct) > off_dt_strings {
            return Err(FdtError::new(
                FdtErrorKind::InvalidHeader("strings block not after struct block"),
                offset_of!(FdtHeader, off_dt_strings),
            ));
        }

        Ok(())
    }

    pub(crate) fn header(&self) -> &FdtHeader {
        let (header, _remaining_bytes) = FdtHeader::ref_from_prefix(self.data)
            .expect("new() checks if the slice is at least as big as the header");
        header
    }

    /// Returns the underlying data slice, narrowed to the declared size.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the version of the FDT.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.header().version.get()
    }

    /// Returns the last compatible version of the FDT.
    #[must_use]
    pub fn last_comp_version(&self) -> u32 {
        self.header().last_comp_version.get()
    }

    /// Returns the physical ID of the boot CPU.
    #[must_use]
    pub fn boot_cpuid_phys(&self) -> u32 {
        self.header().boot_cpuid_phys.get()
    }

    /// Returns an iterator over the memory reservation block.
    pub fn memory_reservations(&self) -> impl Iterator<Item = MemoryReservation> + 'a {
        let offset = self.header().off_mem_rsvmap.get() as usize;
        let mut data = self.data.get(offset..).unwrap_or(&[]);
        core::iter::from_fn(move || {
            let (address, data_after_addr) = big_endian::U64::ref_from_prefix(data).ok()?;
            let (size, data_after_size) = big_endian::U64::ref_from_prefix(data_after_addr).ok()?;
            data = data_after_size;
            if address.get() == 0 && size.get() == 0 {
                return None;
            }
            Some(MemoryReservation::new(address.get(), size.get()))
        })
    }

    /// Returns a cursor positioned at the start of the structure block.
    pub(crate) fn tokens(&self) -> TokenCursor<'a> {
        TokenCursor {
            data: self.data,
            strings_start: self.header().off_dt_strings.get() as usize,
            strings_end: (self.header().off_dt_strings.get()
                + self.header().size_dt_strings.get()) as usize,
            offset: self.header().off_dt_struct.get() as usize,
        }
    }
}

/// A token of the structure block, with its payload already decoded.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FdtToken<'a> {
    BeginNode(&'a str),
    Prop { name: &'a str, value: &'a [u8] },
    EndNode,
    End,
}

/// A sequential reader over the structure block. NOP tokens are skipped
/// transparently.
#[derive(Debug)]
pub(crate) struct TokenCursor<'a> {
    data: &'a [u8],
    strings_start: usize,
    strings_end: usize,
    offset: usize,
}

impl<'a> TokenCursor<'a> {
    pub(crate) fn next_token(&mut self) -> Result<FdtToken<'a>, FdtError> {
        loop {
            let token = self.read_u32()?;
            match token {
                FDT_NOP => {}
                FDT_BEGIN_NODE => {
                    let name = self.read_string()?;
                    self.align();
                    return Ok(FdtToken::BeginNode(name));
                }
                FDT_PROP => {
                    let len = self.read_u32()? as usize;
                    let nameoff = self.read_u32()? as usize;
                    let value = self
                        .data
                        .get(self.offset..self.offset + len)
                        .ok_or(FdtError::new(FdtErrorKind::InvalidLength, self.offset))?;
                    self.offset += len;
                    self.align();
                    let name = self.string_block_entry(nameoff)?;
                    return Ok(FdtToken::Prop { name, value });
                }
                FDT_END_NODE => return Ok(FdtToken::EndNode),
                FDT_END => return Ok(FdtToken::End),
                bad => {
                    return Err(FdtError::new(
                        FdtErrorKind::BadToken(bad),
                        self.offset - FDT_TAGSIZE,
                    ));
                }
            }
        }
    }

    fn read_u32(&mut self) -> Result<u32, FdtError> {
        let slice = self
            .data
            .get(self.offset..)
            .ok_or(FdtError::new(FdtErrorKind::InvalidLength, self.offset))?;
        let (val, _) = big_endian::U32::ref_from_prefix(slice)
            .map_err(|_| FdtError::new(FdtErrorKind::InvalidLength, self.offset))?;
        self.offset += FDT_TAGSIZE;
        Ok(val.get())
    }

    /// Reads the NUL-terminated string at the current offset and advances
    /// past its terminator.
    fn read_string(&mut self) -> Result<&'a str, FdtError> {
        let slice = self
            .data
            .get(self.offset..)
            .ok_or(FdtError::new(FdtErrorKind::InvalidOffset, self.offset))?;
        let s = match CStr::from_bytes_until_nul(slice).map(CStr::to_str) {
            Ok(Ok(val)) => val,
            _ => return Err(FdtError::new(FdtErrorKind::InvalidString, self.offset)),
        };
        self.offset += s.len() + 1;
        Ok(s)
    }

    fn string_block_entry(&self, nameoff: usize) -> Result<&'a str, FdtError> {
        let start = self.strings_start + nameoff;
        let slice = self
            .data
            .get(start..self.strings_end)
            .ok_or(FdtError::new(FdtErrorKind::InvalidOffset, start))?;
        match CStr::from_bytes_until_nul(slice).map(CStr::to_str) {
            Ok(Ok(val)) => Ok(val),
            _ => Err(FdtError::new(FdtErrorKind::InvalidString, start)),
        }
    }

    fn align(&mut self) {
        self.offset = align_tag_offset(self.offset);
    }
}

pub(crate) fn align_tag_offset(offset: usize) -> usize {
    offset.next_multiple_of(FDT_TAGSIZE)
}

impl fmt::Display for Fdt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match crate::model::DeviceTree::from_fdt(self) {
            Ok(tree) => fmt::Display::fmt(&tree, f),
            Err(_) => Err(fmt::Error),
        }
    }
}
