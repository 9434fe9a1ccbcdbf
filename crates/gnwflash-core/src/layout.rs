//! Shared memory layout
//!
//! The firmware places its communication variables at addresses fixed by its
//! linker script. The host mirrors that struct as an ordered list of
//! `(name, size)` fields and packs them at consecutive addresses from a base.
//! Nothing at runtime can detect a mismatch between this table and the
//! firmware build, so a table can also be loaded from a TOML file generated
//! alongside the firmware:
//!
//! ```toml
//! [system]
//! base = 0x2000_0000
//! fields = [
//!     { name = "boot_magic", size = 4 },
//!     { name = "log_idx", size = 4 },
//! ]
//!
//! [comm]
//! base = "0x24025800"
//! fields = [{ name = "flashapp_state", size = 4 }]
//!
//! [context]
//! fields = [{ name = "size", size = 4 }]
//! ```
//!
//! Fields whose name starts with `_` are reserved: they occupy space but are
//! never accessed by the host.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Base of the memory-mapped extflash read window
pub const READ_WINDOW_BASE: u32 = 0x9000_0000;

/// Minimum erase granularity of the external flash
pub const ERASE_ALIGNMENT: u32 = 4096;

/// Number of transfer contexts shared with the firmware
pub const CONTEXT_COUNT: usize = 2;

/// Size of each transfer context buffer
pub const CONTEXT_BUFFER_SIZE: u32 = 256 << 10;

/// Base of the always-present system block
pub const SYSTEM_BASE: u32 = 0x2000_0000;

/// First LCD framebuffer (AXI SRAM)
pub const FRAMEBUFFER1_BASE: u32 = 0x2400_0000;

/// Size of one 320x240 RGB565 framebuffer
pub const FRAMEBUFFER_SIZE: u32 = 320 * 240 * 2;

/// The comm block lives in the second framebuffer, unused while flashing
pub const COMM_BASE: u32 = FRAMEBUFFER1_BASE + FRAMEBUFFER_SIZE;

/// A named view into shared memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommVariable {
    /// Target address
    pub address: u32,
    /// Size in bytes
    pub size: u32,
}

impl CommVariable {
    /// Create a variable
    pub const fn new(address: u32, size: u32) -> Self {
        Self { address, size }
    }

    /// First address past the variable
    pub fn end(&self) -> u64 {
        u64::from(self.address) + u64::from(self.size)
    }
}

/// One field of a firmware struct
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldSpec {
    /// Field name; a leading `_` marks it reserved
    pub name: String,
    /// Field size in bytes
    pub size: u32,
}

impl FieldSpec {
    /// Create a field
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Whether the field only exists for alignment
    pub fn is_reserved(&self) -> bool {
        self.name.starts_with('_')
    }
}

fn fields(list: &[(&str, u32)]) -> Vec<FieldSpec> {
    list.iter()
        .map(|(name, size)| FieldSpec::new(*name, *size))
        .collect()
}

/// Immutable name to address table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutTable {
    entries: Vec<(String, CommVariable)>,
}

impl LayoutTable {
    /// Pack `fields` at consecutive addresses starting at `base`
    pub fn build(base: u32, fields: &[FieldSpec]) -> Result<Self> {
        let mut table = Self::default();
        let mut next = u64::from(base);

        for field in fields {
            if field.size == 0 {
                return Err(Error::Layout(format!("field '{}' has zero size", field.name)));
            }
            let address = u32::try_from(next).map_err(|_| {
                Error::Layout(format!(
                    "field '{}' starts past the 32-bit address space",
                    field.name
                ))
            })?;
            table.insert(field.name.clone(), CommVariable::new(address, field.size))?;
            next += u64::from(field.size);
        }

        if next > u64::from(u32::MAX) + 1 {
            return Err(Error::Layout(
                "layout ends past the 32-bit address space".into(),
            ));
        }

        Ok(table)
    }

    fn insert(&mut self, name: String, var: CommVariable) -> Result<()> {
        if self.get(&name).is_some() {
            return Err(Error::Layout(format!("duplicate field '{}'", name)));
        }
        self.entries.push((name, var));
        Ok(())
    }

    /// Append all entries of `other`, prefixing their names
    pub fn extend_prefixed(&mut self, prefix: &str, other: &LayoutTable) -> Result<()> {
        for (name, var) in &other.entries {
            self.insert(format!("{}{}", prefix, name), *var)?;
        }
        Ok(())
    }

    /// Look up a variable by name
    pub fn get(&self, name: &str) -> Option<CommVariable> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, var)| *var)
    }

    /// Look up a variable that must exist
    pub fn require(&self, name: &str) -> Result<CommVariable> {
        self.get(name)
            .ok_or_else(|| Error::Layout(format!("missing field '{}'", name)))
    }

    /// Look up a variable that must exist and have an exact size
    pub fn require_sized(&self, name: &str, size: u32) -> Result<CommVariable> {
        let var = self.require(name)?;
        if var.size != size {
            return Err(Error::Layout(format!(
                "field '{}' is {} bytes, expected {}",
                name, var.size, size
            )));
        }
        Ok(var)
    }

    /// First address past the last entry (the base for an empty table is 0)
    pub fn end(&self) -> u64 {
        self.entries
            .iter()
            .map(|(_, var)| var.end())
            .max()
            .unwrap_or(0)
    }

    /// Iterate over `(name, variable)` in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, CommVariable)> {
        self.entries.iter().map(|(name, var)| (name.as_str(), *var))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Layout specification (built-in or TOML)
// =============================================================================

/// A block of fields packed from a base address
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockSpec {
    /// Address of the first field
    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub base: u32,
    /// Fields in firmware declaration order
    pub fields: Vec<FieldSpec>,
}

/// Field list of one transfer context struct
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContextSpec {
    /// Fields in firmware declaration order
    pub fields: Vec<FieldSpec>,
}

/// Complete description of the dual-context protocol layout
///
/// The contexts are packed directly after the comm block, one after the
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LayoutSpec {
    /// Boot handshake, log buffer and mirrored littlefs config
    pub system: BlockSpec,
    /// State machine variables
    pub comm: BlockSpec,
    /// Transfer context struct
    pub context: ContextSpec,
}

impl LayoutSpec {
    /// Layout of the dual-context firmware
    pub fn dual_context() -> Self {
        Self {
            system: BlockSpec {
                base: SYSTEM_BASE,
                fields: fields(&[
                    ("boot_magic", 4),
                    ("log_idx", 4),
                    ("logbuf", 4096),
                    ("lfs_cfg_context", 4),
                    ("lfs_cfg_read", 4),
                    ("lfs_cfg_prog", 4),
                    ("lfs_cfg_erase", 4),
                    ("lfs_cfg_sync", 4),
                    ("lfs_cfg_read_size", 4),
                    ("lfs_cfg_prog_size", 4),
                    ("lfs_cfg_block_size", 4),
                    ("lfs_cfg_block_count", 4),
                ]),
            },
            comm: BlockSpec {
                base: COMM_BASE,
                fields: fields(&[
                    ("flashapp_state", 4),
                    ("program_status", 4),
                    ("utc_timestamp", 4),
                    ("program_chunk_idx", 4),
                    ("program_chunk_count", 4),
                ]),
            },
            context: ContextSpec {
                fields: fields(&[
                    ("size", 4),
                    ("address", 4),
                    ("erase", 4),
                    ("erase_bytes", 4),
                    ("decompressed_size", 4),
                    ("expected_sha256", 32),
                    ("expected_sha256_decompressed", 32),
                    ("_reserved", 4),
                    ("buffer", CONTEXT_BUFFER_SIZE),
                    ("ready", 4),
                ]),
            },
        }
    }

    /// Parse a layout from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Layout(format!("TOML parse error: {}", e)))
    }

    /// Load a layout from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Layout(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }
}

impl Default for LayoutSpec {
    fn default() -> Self {
        Self::dual_context()
    }
}

/// Deserialize a u32 that can be hex (0x...) or decimal, as integer or string
fn deserialize_hex_u32<'de, D>(deserializer: D) -> core::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Int(u32),
        Str(String),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Str(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a number that can be hex (0x...) or decimal, with `_` separators
pub fn parse_number(s: &str) -> core::result::Result<u32, String> {
    let s = s.trim().replace('_', "");
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex: {}", e))
    } else {
        s.parse().map_err(|e| format!("invalid number: {}", e))
    }
}

// =============================================================================
// Resolved protocol layout
// =============================================================================

/// Addresses of one transfer context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLayout {
    /// Context number (0-based)
    pub index: usize,
    /// Bytes of payload in `buffer`
    pub size: CommVariable,
    /// Destination extflash offset
    pub address: CommVariable,
    /// Non-zero to erase before programming
    pub erase: CommVariable,
    /// Bytes to erase from `address`, 0 for the whole chip
    pub erase_bytes: CommVariable,
    /// Decompressed payload length, 0 when the payload is raw
    pub decompressed_size: CommVariable,
    /// SHA-256 of the payload as transferred
    pub expected_sha256: CommVariable,
    /// SHA-256 of the decompressed payload
    pub expected_sha256_decompressed: CommVariable,
    /// Payload buffer
    pub buffer: CommVariable,
    /// 1 while the context is owned by the device
    pub ready: CommVariable,
}

impl ContextLayout {
    fn from_table(index: usize, table: &LayoutTable) -> Result<Self> {
        Ok(Self {
            index,
            size: table.require_sized("size", 4)?,
            address: table.require_sized("address", 4)?,
            erase: table.require_sized("erase", 4)?,
            erase_bytes: table.require_sized("erase_bytes", 4)?,
            decompressed_size: table.require_sized("decompressed_size", 4)?,
            expected_sha256: table.require_sized("expected_sha256", 32)?,
            expected_sha256_decompressed: table
                .require_sized("expected_sha256_decompressed", 32)?,
            buffer: table.require("buffer")?,
            ready: table.require_sized("ready", 4)?,
        })
    }
}

/// Mirrored `struct lfs_config` fields the host reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LfsConfigLayout {
    /// Memory-mapped address of the filesystem partition
    pub context: CommVariable,
    /// Minimum read size
    pub read_size: CommVariable,
    /// Minimum program size
    pub prog_size: CommVariable,
    /// Erase block size
    pub block_size: CommVariable,
    /// Number of erase blocks
    pub block_count: CommVariable,
}

/// Every address the engine touches, resolved once at bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolLayout {
    /// Boot handshake word
    pub boot_magic: CommVariable,
    /// Bytes used in `logbuf`
    pub log_idx: CommVariable,
    /// Firmware log ring
    pub logbuf: CommVariable,
    /// Mirrored filesystem geometry
    pub lfs_cfg: LfsConfigLayout,
    /// Device state word
    pub flashapp_state: CommVariable,
    /// Device status word
    pub program_status: CommVariable,
    /// Host wall clock, reserved for timestamping files
    pub utc_timestamp: CommVariable,
    /// 1-based index of the chunk being submitted
    pub program_chunk_idx: CommVariable,
    /// Total chunks of the current write
    pub program_chunk_count: CommVariable,
    /// Transfer contexts
    pub contexts: [ContextLayout; CONTEXT_COUNT],
    table: LayoutTable,
}

impl ProtocolLayout {
    /// Resolve a layout specification
    pub fn from_spec(spec: &LayoutSpec) -> Result<Self> {
        let system = LayoutTable::build(spec.system.base, &spec.system.fields)?;
        let comm = LayoutTable::build(spec.comm.base, &spec.comm.fields)?;

        let context_size: u64 = spec.context.fields.iter().map(|f| u64::from(f.size)).sum();
        let mut table = LayoutTable::default();
        table.extend_prefixed("", &system)?;
        table.extend_prefixed("", &comm)?;

        let mut contexts = Vec::with_capacity(CONTEXT_COUNT);
        for index in 0..CONTEXT_COUNT {
            let base = comm.end() + index as u64 * context_size;
            let base = u32::try_from(base)
                .map_err(|_| Error::Layout(format!("context {} past address space", index)))?;
            let ctx_table = LayoutTable::build(base, &spec.context.fields)?;
            contexts.push(ContextLayout::from_table(index, &ctx_table)?);
            table.extend_prefixed(&format!("context{}.", index), &ctx_table)?;
        }

        let contexts: [ContextLayout; CONTEXT_COUNT] = contexts
            .try_into()
            .map_err(|_| Error::Layout("context count mismatch".into()))?;
        if contexts.iter().any(|c| c.buffer.size != contexts[0].buffer.size) {
            return Err(Error::Layout("context buffers differ in size".into()));
        }

        Ok(Self {
            boot_magic: system.require_sized("boot_magic", 4)?,
            log_idx: system.require_sized("log_idx", 4)?,
            logbuf: system.require("logbuf")?,
            lfs_cfg: LfsConfigLayout {
                context: system.require_sized("lfs_cfg_context", 4)?,
                read_size: system.require_sized("lfs_cfg_read_size", 4)?,
                prog_size: system.require_sized("lfs_cfg_prog_size", 4)?,
                block_size: system.require_sized("lfs_cfg_block_size", 4)?,
                block_count: system.require_sized("lfs_cfg_block_count", 4)?,
            },
            flashapp_state: comm.require_sized("flashapp_state", 4)?,
            program_status: comm.require_sized("program_status", 4)?,
            utc_timestamp: comm.require_sized("utc_timestamp", 4)?,
            program_chunk_idx: comm.require_sized("program_chunk_idx", 4)?,
            program_chunk_count: comm.require_sized("program_chunk_count", 4)?,
            contexts,
            table,
        })
    }

    /// Layout of the dual-context firmware
    pub fn dual_context() -> Result<Self> {
        Self::from_spec(&LayoutSpec::dual_context())
    }

    /// Capacity of one context buffer, i.e. the chunk size
    pub fn chunk_size(&self) -> usize {
        self.contexts[0].buffer.size as usize
    }

    /// Full address table, contexts prefixed with `contextN.`
    pub fn table(&self) -> &LayoutTable {
        &self.table
    }
}

/// Address table of the legacy single-buffer protocol
///
/// That firmware uses one shared transfer buffer aliased onto the second
/// framebuffer and a `program_start` doorbell instead of per-context ready
/// flags. It is not wire compatible with [`ProtocolLayout`].
pub fn legacy_table() -> Result<LayoutTable> {
    let framebuffers = LayoutTable::build(
        FRAMEBUFFER1_BASE,
        &fields(&[
            ("framebuffer1", FRAMEBUFFER_SIZE),
            ("framebuffer2", FRAMEBUFFER_SIZE),
        ]),
    )?;
    let comm = LayoutTable::build(
        SYSTEM_BASE,
        &fields(&[
            ("flashapp_state", 4),
            ("program_start", 4),
            ("program_status", 4),
            ("program_size", 4),
            ("program_address", 4),
            ("program_erase", 4),
            ("program_erase_bytes", 4),
            ("program_chunk_idx", 4),
            ("program_chunk_count", 4),
            ("program_expected_sha256", 65),
            ("_pad0", 3),
            ("boot_magic", 4),
            ("_pad1", 4),
            ("log_idx", 4),
            ("logbuf", 4096),
            ("_pad2", 4),
            ("lfs_cfg", 4),
        ]),
    )?;
    let lfs_cfg = LayoutTable::build(
        comm.require("lfs_cfg")?.address,
        &fields(&[
            ("context", 4),
            ("read", 4),
            ("prog", 4),
            ("erase", 4),
            ("sync", 4),
            ("read_size", 4),
            ("prog_size", 4),
            ("block_size", 4),
            ("block_count", 4),
        ]),
    )?;

    let mut table = LayoutTable::default();
    table.extend_prefixed("", &framebuffers)?;
    table.extend_prefixed("", &comm)?;
    table.extend_prefixed("lfs_cfg_", &lfs_cfg)?;
    let flash_buffer = framebuffers.require("framebuffer2")?;
    table.insert("flash_buffer".into(), flash_buffer)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_packs_consecutively() {
        let table =
            LayoutTable::build(0x1000, &fields(&[("a", 4), ("b", 32), ("c", 4)])).unwrap();
        assert_eq!(table.get("a"), Some(CommVariable::new(0x1000, 4)));
        assert_eq!(table.get("b"), Some(CommVariable::new(0x1004, 32)));
        assert_eq!(table.get("c"), Some(CommVariable::new(0x1024, 4)));
        assert_eq!(table.end(), 0x1028);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_build_rejects_bad_fields() {
        assert!(LayoutTable::build(0, &fields(&[("a", 4), ("a", 4)])).is_err());
        assert!(LayoutTable::build(0, &fields(&[("a", 0)])).is_err());
        assert!(LayoutTable::build(0xFFFF_FFFC, &fields(&[("a", 4)])).is_ok());
        assert!(LayoutTable::build(0xFFFF_FFFC, &fields(&[("a", 4), ("b", 4)])).is_err());
    }

    #[test]
    fn test_dual_context_layout() {
        let layout = ProtocolLayout::dual_context().unwrap();

        assert_eq!(layout.boot_magic.address, 0x2000_0000);
        assert_eq!(layout.flashapp_state.address, 0x2402_5800);
        assert_eq!(layout.program_status.address, 0x2402_5804);
        assert_eq!(layout.program_chunk_count.address, 0x2402_5810);

        let ctx0 = &layout.contexts[0];
        assert_eq!(ctx0.size.address, 0x2402_5814);
        assert_eq!(ctx0.expected_sha256.address, ctx0.decompressed_size.address + 4);
        assert_eq!(
            ctx0.expected_sha256_decompressed.address,
            ctx0.expected_sha256.address + 32
        );
        // One reserved word sits between the hashes and the buffer
        assert_eq!(
            ctx0.buffer.address,
            ctx0.expected_sha256_decompressed.address + 32 + 4
        );
        assert_eq!(ctx0.ready.address, ctx0.buffer.address + CONTEXT_BUFFER_SIZE);

        let ctx1 = &layout.contexts[1];
        assert_eq!(ctx1.size.address, ctx0.ready.address + 4);
        assert_eq!(layout.chunk_size(), 256 * 1024);
    }

    #[test]
    fn test_layout_table_contains_contexts() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let table = layout.table();
        assert_eq!(table.get("context1.ready"), Some(layout.contexts[1].ready));
        assert!(table.get("context0._reserved").is_some());
        assert_eq!(table.get("logbuf"), Some(layout.logbuf));
    }

    #[test]
    fn test_legacy_table_matches_firmware() {
        let table = legacy_table().unwrap();
        assert_eq!(table.get("framebuffer2").unwrap().address, 0x2402_5800);
        assert_eq!(table.get("program_status").unwrap().address, 0x2000_0008);
        assert_eq!(table.get("program_expected_sha256").unwrap().address, 0x2000_0024);
        assert_eq!(table.get("boot_magic").unwrap().address, 0x2000_0068);
        assert_eq!(table.get("log_idx").unwrap().address, 0x2000_0070);
        assert_eq!(table.get("logbuf").unwrap().address, 0x2000_0074);
        assert_eq!(table.get("lfs_cfg").unwrap().address, 0x2000_1078);
        assert_eq!(table.get("lfs_cfg_block_size").unwrap().address, 0x2000_1078 + 28);
        assert_eq!(table.get("lfs_cfg_block_count").unwrap().address, 0x2000_1078 + 32);
        assert_eq!(table.get("flash_buffer"), table.get("framebuffer2"));
    }

    #[test]
    fn test_toml_layout() {
        let text = r#"
            [system]
            base = "0x2000_0000"
            fields = [
                { name = "boot_magic", size = 4 },
                { name = "log_idx", size = 4 },
                { name = "logbuf", size = 256 },
                { name = "lfs_cfg_context", size = 4 },
                { name = "lfs_cfg_read_size", size = 4 },
                { name = "lfs_cfg_prog_size", size = 4 },
                { name = "lfs_cfg_block_size", size = 4 },
                { name = "lfs_cfg_block_count", size = 4 },
            ]

            [comm]
            base = 0x24000000
            fields = [
                { name = "flashapp_state", size = 4 },
                { name = "program_status", size = 4 },
                { name = "utc_timestamp", size = 4 },
                { name = "program_chunk_idx", size = 4 },
                { name = "program_chunk_count", size = 4 },
            ]

            [context]
            fields = [
                { name = "size", size = 4 },
                { name = "address", size = 4 },
                { name = "erase", size = 4 },
                { name = "erase_bytes", size = 4 },
                { name = "decompressed_size", size = 4 },
                { name = "expected_sha256", size = 32 },
                { name = "expected_sha256_decompressed", size = 32 },
                { name = "ready", size = 4 },
                { name = "buffer", size = 4096 },
            ]
        "#;
        let spec = LayoutSpec::from_toml_str(text).unwrap();
        assert_eq!(spec.system.base, 0x2000_0000);
        let layout = ProtocolLayout::from_spec(&spec).unwrap();
        assert_eq!(layout.chunk_size(), 4096);
        assert_eq!(layout.contexts[0].size.address, 0x2400_0014);
        assert_eq!(
            layout.contexts[0].buffer.address,
            layout.contexts[0].ready.address + 4
        );
    }

    #[test]
    fn test_spec_missing_field() {
        let mut spec = LayoutSpec::dual_context();
        spec.context.fields.retain(|f| f.name != "ready");
        assert!(matches!(
            ProtocolLayout::from_spec(&spec),
            Err(Error::Layout(_))
        ));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x9000_0000"), Ok(0x9000_0000));
        assert_eq!(parse_number("4096"), Ok(4096));
        assert!(parse_number("0xZZ").is_err());
    }
}
