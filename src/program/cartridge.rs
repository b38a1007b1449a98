//! Binary cartridge container: header, section table, and the PROGRAM
//! section's packed bytecode blob. Parsing is hand-rolled little-endian
//! reads over a byte cursor — this is a fixed wire format, not a place an
//! ecosystem serialization crate buys anything over reading the fields
//! by hand.

use crate::error::{Result, SfError};
use crate::opcodes;
use crate::program::binding::{Binding, BindingFlags};
use crate::program::instruction::Instruction;
use crate::program::symbol::{Symbol, SymbolFlags};
use crate::program::task::{self, Task};
use crate::program::tensor_desc::{TensorDesc, TensorFlags};
use crate::types::{DType, SF_MAX_DIMS};

pub const MAGIC: u32 = 0x4D46_4C57; // "MFLW", packed as a little-endian u32
pub const VERSION: u32 = 20;

const MAX_SYMBOL_NAME: usize = 64;
const MAX_TITLE_NAME: usize = 128;
const MAX_SECTIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    Program,
    Pipeline,
    Image,
    Font,
    Raw,
}

impl SectionType {
    fn from_u32(v: u32) -> Option<SectionType> {
        match v {
            0x01 => Some(SectionType::Program),
            0x02 => Some(SectionType::Pipeline),
            0x03 => Some(SectionType::Image),
            0x04 => Some(SectionType::Font),
            0x05 => Some(SectionType::Raw),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SectionEntry {
    name: String,
    section_type: SectionType,
    offset: u32,
    size: u32,
}

/// App-level settings carried in the cartridge header, independent of the
/// compiled program itself.
#[derive(Debug, Clone)]
pub struct CartridgeHeader {
    pub app_title: String,
    pub window_width: u32,
    pub window_height: u32,
    pub num_threads: u32,
    pub vsync: bool,
    pub fullscreen: bool,
    pub resizable: bool,
}

/// The compiled program: bytecode plus the metadata needed to allocate
/// registers, name them, and schedule tasks over the thread pool.
#[derive(Debug, Clone)]
pub struct Program {
    pub instruction_count: u32,
    pub tensor_count: u32,
    pub reduction_scratch_size: u32,
    pub sync_scratch_size: u32,
    pub instructions: Vec<Instruction>,
    pub tensor_descs: Vec<TensorDesc>,
    /// Constant payload bytes for each constant tensor, indexed in the
    /// same order as `tensor_descs` (empty `Vec` for non-constants).
    pub tensor_data: Vec<Vec<u8>>,
    pub symbols: Vec<Symbol>,
    pub tasks: Vec<Task>,
    pub bindings: Vec<Binding>,
}

/// A loaded cartridge: app header, section table, and a parsed [`Program`]
/// if a PROGRAM section was present.
pub struct Cartridge {
    pub header: CartridgeHeader,
    sections: Vec<SectionEntry>,
    raw: Vec<u8>,
    pub program: Option<Program>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            return Err(SfError::Load(format!(
                "unexpected end of data at offset {} (need {} more bytes, have {})",
                self.pos,
                n,
                self.data.len() - self.pos.min(self.data.len())
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let b = &self.data[self.pos..self.pos + 4];
        let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let b = &self.data[self.pos..self.pos + 8];
        let v = u64::from_le_bytes(b.try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let v = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    /// A fixed-width, NUL-terminated (or fully-packed) C string field.
    fn fixed_str(&mut self, width: usize) -> Result<String> {
        let bytes = self.bytes(width)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

impl Cartridge {
    /// Parses a full cartridge file image, validating the header, section
    /// table, and (if present) the PROGRAM section's bytecode blob.
    pub fn load(data: &[u8]) -> Result<Cartridge> {
        let mut c = Cursor::new(data);

        let magic = c.u32()?;
        if magic != MAGIC {
            return Err(SfError::Load(format!(
                "bad magic: expected {:#010x}, found {:#010x}",
                MAGIC, magic
            )));
        }
        let version = c.u32()?;
        if version != VERSION {
            return Err(SfError::Load(format!(
                "unsupported cartridge version {} (expected {})",
                version, VERSION
            )));
        }

        let app_title = c.fixed_str(MAX_TITLE_NAME)?;
        let window_width = c.u32()?;
        let window_height = c.u32()?;
        let num_threads = c.u32()?;
        let vsync = c.u8()? != 0;
        let fullscreen = c.u8()? != 0;
        let resizable = c.u8()? != 0;
        c.skip(1)?; // reserved_flags[1]

        let section_count = c.u32()?;
        if section_count as usize > MAX_SECTIONS {
            return Err(SfError::Load(format!(
                "section_count {} exceeds SF_MAX_SECTIONS ({})",
                section_count, MAX_SECTIONS
            )));
        }

        let mut sections = Vec::with_capacity(section_count as usize);
        for _ in 0..MAX_SECTIONS {
            let name = c.fixed_str(MAX_SYMBOL_NAME)?;
            let section_type = c.u32()?;
            let offset = c.u32()?;
            let size = c.u32()?;
            c.skip(4 * 4)?; // reserved[4]
            if sections.len() < section_count as usize {
                let section_type = SectionType::from_u32(section_type).ok_or_else(|| {
                    SfError::Load(format!("unknown section type {}", section_type))
                })?;
                sections.push(SectionEntry {
                    name,
                    section_type,
                    offset,
                    size,
                });
            }
        }
        c.skip(8 * 4)?; // header reserved[8]

        for s in &sections {
            let end = s.offset as usize + s.size as usize;
            if end > data.len() {
                return Err(SfError::Load(format!(
                    "section '{}' [{}, {}) runs past end of file ({})",
                    s.name, s.offset, end, data.len()
                )));
            }
        }

        let program = sections
            .iter()
            .find(|s| s.section_type == SectionType::Program)
            .map(|s| {
                let slice = &data[s.offset as usize..s.offset as usize + s.size as usize];
                parse_program(slice)
            })
            .transpose()?;

        Ok(Cartridge {
            header: CartridgeHeader {
                app_title,
                window_width,
                window_height,
                num_threads,
                vsync,
                fullscreen,
                resizable,
            },
            sections,
            raw: data.to_vec(),
            program,
        })
    }

    /// Returns the raw bytes of a non-PROGRAM section by name, e.g. an
    /// embedded `PIPELINE`/`IMAGE`/`FONT`/`RAW` blob. `PROGRAM` sections
    /// are reached through [`Cartridge::program`] instead.
    pub fn section(&self, name: &str) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| &self.raw[s.offset as usize..s.offset as usize + s.size as usize])
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }
}

fn parse_program(data: &[u8]) -> Result<Program> {
    let mut c = Cursor::new(data);

    let instruction_count = c.u32()?;
    let tensor_count = c.u32()?;
    let symbol_count = c.u32()?;
    let task_count = c.u32()?;
    let binding_count = c.u32()?;
    let reduction_scratch_size = c.u32()?;
    let sync_scratch_size = c.u32()?;
    c.skip(8 * 4)?; // reserved[8]

    let mut instructions = Vec::with_capacity(instruction_count as usize);
    for _ in 0..instruction_count {
        let bytes = c.bytes(Instruction::ENCODED_SIZE)?;
        let inst = Instruction::decode(bytes);
        if opcodes::metadata(inst.opcode).is_none() {
            return Err(SfError::InvalidOp(inst.opcode));
        }
        instructions.push(inst);
    }

    let mut tensor_descs = Vec::with_capacity(tensor_count as usize);
    let mut tensor_data = Vec::with_capacity(tensor_count as usize);
    for _ in 0..tensor_count {
        let dtype_tag = c.u8()?;
        let dtype = DType::from_tag(dtype_tag)
            .ok_or_else(|| SfError::Load(format!("unknown dtype tag {}", dtype_tag)))?;
        let ndim = c.u8()?;
        if ndim as usize > SF_MAX_DIMS {
            return Err(SfError::Load(format!(
                "tensor rank {} exceeds SF_MAX_DIMS ({})",
                ndim, SF_MAX_DIMS
            )));
        }
        let is_constant = c.u8()? != 0;
        let flags = TensorFlags::from_bits_truncate(c.u8()?);
        c.skip(4)?; // reserved[4]
        let mut shape = [0i32; SF_MAX_DIMS];
        for slot in shape.iter_mut() {
            *slot = c.i32()?;
        }
        let data_size = c.u64()?;

        let payload = if is_constant {
            c.bytes(data_size as usize)?.to_vec()
        } else {
            Vec::new()
        };

        tensor_descs.push(TensorDesc {
            dtype,
            ndim,
            is_constant,
            flags,
            shape,
            data_size,
        });
        tensor_data.push(payload);
    }

    let mut symbols = Vec::with_capacity(symbol_count as usize);
    for _ in 0..symbol_count {
        let name = c.fixed_str(MAX_SYMBOL_NAME)?;
        let provider = c.fixed_str(MAX_SYMBOL_NAME)?;
        let name_hash = c.u32()?;
        let register_idx = c.u32()?;
        if register_idx >= tensor_count {
            return Err(SfError::Load(format!(
                "symbol '{}' references register {} >= tensor_count {}",
                name, register_idx, tensor_count
            )));
        }
        let related_name_hash = c.u32()?;
        let flags = SymbolFlags::from_bits_truncate(c.u8()?);
        let builtin_id = c.u16()?;
        let builtin_axis = c.u8()?;
        symbols.push(Symbol {
            name,
            provider,
            name_hash,
            register_idx,
            related_name_hash,
            flags,
            builtin_id,
            builtin_axis,
        });
    }

    let mut tasks = Vec::with_capacity(task_count as usize);
    for _ in 0..task_count {
        let start_inst = c.u32()?;
        let inst_count = c.u32()?;
        let domain_reg = c.u32()?;
        if domain_reg >= tensor_count {
            return Err(SfError::Load(format!(
                "task domain_reg {} >= tensor_count {}",
                domain_reg, tensor_count
            )));
        }
        let strategy_byte = c.u8()?;
        let strategy = task::strategy_from_u8(strategy_byte).ok_or_else(|| {
            SfError::Load(format!("unknown dispatch strategy {}", strategy_byte))
        })?;
        c.skip(3)?; // reserved[3]
        let binding_offset = c.u32()?;
        let binding_count = c.u32()?;
        if start_inst + inst_count > instruction_count {
            return Err(SfError::Load(format!(
                "task instruction range [{}, {}) exceeds instruction_count {}",
                start_inst,
                start_inst + inst_count,
                instruction_count
            )));
        }
        tasks.push(Task {
            start_inst,
            inst_count,
            domain_reg,
            strategy,
            binding_offset,
            binding_count,
        });
    }

    let mut bindings = Vec::with_capacity(binding_count as usize);
    for _ in 0..binding_count {
        let reg_idx = c.u16()?;
        if reg_idx as u32 >= tensor_count {
            return Err(SfError::Load(format!(
                "binding reg_idx {} >= tensor_count {}",
                reg_idx, tensor_count
            )));
        }
        let flags = BindingFlags::from_bits_truncate(c.u16()?);
        let byte_stride = c.i32()?;
        bindings.push(Binding {
            reg_idx,
            flags,
            byte_stride,
        });
    }

    for t in &tasks {
        let end = t.binding_offset + t.binding_count;
        if end > bindings.len() as u32 {
            return Err(SfError::Load(format!(
                "task binding range [{}, {}) exceeds binding table length {}",
                t.binding_offset,
                end,
                bindings.len()
            )));
        }
    }

    Ok(Program {
        instruction_count,
        tensor_count,
        reduction_scratch_size,
        sync_scratch_size,
        instructions,
        tensor_descs,
        tensor_data,
        symbols,
        tasks,
        bindings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_fixed(buf: &mut Vec<u8>, s: &str, width: usize) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.resize(width, 0);
        buf.extend_from_slice(&bytes);
    }

    /// Builds a minimal, valid single-section cartridge with one `add`
    /// instruction over two input registers and one output register.
    fn build_minimal_cartridge() -> Vec<u8> {
        let mut program_body = Vec::new();
        program_body.extend_from_slice(&1u32.to_le_bytes()); // instruction_count
        program_body.extend_from_slice(&3u32.to_le_bytes()); // tensor_count
        program_body.extend_from_slice(&2u32.to_le_bytes()); // symbol_count
        program_body.extend_from_slice(&1u32.to_le_bytes()); // task_count
        program_body.extend_from_slice(&2u32.to_le_bytes()); // binding_count
        program_body.extend_from_slice(&0u32.to_le_bytes()); // reduction_scratch_size
        program_body.extend_from_slice(&0u32.to_le_bytes()); // sync_scratch_size
        program_body.extend_from_slice(&[0u8; 32]); // reserved[8]

        // one instruction: add r2 = r0 + r1
        program_body.extend_from_slice(&1u16.to_le_bytes()); // opcode Add
        program_body.extend_from_slice(&2u16.to_le_bytes()); // dest
        program_body.extend_from_slice(&0u16.to_le_bytes()); // src1
        program_body.extend_from_slice(&1u16.to_le_bytes()); // src2
        program_body.extend_from_slice(&0u16.to_le_bytes()); // src3
        program_body.extend_from_slice(&0u16.to_le_bytes()); // src4
        program_body.extend_from_slice(&0u16.to_le_bytes()); // line
        program_body.extend_from_slice(&0u16.to_le_bytes()); // column

        // three tensor descs, all f32 rank-1 shape [4], none constant
        for _ in 0..3 {
            program_body.push(DType::F32.tag());
            program_body.push(1); // ndim
            program_body.push(0); // is_constant
            program_body.push(0); // flags
            program_body.extend_from_slice(&[0u8; 4]); // reserved
            let mut shape = [0i32; SF_MAX_DIMS];
            shape[0] = 4;
            for d in shape {
                program_body.extend_from_slice(&d.to_le_bytes());
            }
            program_body.extend_from_slice(&0u64.to_le_bytes()); // data_size
        }

        // two symbols: "a" -> reg 0, "b" -> reg 1
        for (i, name) in ["a", "b"].iter().enumerate() {
            push_fixed(&mut program_body, name, MAX_SYMBOL_NAME);
            push_fixed(&mut program_body, "", MAX_SYMBOL_NAME);
            program_body.extend_from_slice(&0u32.to_le_bytes()); // name_hash
            program_body.extend_from_slice(&(i as u32).to_le_bytes()); // register_idx
            program_body.extend_from_slice(&0u32.to_le_bytes()); // related_name_hash
            program_body.push(1 << 6); // INPUT
            program_body.extend_from_slice(&0u16.to_le_bytes()); // builtin_id
            program_body.push(0); // builtin_axis
        }

        // one task over domain register 2, strategy Default
        program_body.extend_from_slice(&0u32.to_le_bytes()); // start_inst
        program_body.extend_from_slice(&1u32.to_le_bytes()); // inst_count
        program_body.extend_from_slice(&2u32.to_le_bytes()); // domain_reg
        program_body.push(0); // strategy Default
        program_body.extend_from_slice(&[0u8; 3]); // reserved
        program_body.extend_from_slice(&0u32.to_le_bytes()); // binding_offset
        program_body.extend_from_slice(&2u32.to_le_bytes()); // binding_count

        // two bindings: reg 0 and reg 1
        for reg in [0u16, 1u16] {
            program_body.extend_from_slice(&reg.to_le_bytes());
            program_body.extend_from_slice(&0u16.to_le_bytes()); // flags
            program_body.extend_from_slice(&4i32.to_le_bytes()); // byte_stride
        }

        let mut file = Vec::new();
        file.extend_from_slice(&MAGIC.to_le_bytes());
        file.extend_from_slice(&VERSION.to_le_bytes());
        push_fixed(&mut file, "test-cartridge", MAX_TITLE_NAME);
        file.extend_from_slice(&640u32.to_le_bytes());
        file.extend_from_slice(&480u32.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes()); // num_threads: auto
        file.push(1); // vsync
        file.push(0); // fullscreen
        file.push(1); // resizable
        file.push(0); // reserved_flags

        file.extend_from_slice(&1u32.to_le_bytes()); // section_count

        let program_offset = 0u32; // patched below
        let mut section_table = Vec::new();
        push_fixed(&mut section_table, "PROGRAM", MAX_SYMBOL_NAME);
        section_table.extend_from_slice(&1u32.to_le_bytes()); // type = Program
        section_table.extend_from_slice(&program_offset.to_le_bytes());
        section_table.extend_from_slice(&(program_body.len() as u32).to_le_bytes());
        section_table.extend_from_slice(&[0u8; 16]); // reserved[4]
        // pad remaining MAX_SECTIONS - 1 empty entries
        for _ in 1..MAX_SECTIONS {
            push_fixed(&mut section_table, "", MAX_SYMBOL_NAME);
            section_table.extend_from_slice(&0u32.to_le_bytes());
            section_table.extend_from_slice(&0u32.to_le_bytes());
            section_table.extend_from_slice(&0u32.to_le_bytes());
            section_table.extend_from_slice(&[0u8; 16]);
        }

        let header_len_before_sections = file.len() + section_table.len() + 32 /* header reserved */;
        let _ = header_len_before_sections;

        file.extend_from_slice(&section_table);
        file.extend_from_slice(&[0u8; 32]); // header reserved[8]

        let real_program_offset = file.len() as u32;
        file.extend_from_slice(&program_body);

        // patch the offset we wrote as 0 above
        let offset_field_pos = MAGIC.to_le_bytes().len()
            + VERSION.to_le_bytes().len()
            + MAX_TITLE_NAME
            + 4 * 3
            + 4
            + 4
            + MAX_SYMBOL_NAME
            + 4;
        file[offset_field_pos..offset_field_pos + 4]
            .copy_from_slice(&real_program_offset.to_le_bytes());

        file
    }

    #[test]
    fn loads_minimal_cartridge_and_parses_program() {
        let bytes = build_minimal_cartridge();
        let cart = Cartridge::load(&bytes).unwrap();
        assert_eq!(cart.header.app_title, "test-cartridge");
        let program = cart.program.as_ref().unwrap();
        assert_eq!(program.instruction_count, 1);
        assert_eq!(program.tensor_count, 3);
        assert_eq!(program.symbols.len(), 2);
        assert_eq!(program.tasks.len(), 1);
        assert_eq!(program.bindings.len(), 2);
        assert_eq!(program.instructions[0].opcode, 1);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = build_minimal_cartridge();
        bytes[0] ^= 0xFF;
        assert!(Cartridge::load(&bytes).is_err());
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut bytes = build_minimal_cartridge();
        // instruction opcode field sits right after the program header
        // inside the PROGRAM section; find it via the section table offset.
        let section_table_start = 4 + 4 + MAX_TITLE_NAME + 4 * 3 + 4 + 4;
        let program_offset = u32::from_le_bytes(
            bytes[section_table_start + MAX_SYMBOL_NAME + 4..section_table_start + MAX_SYMBOL_NAME + 8]
                .try_into()
                .unwrap(),
        ) as usize;
        let opcode_pos = program_offset + 28 + 32; // 7 header u32s + reserved[8]
        bytes[opcode_pos..opcode_pos + 2].copy_from_slice(&9999u16.to_le_bytes());
        assert!(Cartridge::load(&bytes).is_err());
    }
}
