//! Loading the target, and building the process it starts as.

use crate::error::*;
use crate::machine::{self, Lifter};
use byteorder::{LittleEndian, WriteBytesExt};
use falcon::loader::{Elf, Loader};
use falcon::{il, RC};
use finch::executor::{Driver, Memory, State};
use finch::platform::Dummy;
use goblin::elf::header::EM_X86_64;
use goblin::elf::program_header::{PF_X, PT_INTERP, PT_LOAD};
use std::fs;
use std::ops::Range;
use std::path::Path;

pub const TLS_ADDRESS: u64 = 0xc000_0000_0000;
pub const TLS_SIZE: u64 = 0x8000;
pub const STACK_BASE: u64 = 0xbff0_0000_0000;
pub const STACK_SIZE: u64 = 0x10000;

const PAGE_SIZE: u64 = 0x1000;

const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_ENTRY: u64 = 9;

const GENERAL_PURPOSE_REGISTERS: [&str; 16] = [
    "rax", "rbx", "rcx", "rdx", "rdi", "rsi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

const FLAGS: [&str; 7] = ["CF", "PF", "AF", "ZF", "SF", "DF", "OF"];

/// What we need to know about an ELF image before handing it to falcon.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageInfo {
    pub machine: u16,
    pub entry: u64,
    pub interpreter: Option<String>,
    /// Where the program headers sit once the image is loaded
    pub phdr_address: u64,
    pub phentsize: u64,
    pub phnum: u64,
    /// Virtual address ranges of executable `PT_LOAD` segments
    pub code: Vec<Range<u64>>,
}

impl ImageInfo {
    pub fn parse(bytes: &[u8]) -> Result<ImageInfo> {
        let elf = goblin::elf::Elf::parse(bytes)?;

        // The program headers are found at e_phoff from the lowest PT_LOAD
        let base_address = elf
            .program_headers
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .map(|phdr| phdr.p_vaddr)
            .min()
            .unwrap_or(0);

        let code = elf
            .program_headers
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD && phdr.p_flags & PF_X != 0)
            .map(|phdr| phdr.p_vaddr..(phdr.p_vaddr + phdr.p_memsz))
            .collect::<Vec<Range<u64>>>();

        let interpreter = if elf
            .program_headers
            .iter()
            .any(|phdr| phdr.p_type == PT_INTERP)
        {
            Some(elf.interpreter.unwrap_or("").to_string())
        } else {
            None
        };

        Ok(ImageInfo {
            machine: elf.header.e_machine,
            entry: elf.header.e_entry,
            interpreter,
            phdr_address: base_address + elf.header.e_phoff,
            phentsize: elf.header.e_phentsize as u64,
            phnum: elf.header.e_phnum as u64,
            code,
        })
    }

    /// Statically-linked x86-64 is all we can drive.
    pub fn check_static_amd64(&self) -> Result<()> {
        if self.machine != EM_X86_64 {
            bail!(ErrorKind::TargetMismatch(format!(
                "e_machine is {}, expected x86-64",
                self.machine
            )));
        }
        if let Some(ref interpreter) = self.interpreter {
            bail!(ErrorKind::TargetMismatch(format!(
                "dynamically linked against {}",
                interpreter
            )));
        }
        Ok(())
    }

    pub fn contains_code(&self, address: u64) -> bool {
        self.code.iter().any(|range| range.contains(&address))
    }
}

/// One entry of `argv`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Argument {
    Concrete(String),
    /// `length` bytes named `<name>_<i>`. When `nonnull` is set, each byte is
    /// constrained to be non-zero, so `strlen` sees the whole argument.
    Symbolic {
        name: String,
        length: usize,
        nonnull: bool,
    },
}

impl Argument {
    pub fn concrete<S: Into<String>>(string: S) -> Argument {
        Argument::Concrete(string.into())
    }

    pub fn symbolic<S: Into<String>>(name: S, length: usize) -> Argument {
        Argument::Symbolic {
            name: name.into(),
            length,
            nonnull: true,
        }
    }

    /// Size in memory, including the terminating NUL
    pub fn size(&self) -> u64 {
        match self {
            Argument::Concrete(string) => string.len() as u64 + 1,
            Argument::Symbolic { length, .. } => *length as u64 + 1,
        }
    }

    /// Store this argument at `address`, returning the constraints it places
    /// on its symbolic bytes.
    fn store(&self, memory: &mut Memory, address: u64) -> Result<Vec<il::Expression>> {
        let mut constraints = Vec::new();
        match self {
            Argument::Concrete(string) => {
                for (i, byte) in string.bytes().enumerate() {
                    memory.store(address + i as u64, &il::expr_const(byte as u64, 8))?;
                }
            }
            Argument::Symbolic {
                name,
                length,
                nonnull,
            } => {
                for i in 0..*length {
                    let byte = il::expr_scalar(format!("{}_{}", name, i), 8);
                    memory.store(address + i as u64, &byte)?;
                    if *nonnull {
                        constraints.push(il::Expression::cmpneq(byte, il::expr_const(0, 8))?);
                    }
                }
            }
        }
        memory.store(address + self.size() - 1, &il::expr_const(0, 8))?;
        Ok(constraints)
    }
}

/// Lay out the initial stack of a 64-bit Linux process at `stack_address`,
/// and point `rsp` at it.
///
/// ```text
/// rsp -> argc
///        argv[0] .. argv[argc - 1], NULL
///        NULL (empty envp)
///        auxv pairs, terminated by AT_NULL
///        (16 bytes padding)
///        argument strings
/// ```
pub fn initialize_process64(
    state: &mut State,
    stack_address: u64,
    image: &ImageInfo,
    arguments: &[Argument],
) -> Result<()> {
    let auxv = [
        (AT_PHDR, image.phdr_address),
        (AT_PHENT, image.phentsize),
        (AT_PHNUM, image.phnum),
        (AT_PAGESZ, PAGE_SIZE),
        (AT_ENTRY, image.entry),
        (AT_NULL, 0),
    ];

    // argc, argv, NULL, envp NULL, auxv
    let words = 1 + arguments.len() + 1 + 1 + auxv.len() * 2;
    let mut strings_address = stack_address + (words as u64 * 8) + 16;

    let mut table: Vec<u8> = Vec::with_capacity(words * 8);
    table.write_u64::<LittleEndian>(arguments.len() as u64)?;

    let mut constraints = Vec::new();
    for argument in arguments {
        table.write_u64::<LittleEndian>(strings_address)?;
        constraints.append(&mut argument.store(state.memory_mut(), strings_address)?);
        strings_address += argument.size();
    }

    table.write_u64::<LittleEndian>(0)?;
    table.write_u64::<LittleEndian>(0)?;

    for (key, value) in auxv.iter() {
        table.write_u64::<LittleEndian>(*key)?;
        table.write_u64::<LittleEndian>(*value)?;
    }

    for (i, byte) in table.into_iter().enumerate() {
        state
            .memory_mut()
            .store(stack_address + i as u64, &il::expr_const(byte as u64, 8))?;
    }

    for constraint in constraints {
        state.add_path_constraint(&constraint)?;
    }

    machine::set_register(state, "rsp", stack_address)
}

/// The target, loaded and ready to be driven.
pub struct Project {
    elf: Elf,
    image: ImageInfo,
}

impl Project {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Project> {
        let path = path.as_ref();

        let bytes = fs::read(path).chain_err(|| format!("Could not read {}", path.display()))?;
        let image = ImageInfo::parse(&bytes)?;
        image.check_static_amd64()?;

        let elf = Elf::from_file(path)?;

        debug!(
            "Loaded {} entry=0x{:x} code={:x?}",
            path.display(),
            image.entry,
            image.code
        );

        Ok(Project {
            elf,
            image,
        })
    }

    pub fn image(&self) -> &ImageInfo {
        &self.image
    }

    /// Make sure every address lands in code, which is the best sign we have
    /// that this is the binary the addresses were taken from.
    pub fn verify(&self, addresses: &[u64]) -> Result<()> {
        for address in addresses {
            if !self.image.contains_code(*address) {
                bail!(ErrorKind::TargetMismatch(format!(
                    "0x{:x} is not in an executable segment",
                    address
                )));
            }
        }
        Ok(())
    }

    pub fn lifter(&self) -> Lifter {
        Lifter::new(RC::new(self.elf.architecture().box_clone()))
    }

    /// A driver sitting on the entry point of a freshly started process.
    pub fn entry_state(&self, arguments: &[Argument]) -> Result<Driver> {
        let architecture = self.elf.architecture();
        let entry = self.elf.program_entry();

        let mut program = il::Program::new();
        program.add_function(self.elf.function(entry)?);

        let location: il::ProgramLocation = il::RefProgramLocation::from_address(&program, entry)
            .ok_or_else(|| format!("Failed to get program location for 0x{:x}", entry))?
            .into();

        let memory = Memory::new_with_backing(architecture.endian(), RC::new(self.elf.memory()?));
        let mut state = State::new(memory, Box::new(Dummy::new()));
        self.initialize(&mut state, arguments)?;

        Ok(Driver::new(
            program,
            location,
            state,
            RC::new(architecture.box_clone()),
        ))
    }

    fn initialize(&self, state: &mut State, arguments: &[Argument]) -> Result<()> {
        for i in 0..TLS_SIZE {
            state
                .memory_mut()
                .store(TLS_ADDRESS + i, &il::expr_const(0, 8))?;
        }

        // Some stack space below the initial frame
        for i in 1..STACK_SIZE {
            state
                .memory_mut()
                .store(STACK_BASE - i, &il::expr_const(0, 8))?;
        }

        for flag in FLAGS.iter() {
            state.set_scalar(*flag, &il::expr_const(0, 1))?;
        }
        for register in GENERAL_PURPOSE_REGISTERS.iter() {
            state.set_scalar(*register, &il::expr_const(0, 64))?;
        }
        state.set_scalar("fs_base", &il::expr_const(TLS_ADDRESS, 64))?;

        initialize_process64(state, STACK_BASE, &self.image, arguments)
    }
}
